//! # perfdump - Per-Region Performance Counter Dumps for Peer Groups
//!
//! A Rust library for profiling programs that run as a group of cooperating
//! processes (peers). Every peer measures its own hardware or kernel counters
//! over named regions of code, and at the end of every region all peers merge
//! their results into **one shared artifact** without locks and without a
//! coordinator.
//!
//! ## The Problem
//!
//! A parallel job with hundreds of ranks that profiles itself produces
//! hundreds of small result sets at the same moment. Writing one file per
//! rank floods the file system; funnelling everything through rank 0 turns
//! one process into a bottleneck; a shared lock serializes the whole group.
//!
//! ## The Solution: Collective Rounds
//!
//! Every `end_region` is a **round**: all peers write the same region at the
//! same time, and agree on where each peer's bytes go through one all-gather
//! of sizes.
//!
//! ```text
//!   rank 0 ─┐  lengths  ┌──────────────────────────┐
//!   rank 1 ─┼─────────► │ all-gather + prefix sum  │ ──► disjoint offsets
//!   rank 2 ─┘           └──────────────────────────┘
//!
//!   artifact:  ...previous rounds... │ rank 0 │ rank 1 │ rank 2 │
//! ```
//!
//! ### Design Principles
//!
//! 1. **Explicit session**: all state lives in a [`Session`] value; there are
//!    no globals.
//! 2. **Forgiving call order**: a call in the wrong state is logged and
//!    ignored, never fatal ([`Outcome::Ignored`]).
//! 3. **Fail the group, not one peer**: a fatal error aborts the whole
//!    [`PeerGroup`](peers::PeerGroup) so that nobody waits forever on a
//!    collective.
//! 4. **Pluggable seams**: counter backends, peer groups and writers are
//!    traits. Peers can be threads ([`LocalGroup`](peers::LocalGroup)) or
//!    processes on any number of hosts ([`TcpPeer`](peers::TcpPeer)).
//!
//! ## Session Lifecycle
//!
//! | Call | From | To |
//! |------|------|----|
//! | [`init`](Session::init) | Uninitialized | Ready |
//! | [`start_region`](Session::start_region) | Ready | InRegion |
//! | [`start_profile`](Session::start_profile) | InRegion | Profiling |
//! | [`end_profile`](Session::end_profile) | Profiling | InRegion |
//! | [`end_region`](Session::end_region) | InRegion | Ready |
//! | [`finalize`](Session::finalize) | Ready | Uninitialized |
//!
//! ## Output Formats
//!
//! | Format | Writer | Artifact |
//! |--------|--------|----------|
//! | [`OutputFormat::Csv`] | [`DelimitedWriter`](writers::DelimitedWriter) | `<dir>/<name>.csv`, `rank,region,metric,value` lines |
//! | [`OutputFormat::Array`] | [`ArrayWriter`](writers::ArrayWriter) | `<dir>/<name>.<peers>.pda`, one `[peers, 1, rounds]` dataset per metric |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use perfdump::{Session, SessionConfig};
//! use perfdump::peers::Solo;
//!
//! # fn main() -> perfdump::Result<()> {
//! // PDUMP_EVENTS=MINFLT,UTIME PDUMP_OUTPUT_FORMAT=csv ./app
//! let mut session = Session::new(SessionConfig::from_env()?, Solo);
//!
//! session.init()?;
//! session.start_region(None)?; // "region_1"
//! session.start_profile()?;
//! // ... measured work ...
//! session.end_profile()?;
//! session.end_region()?;
//! session.finalize()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! | Feature | Module | Description |
//! |---------|--------|-------------|
//! | `table` | [`report`] | Render written records as tables |
//! | `perf` | [`backend::perf`] | `perf_event_open` hardware counters |
//! | `full` | All of the above | |

pub mod backend;
pub mod config;
pub mod counters;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod peers;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod writers;

#[cfg(feature = "table")]
pub mod report;

pub use config::{OutputFormat, SessionConfig};
pub use error::{Error, Result};
pub use session::{Outcome, Session, State};
