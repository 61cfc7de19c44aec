//! Counter backends.
//!
//! A backend is the opaque capability that actually counts: it resolves the
//! requested counters once, then starts and stops them around each profile
//! span. The session never interprets what a counter means.
//!
//! | Backend | Feature | Counters |
//! |---------|---------|----------|
//! | [`ProcStat`] | always | per-thread page faults, CPU ticks and context switches from `/proc` |
//! | [`PerfEvents`] | `perf` | hardware and software counters through `perf_event_open` |
//!
//! Requested counters the backend does not know are skipped with a warning;
//! only an empty result is fatal, and the session decides that.

pub mod proc_stat;

#[cfg(feature = "perf")]
pub mod perf;

pub use proc_stat::ProcStat;

#[cfg(feature = "perf")]
pub use perf::PerfEvents;

use tracing::warn;

use crate::config::{BackendKind, EventSelector, SessionConfig};
#[cfg(not(feature = "perf"))]
use crate::error::Error;
use crate::error::Result;

/// Start/stop access to a fixed set of counters.
///
/// Creating the backend acquires its resources; dropping it (or
/// [`shutdown`](CounterBackend::shutdown)) releases them.
pub trait CounterBackend: Send {
    /// Names of the resolved counters, in the order `stop` reports them.
    fn names(&self) -> &[String];

    /// Starts counting. Fails if already started.
    fn start(&mut self) -> Result<()>;

    /// Stops counting and returns each counter's delta since `start`,
    /// aligned with [`names`](CounterBackend::names). Fails if not started.
    fn stop(&mut self) -> Result<Vec<u64>>;

    /// Releases backend resources ahead of drop.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates the backend selected by `config`.
pub fn create(config: &SessionConfig) -> Result<Box<dyn CounterBackend>> {
    match config.backend {
        BackendKind::ProcStat => Ok(Box::new(ProcStat::new(&config.events)?)),
        #[cfg(feature = "perf")]
        BackendKind::Perf => Ok(Box::new(PerfEvents::new(&config.events)?)),
        #[cfg(not(feature = "perf"))]
        BackendKind::Perf => Err(Error::Config(
            "perf backend requested but perfdump was built without the `perf` feature".to_string(),
        )),
    }
}

/// Maps a selector onto positions in a backend's `catalog`.
///
/// Names are matched exactly, codes are catalog positions. Unknown entries
/// are skipped with a warning, repeated ones are kept once.
pub(crate) fn resolve(selector: &EventSelector, catalog: &[&str]) -> Vec<usize> {
    let mut resolved = Vec::new();
    let mut push = |index: usize| {
        if !resolved.contains(&index) {
            resolved.push(index);
        }
    };

    match selector {
        EventSelector::Names(names) => {
            for name in names {
                match catalog.iter().position(|c| *c == name.as_str()) {
                    Some(index) => push(index),
                    None => warn!(counter = %name, "unable to resolve counter name"),
                }
            }
        }
        EventSelector::Codes(codes) => {
            for &code in codes {
                match usize::try_from(code).ok().filter(|&i| i < catalog.len()) {
                    Some(index) => push(index),
                    None => warn!(code, "unable to resolve counter code"),
                }
            }
        }
    }
    resolved
}
