//! Unified error type for sessions, backends, peer groups and writers.
//!
//! Every fallible operation in the crate returns [`Result`]. An `Err` coming
//! out of a [`Session`](crate::session::Session) call is always fatal: the
//! peer group has already been told to abort by the time the caller sees it.
//! Calls made in the wrong state are not errors; they are logged and ignored.
//!
//! # Example
//!
//! ```rust,no_run
//! use perfdump::peers::PeerGroup;
//! use perfdump::{Error, Result, Session};
//!
//! fn run<P: PeerGroup>(session: &mut Session<P>) -> Result<()> {
//!     session.init()?;
//!     session.finalize()?;
//!     Ok(())
//! }
//!
//! # fn main() {
//! # let config = perfdump::SessionConfig::from_env().unwrap();
//! let mut session = Session::new(config, perfdump::peers::Solo);
//! match run(&mut session) {
//!     Err(Error::NoCounters(events)) => eprintln!("nothing to count: {}", events),
//!     Err(e) if e.is_aborted() => eprintln!("another peer failed: {}", e),
//!     Err(e) => eprintln!("profiling failed: {}", e),
//!     Ok(()) => {}
//! }
//! # }
//! ```

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Unified error type for all fatal conditions.
#[derive(Debug, Error)]
pub enum Error {
    /// None of the requested counters could be resolved by the backend.
    #[error("no usable counters resolved from {0}")]
    NoCounters(String),

    /// A counter backend primitive (create/start/stop/shutdown) failed.
    #[error("counter backend error: {0}")]
    Backend(String),

    /// Error reading or writing an artifact.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Error encoding or decoding array store metadata.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer group was aborted while this peer was inside a collective.
    #[error("peer group aborted: {0}")]
    Aborted(String),

    /// An existing dataset was created for a different peer-group size.
    #[error("dataset {dataset} holds {found} peers, session has {expected}")]
    PeerCountMismatch {
        dataset: String,
        found: u64,
        expected: u64,
    },

    /// An existing dataset stores a different element type.
    #[error("dataset {dataset} stores {found}, expected {expected}")]
    DtypeMismatch {
        dataset: String,
        found: String,
        expected: String,
    },

    /// The links of a multi-process peer group could not be set up.
    #[error("peer connection failed: {0}")]
    Connect(String),

    /// An artifact on disk does not have the expected structure.
    #[error("malformed artifact: {0}")]
    Format(String),

    /// The session configuration is incomplete or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wraps an I/O error together with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Returns `true` for errors raised because another peer aborted.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }
}

/// Result type for all crate operations.
pub type Result<T> = std::result::Result<T, Error>;
