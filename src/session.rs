//! The profiling session state machine.
//!
//! A [`Session`] owns everything one peer needs to profile: its configuration,
//! its handle on the peer group, the counter backend, the accumulator and the
//! writer. The host program drives it through six calls:
//!
//! ```text
//!                 init                start_region          start_profile
//!  Uninitialized ──────► Ready ◄──────────────────► InRegion ◄────────────► Profiling
//!        ▲         ◄─────         end_region               end_profile
//!        └──────────────  finalize
//! ```
//!
//! A call made in the wrong state is not an error: it is logged with a warning
//! and returns [`Outcome::Ignored`]. Two calls complete the missing steps
//! instead, after their own warning: `end_region` while profiling ends the
//! profile first, and `finalize` inside a region ends the profile and the
//! region first.
//!
//! Errors are fatal. Before an `Err` is returned the peer group has been
//! aborted (no other peer is left waiting on a collective) and the session is
//! back in [`State::Uninitialized`] with its backend released.
//!
//! # Example
//!
//! ```rust,no_run
//! use perfdump::config::{EventSelector, SessionConfig};
//! use perfdump::peers::Solo;
//! use perfdump::Session;
//!
//! # fn main() -> perfdump::Result<()> {
//! let config = SessionConfig::new(EventSelector::Names(vec!["MINFLT".into(), "UTIME".into()]));
//! let mut session = Session::new(config, Solo);
//!
//! session.init()?;
//! session.start_region(Some("solve"))?;
//! for _ in 0..10 {
//!     session.start_profile()?;
//!     // ... measured work ...
//!     session.end_profile()?;
//! }
//! session.end_region()?;
//! session.finalize()?;
//! # Ok(())
//! # }
//! ```

use std::fmt::{self, Display};
use std::fs;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::{self, CounterBackend};
use crate::config::SessionConfig;
use crate::counters::{CounterAccumulator, CounterSet};
use crate::error::{Error, Result};
use crate::peers::PeerGroup;
use crate::writers::{self, ParallelWriter};

/// Creates the counter backend at every `init`.
pub type BackendFactory =
    Box<dyn FnMut(&SessionConfig) -> Result<Box<dyn CounterBackend>> + Send>;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Before `init`, or after `finalize`.
    Uninitialized,
    /// Initialized, between regions.
    Ready,
    /// Inside a region, between profile spans.
    InRegion,
    /// Inside a profile span.
    Profiling,
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            State::Uninitialized => "Not initialized",
            State::Ready => "Initialized, not within a region",
            State::InRegion => "Initialized and within a region, not profiling",
            State::Profiling => "Initialized and profiling within a region",
        };
        f.write_str(text)
    }
}

/// What a non-fatal session call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call took effect.
    Applied,
    /// The call was made in the wrong state and did nothing.
    Ignored,
}

impl Outcome {
    /// Returns `true` if the call took effect.
    pub fn is_applied(self) -> bool {
        self == Outcome::Applied
    }
}

/// Everything acquired at `init` and released at `finalize`.
struct Resources {
    counters: CounterSet,
    backend: Box<dyn CounterBackend>,
    writer: Box<dyn ParallelWriter>,
}

/// One peer's profiling session.
pub struct Session<P: PeerGroup> {
    config: SessionConfig,
    peers: P,
    factory: BackendFactory,
    state: State,
    resources: Option<Resources>,
    accumulator: CounterAccumulator,
    region: Option<String>,
    // Never reset, not even by finalize.
    region_count: u64,
    span_start: Option<Instant>,
}

impl<P: PeerGroup> Session<P> {
    /// Creates a session using the backend selected by `config`.
    pub fn new(config: SessionConfig, peers: P) -> Self {
        Self::with_backend(config, peers, Box::new(backend::create))
    }

    /// Creates a session whose backend is built by `factory` at every `init`.
    pub fn with_backend(config: SessionConfig, peers: P, factory: BackendFactory) -> Self {
        Self {
            config,
            peers,
            factory,
            state: State::Uninitialized,
            resources: None,
            accumulator: CounterAccumulator::new(),
            region: None,
            region_count: 0,
            span_start: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// This peer's rank.
    pub fn rank(&self) -> usize {
        self.peers.rank()
    }

    /// Size of the peer group.
    pub fn size(&self) -> usize {
        self.peers.size()
    }

    /// The peer group handle.
    pub fn peers(&self) -> &P {
        &self.peers
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the current region, if inside one.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// The resolved counters, once initialized.
    pub fn counters(&self) -> Option<&CounterSet> {
        self.resources.as_ref().map(|r| &r.counters)
    }

    /// Values accumulated in the current region so far.
    pub fn accumulator(&self) -> &CounterAccumulator {
        &self.accumulator
    }

    /// Path of the artifact, once initialized.
    pub fn output_path(&self) -> Option<&Path> {
        self.resources.as_ref().map(|r| r.writer.path())
    }

    /// Resolves the counters and picks the writer.
    ///
    /// Fatal if the backend cannot be created or resolves no counter at all.
    pub fn init(&mut self) -> Result<Outcome> {
        if self.state != State::Uninitialized {
            return Ok(self.ignore("init", State::Uninitialized, "Already initialized"));
        }
        let resources = self.acquire().map_err(|e| self.fail("init", e))?;
        info!(
            rank = self.peers.rank(),
            peers = self.peers.size(),
            counters = ?resources.counters.names(),
            path = %resources.writer.path().display(),
            "profiling session initialized"
        );
        self.resources = Some(resources);
        self.state = State::Ready;
        Ok(Outcome::Applied)
    }

    /// Enters a region named `name`, or `region_<N>` when `None`.
    ///
    /// `N` counts every accepted call, named or not, starting at 1.
    pub fn start_region(&mut self, name: Option<&str>) -> Result<Outcome> {
        if self.state != State::Ready {
            return Ok(self.ignore("start_region", State::Ready, "Cannot start a region here"));
        }
        self.region_count += 1;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("region_{}", self.region_count),
        };
        debug!(rank = self.peers.rank(), region = %name, "region started");
        self.accumulator.clear();
        self.region = Some(name);
        self.state = State::InRegion;
        Ok(Outcome::Applied)
    }

    /// Starts a profile span. Fatal if the backend cannot start.
    pub fn start_profile(&mut self) -> Result<Outcome> {
        if self.state != State::InRegion {
            return Ok(self.ignore("start_profile", State::InRegion, "Cannot start profiling here"));
        }
        self.span_start = Some(Instant::now());
        self.begin_span().map_err(|e| self.fail("start_profile", e))?;
        self.state = State::Profiling;
        Ok(Outcome::Applied)
    }

    /// Ends the profile span and adds its deltas and elapsed time to the
    /// region. Fatal if the backend cannot stop.
    pub fn end_profile(&mut self) -> Result<Outcome> {
        if self.state != State::Profiling {
            return Ok(self.ignore("end_profile", State::Profiling, "No profile to end"));
        }
        self.finish_profile().map_err(|e| self.fail("end_profile", e))?;
        Ok(Outcome::Applied)
    }

    /// Leaves the region and writes its record set. Collective.
    ///
    /// While profiling, the span is ended first. Fatal if the write fails.
    pub fn end_region(&mut self) -> Result<Outcome> {
        match self.state {
            State::InRegion => {}
            State::Profiling => {
                self.warn_implicit(
                    "end_region",
                    "Implicitly ending profile with call to end region",
                );
                self.finish_profile().map_err(|e| self.fail("end_region", e))?;
            }
            _ => return Ok(self.ignore("end_region", State::InRegion, "No region to end")),
        }
        self.finish_region().map_err(|e| self.fail("end_region", e))?;
        Ok(Outcome::Applied)
    }

    /// Releases the backend and returns to [`State::Uninitialized`].
    ///
    /// Inside a region, the open span and region are ended first, which
    /// makes this call collective in that case.
    pub fn finalize(&mut self) -> Result<Outcome> {
        match self.state {
            State::Ready => {}
            State::Uninitialized => {
                return Ok(self.ignore(
                    "finalize",
                    State::Ready,
                    "Can't finalize before initialization",
                ))
            }
            State::InRegion | State::Profiling => {
                self.warn_implicit("finalize", "Finalize called out of order");
                if self.state == State::Profiling {
                    self.finish_profile().map_err(|e| self.fail("finalize", e))?;
                }
                self.finish_region().map_err(|e| self.fail("finalize", e))?;
            }
        }
        self.release().map_err(|e| self.fail("finalize", e))?;
        info!(rank = self.peers.rank(), "profiling session finalized");
        Ok(Outcome::Applied)
    }

    fn acquire(&mut self) -> Result<Resources> {
        let backend = (self.factory)(&self.config)?;
        let counters = CounterSet::new(backend.names().to_vec()).map_err(|_| {
            Error::NoCounters(format!("{:?} with the {:?} backend", self.config.events, self.config.backend))
        })?;
        let dir = self.config.dump_dir();
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let writer = writers::create(self.config.format, self.config.output_path(self.peers.size()));
        Ok(Resources {
            counters,
            backend,
            writer,
        })
    }

    fn begin_span(&mut self) -> Result<()> {
        self.resources
            .as_mut()
            .ok_or_else(missing_backend)?
            .backend
            .start()
    }

    fn finish_profile(&mut self) -> Result<()> {
        let elapsed = self
            .span_start
            .take()
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or_default();

        let resources = self.resources.as_mut().ok_or_else(missing_backend)?;
        let deltas = resources.backend.stop()?;
        if deltas.len() != resources.counters.len() {
            return Err(Error::Backend(format!(
                "backend reported {} values for {} counters",
                deltas.len(),
                resources.counters.len()
            )));
        }
        for (name, delta) in resources.counters.iter().zip(deltas) {
            self.accumulator.add(name, delta);
        }
        self.accumulator.add_runtime(elapsed);
        self.state = State::InRegion;
        Ok(())
    }

    fn finish_region(&mut self) -> Result<()> {
        let region = self.region.take().unwrap_or_default();
        let resources = self.resources.as_mut().ok_or_else(missing_backend)?;
        let snapshot = self.accumulator.snapshot(&region, &resources.counters);
        resources.writer.write(&self.peers, &snapshot)?;
        debug!(
            rank = self.peers.rank(),
            region = %region,
            runtime = snapshot.runtime,
            "region written"
        );
        self.accumulator.clear();
        self.state = State::Ready;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.state = State::Uninitialized;
        match self.resources.take() {
            Some(mut resources) => resources.backend.shutdown(),
            None => Ok(()),
        }
    }

    fn ignore(&self, call: &'static str, expected: State, message: &str) -> Outcome {
        warn!(
            rank = self.peers.rank(),
            call,
            state = %self.state,
            expected = %expected,
            "{}",
            message
        );
        Outcome::Ignored
    }

    fn warn_implicit(&self, call: &'static str, message: &str) {
        warn!(
            rank = self.peers.rank(),
            call,
            state = %self.state,
            region = self.region.as_deref().unwrap_or_default(),
            "{}",
            message
        );
    }

    /// Aborts the peer group and tears the session down.
    fn fail(&mut self, call: &'static str, err: Error) -> Error {
        error!(rank = self.peers.rank(), call, state = %self.state, error = %err, "fatal profiling error");
        if !err.is_aborted() {
            self.peers.abort(&format!("{} failed: {}", call, err));
        }
        self.resources = None;
        self.region = None;
        self.span_start = None;
        self.accumulator.clear();
        self.state = State::Uninitialized;
        err
    }
}

fn missing_backend() -> Error {
    Error::Backend("session holds no counter backend".to_string())
}

impl<P: PeerGroup> Drop for Session<P> {
    fn drop(&mut self) {
        if self.state != State::Uninitialized {
            warn!(
                rank = self.peers.rank(),
                state = %self.state,
                "profiling session dropped without finalize"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::Scripted;
    use crate::config::{EventSelector, OutputFormat};
    use crate::counters::{MetricValue, RUNTIME_METRIC};
    use crate::peers::{LocalGroup, LocalPeer, Solo};
    use crate::snapshot::OutputRecord;
    use crate::store::ArrayStore;
    use crate::writers::{array, delimited};
    use std::path::PathBuf;
    use std::thread;

    fn factory(backend: Scripted) -> BackendFactory {
        let mut slot = Some(backend);
        Box::new(move |_: &SessionConfig| match slot.take() {
            Some(backend) => Ok(Box::new(backend) as Box<dyn CounterBackend>),
            None => Err(Error::Backend("scripted backend already used".to_string())),
        })
    }

    fn config(dir: &Path, format: OutputFormat) -> SessionConfig {
        SessionConfig::new(EventSelector::Names(vec!["X".into(), "Y".into()]))
            .with_dump_dir(dir)
            .with_format(format)
    }

    fn solo(dir: &Path, backend: Scripted) -> Session<Solo> {
        Session::with_backend(config(dir, OutputFormat::Csv), Solo, factory(backend))
    }

    fn counts(records: &[OutputRecord], metric: &str) -> Vec<u64> {
        records
            .iter()
            .filter(|r| r.metric == metric)
            .filter_map(|r| r.value.as_count())
            .collect()
    }

    fn regions(records: &[OutputRecord]) -> Vec<String> {
        records
            .iter()
            .filter(|r| r.is_runtime())
            .map(|r| r.region.clone())
            .collect()
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Uninitialized.to_string(), "Not initialized");
        assert_eq!(
            State::Profiling.to_string(),
            "Initialized and profiling within a region"
        );
    }

    #[test]
    fn test_legal_walk() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X", "Y"]));

        assert_eq!(session.state(), State::Uninitialized);
        assert!(session.init().unwrap().is_applied());
        assert_eq!(session.state(), State::Ready);
        assert!(session.start_region(Some("solve")).unwrap().is_applied());
        assert_eq!(session.state(), State::InRegion);
        assert_eq!(session.region(), Some("solve"));
        assert!(session.start_profile().unwrap().is_applied());
        assert_eq!(session.state(), State::Profiling);
        assert!(session.end_profile().unwrap().is_applied());
        assert_eq!(session.state(), State::InRegion);
        assert!(session.end_region().unwrap().is_applied());
        assert_eq!(session.state(), State::Ready);
        assert_eq!(session.region(), None);
        assert!(session.finalize().unwrap().is_applied());
        assert_eq!(session.state(), State::Uninitialized);
        assert!(session.counters().is_none());
    }

    #[test]
    fn test_illegal_calls_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X"]));

        // Uninitialized
        assert_eq!(session.start_region(None).unwrap(), Outcome::Ignored);
        assert_eq!(session.start_profile().unwrap(), Outcome::Ignored);
        assert_eq!(session.end_profile().unwrap(), Outcome::Ignored);
        assert_eq!(session.end_region().unwrap(), Outcome::Ignored);
        assert_eq!(session.finalize().unwrap(), Outcome::Ignored);
        assert_eq!(session.state(), State::Uninitialized);

        // Ready
        session.init().unwrap();
        assert_eq!(session.init().unwrap(), Outcome::Ignored);
        assert_eq!(session.start_profile().unwrap(), Outcome::Ignored);
        assert_eq!(session.end_profile().unwrap(), Outcome::Ignored);
        assert_eq!(session.end_region().unwrap(), Outcome::Ignored);
        assert_eq!(session.state(), State::Ready);

        // InRegion
        session.start_region(Some("r")).unwrap();
        assert_eq!(session.init().unwrap(), Outcome::Ignored);
        assert_eq!(session.start_region(Some("other")).unwrap(), Outcome::Ignored);
        assert_eq!(session.end_profile().unwrap(), Outcome::Ignored);
        assert_eq!(session.state(), State::InRegion);
        assert_eq!(session.region(), Some("r"));

        // Profiling
        session.start_profile().unwrap();
        assert_eq!(session.init().unwrap(), Outcome::Ignored);
        assert_eq!(session.start_region(None).unwrap(), Outcome::Ignored);
        assert_eq!(session.start_profile().unwrap(), Outcome::Ignored);
        assert_eq!(session.state(), State::Profiling);

        // Nothing was written by the ignored calls.
        assert!(!dir.path().join("perf_dump.csv").exists());
        session.finalize().unwrap();
    }

    #[test]
    fn test_spans_accumulate_within_region() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Scripted::new(&["X", "Y"]).then(&[10, 1]).then(&[15, 2]);
        let mut session = solo(dir.path(), backend);

        session.init().unwrap();
        session.start_region(Some("r")).unwrap();
        for _ in 0..2 {
            session.start_profile().unwrap();
            session.end_profile().unwrap();
        }
        assert_eq!(session.accumulator().get("X"), 25);
        assert_eq!(session.accumulator().get("Y"), 3);
        session.end_region().unwrap();
        assert!(session.accumulator().is_empty());
        session.finalize().unwrap();

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], OutputRecord::new(0, "r", "X", MetricValue::Count(25)));
        assert_eq!(records[1], OutputRecord::new(0, "r", "Y", MetricValue::Count(3)));
        assert!(records[2].is_runtime());
        assert!(records[2].value.as_seconds().unwrap() >= 0.0);
    }

    #[test]
    fn test_region_without_spans_writes_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X"]));

        session.init().unwrap();
        session.start_region(Some("idle")).unwrap();
        session.end_region().unwrap();
        session.finalize().unwrap();

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(
            records,
            vec![
                OutputRecord::new(0, "idle", "X", MetricValue::Count(0)),
                OutputRecord::new(0, "idle", RUNTIME_METRIC, MetricValue::Seconds(0.0)),
            ]
        );
    }

    #[test]
    fn test_auto_names_count_every_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X"]));

        session.init().unwrap();
        for name in [None, Some("named"), None, None] {
            session.start_region(name).unwrap();
            session.end_region().unwrap();
        }
        // Ignored calls do not count.
        session.end_region().unwrap();
        session.finalize().unwrap();

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(
            regions(&records),
            vec!["region_1", "named", "region_3", "region_4"]
        );
    }

    #[test]
    fn test_auto_names_survive_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let backends = vec![Scripted::new(&["X"]), Scripted::new(&["X"])];
        let mut backends = backends.into_iter();
        let factory: BackendFactory = Box::new(move |_: &SessionConfig| {
            backends
                .next()
                .map(|b| Box::new(b) as Box<dyn CounterBackend>)
                .ok_or_else(|| Error::Backend("no more backends".to_string()))
        });
        let mut session =
            Session::with_backend(config(dir.path(), OutputFormat::Csv), Solo, factory);

        for _ in 0..2 {
            session.init().unwrap();
            session.start_region(None).unwrap();
            session.end_region().unwrap();
            session.finalize().unwrap();
        }

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(regions(&records), vec!["region_1", "region_2"]);
    }

    #[test]
    fn test_end_region_while_profiling_ends_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X"]).then(&[7]));

        session.init().unwrap();
        session.start_region(Some("r")).unwrap();
        session.start_profile().unwrap();
        assert!(session.end_region().unwrap().is_applied());
        assert_eq!(session.state(), State::Ready);
        session.finalize().unwrap();

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(counts(&records, "X"), vec![7]);
    }

    #[test]
    fn test_finalize_completes_open_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X"]).then(&[3]));

        session.init().unwrap();
        session.start_region(Some("r")).unwrap();
        session.start_profile().unwrap();
        assert!(session.finalize().unwrap().is_applied());
        assert_eq!(session.state(), State::Uninitialized);

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(counts(&records, "X"), vec![3]);
        assert_eq!(regions(&records), vec!["r"]);
    }

    #[test]
    fn test_finalize_from_region_without_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&["X"]));

        session.init().unwrap();
        session.start_region(None).unwrap();
        session.finalize().unwrap();

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(regions(&records), vec!["region_1"]);
    }

    #[test]
    fn test_no_counters_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = solo(dir.path(), Scripted::new(&[]));

        let err = session.init().unwrap_err();
        assert!(matches!(err, Error::NoCounters(_)));
        assert_eq!(session.state(), State::Uninitialized);
    }

    #[test]
    fn test_no_counters_aborts_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let group = LocalGroup::new(2);
        let waiting = group.peer(1);
        let blocked = thread::spawn(move || waiting.barrier());

        let mut session = Session::with_backend(
            config(dir.path(), OutputFormat::Csv),
            group.peer(0),
            factory(Scripted::new(&[])),
        );
        assert!(session.init().is_err());

        assert!(blocked.join().unwrap().unwrap_err().is_aborted());
        assert!(group.aborted().is_some());
    }

    #[test]
    fn test_backend_start_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = Scripted::new(&["X"]);
        backend.fail_start = true;
        let mut session = solo(dir.path(), backend);

        session.init().unwrap();
        session.start_region(Some("r")).unwrap();
        let err = session.start_profile().unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(session.state(), State::Uninitialized);
        assert!(session.region().is_none());
    }

    #[test]
    fn test_backend_factory_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let factory: BackendFactory =
            Box::new(|_: &SessionConfig| Err(Error::Backend("no counters device".to_string())));
        let mut session =
            Session::with_backend(config(dir.path(), OutputFormat::Csv), Solo, factory);
        assert!(matches!(session.init(), Err(Error::Backend(_))));
    }

    #[test]
    fn test_writer_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::with_backend(
            config(dir.path(), OutputFormat::Array),
            Solo,
            factory(Scripted::new(&["X"])),
        );

        // A plain file where the container directory should go.
        std::fs::write(dir.path().join("perf_dump.1.pda"), b"").unwrap();

        session.init().unwrap();
        session.start_region(Some("r")).unwrap();
        assert!(matches!(session.end_region(), Err(Error::Io { .. })));
        assert_eq!(session.state(), State::Uninitialized);
    }

    #[test]
    fn test_any_region_name_under_both_formats() {
        for format in [OutputFormat::Csv, OutputFormat::Array] {
            let dir = tempfile::tempdir().unwrap();
            let mut session = Session::with_backend(
                config(dir.path(), format),
                Solo,
                factory(Scripted::new(&["X"])),
            );
            session.init().unwrap();
            for name in ["", ".warmup", "phase\\1", "a/b"] {
                session.start_region(Some(name)).unwrap();
                assert!(session.end_region().unwrap().is_applied(), "{:?}", name);
                assert_eq!(session.state(), State::Ready);
            }
            session.finalize().unwrap();
        }
    }

    fn fail_inside_round(format: OutputFormat) {
        let dir = tempfile::tempdir().unwrap();
        let group = LocalGroup::new(2);

        let handles: Vec<_> = group
            .peers()
            .into_iter()
            .map(|peer: LocalPeer| {
                let config = config(dir.path(), format);
                thread::spawn(move || {
                    let rank = peer.rank();
                    let mut backend = Scripted::new(&["X", "Y"]).then(&[1, 2]);
                    backend.fail_stop = rank == 0;
                    let mut session = Session::with_backend(config, peer, factory(backend));
                    session.init().unwrap();
                    session.start_region(Some("solve")).unwrap();
                    session.start_profile().unwrap();
                    if rank == 1 {
                        session.end_profile().unwrap();
                    }
                    // Rank 0 is still profiling: its implicit end_profile fails.
                    let result = session.end_region();
                    (rank, result.map(|_| ()), session.state())
                })
            })
            .collect();

        for handle in handles {
            let (rank, result, state) = handle.join().unwrap();
            let err = result.unwrap_err();
            match rank {
                0 => assert!(matches!(err, Error::Backend(_)), "{}", err),
                _ => assert!(err.is_aborted(), "{}", err),
            }
            assert_eq!(state, State::Uninitialized);
        }
        assert!(group.aborted().unwrap().starts_with("rank 0: end_region failed"));
    }

    #[test]
    fn test_failure_inside_delimited_round_aborts_peers() {
        fail_inside_round(OutputFormat::Csv);
    }

    #[test]
    fn test_failure_inside_array_round_aborts_peers() {
        fail_inside_round(OutputFormat::Array);
    }

    #[test]
    fn test_output_path_follows_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::with_backend(
            config(dir.path(), OutputFormat::Array),
            Solo,
            factory(Scripted::new(&["X"])),
        );
        assert!(session.output_path().is_none());
        session.init().unwrap();
        assert_eq!(session.output_path(), Some(dir.path().join("perf_dump.1.pda").as_path()));
        session.finalize().unwrap();
    }

    fn run_peers(format: OutputFormat, dir: PathBuf, peers: usize) {
        let group = LocalGroup::new(peers);
        let handles: Vec<_> = group
            .peers()
            .into_iter()
            .map(|peer: LocalPeer| {
                let config = config(&dir, format);
                thread::spawn(move || {
                    let rank = peer.rank() as u64;
                    let backend = Scripted::new(&["X", "Y"])
                        .then(&[rank, 100])
                        .then(&[rank, 200])
                        .then(&[10 * rank, 300]);
                    let mut session = Session::with_backend(config, peer, factory(backend));
                    session.init().unwrap();

                    session.start_region(Some("init")).unwrap();
                    session.start_profile().unwrap();
                    session.end_profile().unwrap();
                    session.end_region().unwrap();

                    session.start_region(Some("solve")).unwrap();
                    session.start_profile().unwrap();
                    session.end_profile().unwrap();
                    session.start_profile().unwrap();
                    session.end_profile().unwrap();
                    session.end_region().unwrap();

                    session.finalize().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_peers_share_one_delimited_log() {
        let dir = tempfile::tempdir().unwrap();
        run_peers(OutputFormat::Csv, dir.path().to_path_buf(), 3);

        let records = delimited::read_records(dir.path().join("perf_dump.csv")).unwrap();
        assert_eq!(records.len(), 2 * 3 * 3);
        let ranks: Vec<usize> = records.iter().map(|r| r.rank).collect();
        assert_eq!(
            ranks,
            vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 0, 0, 0, 1, 1, 1, 2, 2, 2]
        );
        assert_eq!(regions(&records), vec!["init", "init", "init", "solve", "solve", "solve"]);
        assert_eq!(counts(&records, "X"), vec![0, 1, 2, 0, 11, 22]);
        assert_eq!(counts(&records, "Y"), vec![100, 100, 100, 500, 500, 500]);
    }

    #[test]
    fn test_peers_share_one_array_store() {
        let dir = tempfile::tempdir().unwrap();
        run_peers(OutputFormat::Array, dir.path().to_path_buf(), 3);

        let path = dir.path().join("perf_dump.3.pda");
        let store = ArrayStore::open(&path).unwrap();
        assert_eq!(store.groups().unwrap(), vec!["init", "solve"]);

        let x = store.group("solve").unwrap().dataset("X").unwrap();
        assert_eq!(x.shape(), [3, 1, 1]);
        let values: Vec<u64> = (0..3).map(|rank| x.read_cell(rank, 0).unwrap()).collect();
        assert_eq!(values, vec![0, 11, 22]);

        let records = array::read_records(&path).unwrap();
        assert_eq!(records.len(), 2 * 3 * 3);
    }
}
