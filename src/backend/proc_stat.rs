//! Per-thread counters read from `/proc/thread-self`.
//!
//! This backend needs no privileges and no kernel configuration, which makes
//! it the default. Values are cumulative kernel statistics of the calling
//! thread; `start` records them and `stop` reports the difference. Both must
//! run on the same thread: a `stop` from another thread is a backend error.
//!
//! | Name | Source | Meaning |
//! |------|--------|---------|
//! | `MINFLT` | `stat` field 10 | minor page faults |
//! | `MAJFLT` | `stat` field 12 | major page faults |
//! | `UTIME` | `stat` field 14 | user CPU time, clock ticks |
//! | `STIME` | `stat` field 15 | system CPU time, clock ticks |
//! | `VCSW` | `status` `voluntary_ctxt_switches` | voluntary context switches |
//! | `IVCSW` | `status` `nonvoluntary_ctxt_switches` | involuntary context switches |

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use tracing::debug;

use super::{resolve, CounterBackend};
use crate::config::EventSelector;
use crate::error::{Error, Result};

/// Counter names understood by [`ProcStat`], in code order.
pub const CATALOG: &[&str] = &["MINFLT", "MAJFLT", "UTIME", "STIME", "VCSW", "IVCSW"];

type Sample = [u64; 6];

/// Counter backend over `/proc/thread-self/{stat,status}`.
#[derive(Debug)]
pub struct ProcStat {
    root: PathBuf,
    names: Vec<String>,
    indices: Vec<usize>,
    started: Option<(ThreadId, Sample)>,
}

impl ProcStat {
    /// Resolves `selector` against [`CATALOG`] for the calling thread.
    pub fn new(selector: &EventSelector) -> Result<Self> {
        Self::with_root(selector, "/proc/thread-self")
    }

    /// Like [`new`](ProcStat::new), reading `stat` and `status` from `root`.
    pub fn with_root(selector: &EventSelector, root: impl Into<PathBuf>) -> Result<Self> {
        let indices = resolve(selector, CATALOG);
        let backend = Self {
            root: root.into(),
            names: indices.iter().map(|&i| CATALOG[i].to_string()).collect(),
            indices,
            started: None,
        };
        // Fail at creation, not at the first span, when /proc is unusable.
        backend.sample()?;
        debug!(counters = ?backend.names, root = %backend.root.display(), "procstat backend ready");
        Ok(backend)
    }

    fn sample(&self) -> Result<Sample> {
        let stat = read(&self.root.join("stat"))?;
        let status = read(&self.root.join("status"))?;
        let [minflt, majflt, utime, stime] = parse_stat(&stat)?;
        let [vcsw, ivcsw] = parse_status(&status)?;
        Ok([minflt, majflt, utime, stime, vcsw, ivcsw])
    }
}

impl CounterBackend for ProcStat {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn start(&mut self) -> Result<()> {
        if self.started.is_some() {
            return Err(Error::Backend("procstat counters already running".to_string()));
        }
        self.started = Some((thread::current().id(), self.sample()?));
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<u64>> {
        let (owner, started) = self
            .started
            .take()
            .ok_or_else(|| Error::Backend("procstat counters not running".to_string()))?;
        if owner != thread::current().id() {
            return Err(Error::Backend(format!(
                "procstat counters started on {:?}, stopped on {:?}",
                owner,
                thread::current().id()
            )));
        }
        let now = self.sample()?;
        Ok(self
            .indices
            .iter()
            .map(|&i| now[i].saturating_sub(started[i]))
            .collect())
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Backend(format!("reading {}: {}", path.display(), e)))
}

/// Extracts `[minflt, majflt, utime, stime]` from a `stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn parse_stat(stat: &str) -> Result<[u64; 4]> {
    let rest = stat
        .rfind(')')
        .map(|pos| &stat[pos + 1..])
        .ok_or_else(|| Error::Backend("malformed stat: no command name".to_string()))?;
    // Field 3 (state) is the first one after the command name.
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| -> Result<u64> {
        fields
            .get(n - 3)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Backend(format!("malformed stat: field {}", n)))
    };
    Ok([field(10)?, field(12)?, field(14)?, field(15)?])
}

/// Extracts `[voluntary, nonvoluntary]` context switches from `status`.
fn parse_status(status: &str) -> Result<[u64; 2]> {
    let value = |key: &str| -> Result<u64> {
        status
            .lines()
            .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::Backend(format!("malformed status: {}", key)))
    };
    Ok([
        value("voluntary_ctxt_switches")?,
        value("nonvoluntary_ctxt_switches")?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) proc) R 1 4242 4242 0 -1 4194304 \
                        120 0 3 0 57 11 0 0 20 0 1 0 100 0 0";
    const STATUS: &str = "Name:\tproc\nState:\tR (running)\n\
                          voluntary_ctxt_switches:\t9\n\
                          nonvoluntary_ctxt_switches:\t2\n";

    fn fake_proc(dir: &Path, stat: &str, status: &str) {
        fs::write(dir.join("stat"), stat).unwrap();
        fs::write(dir.join("status"), status).unwrap();
    }

    fn names(list: &[&str]) -> EventSelector {
        EventSelector::Names(list.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_parse_stat_with_parenthesized_name() {
        assert_eq!(parse_stat(STAT).unwrap(), [120, 3, 57, 11]);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("1 (x) R 1 2").is_err());
        assert!(parse_stat("garbage").is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(STATUS).unwrap(), [9, 2]);
        assert!(parse_status("Name:\tproc\n").is_err());
    }

    #[test]
    fn test_deltas_from_fake_proc() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), STAT, STATUS);

        let mut backend =
            ProcStat::with_root(&names(&["IVCSW", "MINFLT", "BOGUS"]), dir.path()).unwrap();
        assert_eq!(backend.names(), &["IVCSW".to_string(), "MINFLT".to_string()]);

        backend.start().unwrap();
        fake_proc(
            dir.path(),
            &STAT.replace(" 120 0 3 ", " 150 0 3 "),
            &STATUS.replace(":\t2", ":\t6"),
        );
        assert_eq!(backend.stop().unwrap(), vec![4, 30]);
    }

    #[test]
    fn test_start_twice_and_stop_idle_fail() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), STAT, STATUS);
        let mut backend = ProcStat::with_root(&names(&["UTIME"]), dir.path()).unwrap();

        assert!(backend.stop().is_err());
        backend.start().unwrap();
        assert!(backend.start().is_err());
        assert_eq!(backend.stop().unwrap(), vec![0]);
    }

    #[test]
    fn test_stop_on_another_thread_fails() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), STAT, STATUS);
        let mut backend = ProcStat::with_root(&names(&["MINFLT"]), dir.path()).unwrap();

        backend.start().unwrap();
        let mut backend = thread::spawn(move || {
            assert!(matches!(backend.stop(), Err(Error::Backend(_))));
            backend
        })
        .join()
        .unwrap();

        // The failed stop ended the span.
        backend.start().unwrap();
        assert_eq!(backend.stop().unwrap(), vec![0]);
    }

    #[test]
    fn test_missing_proc_fails_at_creation() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcStat::with_root(&names(&["UTIME"]), dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_thread_counters() {
        let mut backend = ProcStat::new(&EventSelector::Codes(vec![0, 2, 3])).unwrap();
        assert_eq!(backend.names(), &["MINFLT", "UTIME", "STIME"]);
        backend.start().unwrap();
        let buf: Vec<u8> = vec![1; 1 << 20];
        assert_eq!(buf.iter().map(|&b| b as u64).sum::<u64>(), 1 << 20);
        assert_eq!(backend.stop().unwrap().len(), 3);
    }
}
