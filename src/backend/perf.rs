//! Hardware and software counters through `perf_event_open`.
//!
//! All resolved counters are opened as one group on the calling thread, so
//! they are enabled, disabled and read together. Counters the kernel refuses
//! to open (missing PMU, virtualized CPU, `perf_event_paranoid`) are skipped
//! with a warning, like unknown names.

use perf_event::events::{Event, Hardware, Software};
use perf_event::{Builder, Counter, Group};
use tracing::{debug, warn};

use super::{resolve, CounterBackend};
use crate::config::EventSelector;
use crate::error::{Error, Result};

/// Counter names understood by [`PerfEvents`], in code order.
pub const CATALOG: &[&str] = &[
    "CPU_CYCLES",
    "INSTRUCTIONS",
    "CACHE_REFERENCES",
    "CACHE_MISSES",
    "BRANCH_INSTRUCTIONS",
    "BRANCH_MISSES",
    "REF_CPU_CYCLES",
    "TASK_CLOCK",
    "PAGE_FAULTS",
    "CONTEXT_SWITCHES",
    "CPU_MIGRATIONS",
];

fn event(index: usize) -> Option<Event> {
    let event: Event = match index {
        0 => Hardware::CPU_CYCLES.into(),
        1 => Hardware::INSTRUCTIONS.into(),
        2 => Hardware::CACHE_REFERENCES.into(),
        3 => Hardware::CACHE_MISSES.into(),
        4 => Hardware::BRANCH_INSTRUCTIONS.into(),
        5 => Hardware::BRANCH_MISSES.into(),
        6 => Hardware::REF_CPU_CYCLES.into(),
        7 => Software::TASK_CLOCK.into(),
        8 => Software::PAGE_FAULTS.into(),
        9 => Software::CONTEXT_SWITCHES.into(),
        10 => Software::CPU_MIGRATIONS.into(),
        _ => return None,
    };
    Some(event)
}

fn perf_error(what: &str, err: std::io::Error) -> Error {
    Error::Backend(format!("perf {}: {}", what, err))
}

/// Counter backend over a `perf_event` group.
pub struct PerfEvents {
    group: Group,
    counters: Vec<Counter>,
    names: Vec<String>,
    running: bool,
}

impl PerfEvents {
    /// Opens the counters of `selector` that the kernel supports.
    pub fn new(selector: &EventSelector) -> Result<Self> {
        let mut group = Group::new().map_err(|e| perf_error("group", e))?;
        let mut counters = Vec::new();
        let mut names = Vec::new();

        for index in resolve(selector, CATALOG) {
            let Some(kind) = event(index) else {
                continue;
            };
            match Builder::new().group(&mut group).kind(kind).build() {
                Ok(counter) => {
                    counters.push(counter);
                    names.push(CATALOG[index].to_string());
                }
                Err(e) => warn!(counter = CATALOG[index], error = %e, "unable to open perf counter"),
            }
        }

        debug!(counters = ?names, "perf backend ready");
        Ok(Self {
            group,
            counters,
            names,
            running: false,
        })
    }
}

impl CounterBackend for PerfEvents {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::Backend("perf counters already running".to_string()));
        }
        self.group.reset().map_err(|e| perf_error("reset", e))?;
        self.group.enable().map_err(|e| perf_error("enable", e))?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<u64>> {
        if !self.running {
            return Err(Error::Backend("perf counters not running".to_string()));
        }
        self.running = false;
        self.group.disable().map_err(|e| perf_error("disable", e))?;
        let counts = self.group.read().map_err(|e| perf_error("read", e))?;
        Ok(self.counters.iter().map(|counter| counts[counter]).collect())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.group.disable().map_err(|e| perf_error("disable", e))?;
        }
        Ok(())
    }
}
