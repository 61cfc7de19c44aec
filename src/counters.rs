//! Counter bookkeeping: the resolved counter set and the per-region accumulator.
//!
//! A session resolves its [`CounterSet`] once at init and then feeds every
//! profile span's deltas into a [`CounterAccumulator`]. The accumulator is
//! pure aggregation: it never talks to the backend or to a writer.
//!
//! ```text
//!   start_profile ── backend.start()
//!        │
//!   end_profile ──── backend.stop() ──► deltas ──► accumulator.add(name, delta)
//!        │                                          accumulator.add_runtime(secs)
//!   (more spans in the same region sum up)
//!        │
//!   end_region ───── accumulator.snapshot(region, set) ──► writer.write(..)
//!                    accumulator.clear()
//! ```

use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::error::{Error, Result};
use crate::snapshot::{CounterSample, RegionSnapshot};

/// Name of the synthetic metric that carries a region's elapsed seconds.
pub const RUNTIME_METRIC: &str = "Runtime";

/// Number of decimal digits the runtime metric is rendered with.
pub const RUNTIME_PRECISION: usize = 7;

/// The value of one metric in one record.
///
/// Hardware counters are unsigned 64-bit integers, the synthetic
/// [`RUNTIME_METRIC`] is a number of seconds.
///
/// # Examples
///
/// ```rust
/// use perfdump::counters::MetricValue;
///
/// assert_eq!(MetricValue::Count(42).to_string(), "42");
/// assert_eq!(MetricValue::Seconds(0.5).to_string(), "0.5000000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum MetricValue {
    /// An accumulated counter value.
    Count(u64),
    /// An accumulated elapsed time in seconds.
    Seconds(f64),
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Count(v) => write!(f, "{}", v),
            MetricValue::Seconds(v) => write!(f, "{:.*}", RUNTIME_PRECISION, v),
        }
    }
}

impl MetricValue {
    /// Returns the counter value, or `None` for a runtime value.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            MetricValue::Count(v) => Some(*v),
            MetricValue::Seconds(_) => None,
        }
    }

    /// Returns the runtime value, or `None` for a counter value.
    pub fn as_seconds(&self) -> Option<f64> {
        match self {
            MetricValue::Count(_) => None,
            MetricValue::Seconds(v) => Some(*v),
        }
    }
}

/// The ordered list of counters a backend managed to resolve.
///
/// A `CounterSet` is built once per session and never changes afterwards.
/// It is never empty: a session without a single usable counter cannot
/// produce meaningful records, so construction fails instead.
///
/// # Examples
///
/// ```rust
/// use perfdump::counters::CounterSet;
///
/// let set = CounterSet::new(vec!["MINFLT".to_string(), "UTIME".to_string()]).unwrap();
/// assert_eq!(set.len(), 2);
/// assert!(set.contains("UTIME"));
///
/// assert!(CounterSet::new(Vec::new()).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSet {
    names: Vec<String>,
}

impl CounterSet {
    /// Creates a counter set from resolved names.
    ///
    /// Fails with [`Error::NoCounters`] when `names` is empty.
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::NoCounters("counter backend".to_string()));
        }
        Ok(Self { names })
    }

    /// Returns the counter names in resolution order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns the number of counters.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns `true` if `name` was resolved.
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Iterates over the counter names.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Accumulates counter deltas and elapsed time across the profile spans of
/// one region.
///
/// Values are merged additively: two spans that count 10 and 15 events for
/// the same counter leave 25 in the accumulator, never 15.
///
/// # Examples
///
/// ```rust
/// use perfdump::counters::CounterAccumulator;
///
/// let mut acc = CounterAccumulator::new();
/// acc.add("MINFLT", 10);
/// acc.add("MINFLT", 15);
/// acc.add_runtime(0.5);
/// acc.add_runtime(0.25);
///
/// assert_eq!(acc.get("MINFLT"), 25);
/// assert_eq!(acc.runtime(), 0.75);
///
/// acc.clear();
/// assert_eq!(acc.get("MINFLT"), 0);
/// assert_eq!(acc.runtime(), 0.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CounterAccumulator {
    values: HashMap<String, u64>,
    runtime: f64,
}

impl CounterAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to the named counter.
    ///
    /// Wraps on overflow, as hardware counters do.
    #[inline]
    pub fn add(&mut self, name: &str, value: u64) {
        match self.values.get_mut(name) {
            Some(total) => *total = total.wrapping_add(value),
            None => {
                self.values.insert(name.to_string(), value);
            }
        }
    }

    /// Adds one span's elapsed seconds to the region runtime.
    #[inline]
    pub fn add_runtime(&mut self, seconds: f64) {
        self.runtime += seconds;
    }

    /// Returns the accumulated value of `name`, zero if never observed.
    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    /// Returns the accumulated runtime in seconds.
    pub fn runtime(&self) -> f64 {
        self.runtime
    }

    /// Returns `true` if nothing has been accumulated since the last clear.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.runtime == 0.0
    }

    /// Captures the accumulated values for the writer.
    ///
    /// Every counter of `set` appears exactly once, in set order, including
    /// counters that were never observed (reported as zero).
    pub fn snapshot(&self, region: &str, set: &CounterSet) -> RegionSnapshot {
        let counters = set
            .iter()
            .map(|name| CounterSample::new(name, self.get(name)))
            .collect();
        RegionSnapshot::new(region, counters, self.runtime)
    }

    /// Resets every counter and the runtime.
    pub fn clear(&mut self) {
        self.values.clear();
        self.runtime = 0.0;
    }
}
