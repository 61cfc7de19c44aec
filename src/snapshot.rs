//! Snapshot and record types exchanged between the session and the writers.
//!
//! A [`RegionSnapshot`] is what a session hands to its writer at the end of a
//! region: the region name, every resolved counter with its accumulated value,
//! and the accumulated runtime. An [`OutputRecord`] is one row of a written
//! artifact, `(rank, region, metric, value)`, as read back from disk.
//!
//! Both types are serializable with serde, which makes it easy to forward
//! results to other tools:
//!
//! ```rust
//! use perfdump::snapshot::{CounterSample, RegionSnapshot};
//!
//! let snapshot = RegionSnapshot::new("solve", vec![CounterSample::new("MINFLT", 12)], 0.5);
//! let json = serde_json::to_string(&snapshot).unwrap();
//! assert_eq!(json, r#"{"region":"solve","counters":[{"name":"MINFLT","value":12}],"runtime":0.5}"#);
//! ```

use serde::{Deserialize, Serialize};

use crate::counters::{MetricValue, RUNTIME_METRIC};

/// One counter's accumulated value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterSample {
    /// The resolved counter name.
    pub name: String,
    /// The accumulated value.
    pub value: u64,
}

impl CounterSample {
    /// Creates a new counter sample.
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Everything one peer contributes to one round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionSnapshot {
    /// The region the values were measured in.
    pub region: String,
    /// Counter values in counter-set order.
    pub counters: Vec<CounterSample>,
    /// Accumulated elapsed seconds over all profile spans of the region.
    pub runtime: f64,
}

impl RegionSnapshot {
    /// Creates a new region snapshot.
    pub fn new(region: impl Into<String>, counters: Vec<CounterSample>, runtime: f64) -> Self {
        Self {
            region: region.into(),
            counters,
            runtime,
        }
    }

    /// Finds a counter by name.
    pub fn get(&self, name: &str) -> Option<&CounterSample> {
        self.counters.iter().find(|c| c.name == name)
    }

    /// Iterates over all metrics of the snapshot: every counter in order,
    /// then the synthetic runtime metric.
    pub fn metrics(&self) -> impl Iterator<Item = (&str, MetricValue)> {
        self.counters
            .iter()
            .map(|c| (c.name.as_str(), MetricValue::Count(c.value)))
            .chain(std::iter::once((
                RUNTIME_METRIC,
                MetricValue::Seconds(self.runtime),
            )))
    }
}

/// One row of an artifact: a single metric of a single peer in a single round.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    /// Rank of the peer that produced the value.
    pub rank: usize,
    /// Region name.
    pub region: String,
    /// Counter name, or [`RUNTIME_METRIC`].
    pub metric: String,
    /// The value.
    pub value: MetricValue,
}

impl OutputRecord {
    /// Creates a new output record.
    pub fn new(
        rank: usize,
        region: impl Into<String>,
        metric: impl Into<String>,
        value: MetricValue,
    ) -> Self {
        Self {
            rank,
            region: region.into(),
            metric: metric.into(),
            value,
        }
    }

    /// Returns `true` if this record carries the region runtime.
    pub fn is_runtime(&self) -> bool {
        self.metric == RUNTIME_METRIC
    }
}
