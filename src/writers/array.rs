//! Extensible array layout.
//!
//! One group per region, one dataset per metric. Every dataset has shape
//! `[peers, 1, rounds]`: each round of a region grows the last axis by one and
//! every peer fills its own cell `(rank, 0, round)`. Counters are stored as
//! `u64`, `Runtime` as `f64`.
//!
//! A round has three collective phases, separated by barriers:
//!
//! 1. every peer reads the current metadata of every metric and checks it
//!    against the group size and element type,
//! 2. every peer writes the same new metadata (create at one step, or extend
//!    by one step), through atomic replacement,
//! 3. every peer writes its own cell into the new step.
//!
//! Because all peers read the same metadata in phase 1 they agree on the new
//! extent without ever exchanging it.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::ParallelWriter;
use crate::config::OutputFormat;
use crate::counters::{MetricValue, RUNTIME_METRIC};
use crate::error::{Error, Result};
use crate::peers::PeerGroup;
use crate::snapshot::{OutputRecord, RegionSnapshot};
use crate::store::{ArrayStore, DatasetMeta, Dtype};

/// Writer for the array store format.
#[derive(Debug, Clone)]
pub struct ArrayWriter {
    path: PathBuf,
}

impl ArrayWriter {
    /// Creates a writer for the container at `path`. Nothing is created
    /// until the first round.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct Planned<'a> {
    metric: &'a str,
    value: MetricValue,
    meta: DatasetMeta,
}

fn dtype_of(value: &MetricValue) -> Dtype {
    match value {
        MetricValue::Count(_) => Dtype::U64,
        MetricValue::Seconds(_) => Dtype::F64,
    }
}

impl ParallelWriter for ArrayWriter {
    fn write(&mut self, peers: &dyn PeerGroup, snapshot: &RegionSnapshot) -> Result<()> {
        let rank = peers.rank() as u64;
        let size = peers.size() as u64;

        let store = ArrayStore::create_or_open(&self.path)?;
        let group = store.require_group(&snapshot.region)?;

        let mut plan = Vec::with_capacity(snapshot.counters.len() + 1);
        for (metric, value) in snapshot.metrics() {
            let dtype = dtype_of(&value);
            let meta = match group.dataset_meta(metric)? {
                Some(existing) => {
                    let dataset = format!("{}/{}", snapshot.region, metric);
                    if existing.peers() != size {
                        return Err(Error::PeerCountMismatch {
                            dataset,
                            found: existing.peers(),
                            expected: size,
                        });
                    }
                    if existing.dtype != dtype {
                        return Err(Error::DtypeMismatch {
                            dataset,
                            found: existing.dtype.to_string(),
                            expected: dtype.to_string(),
                        });
                    }
                    existing.extended()
                }
                None => DatasetMeta::new(dtype, size),
            };
            plan.push(Planned {
                metric,
                value,
                meta,
            });
        }
        peers.barrier()?;

        for planned in &plan {
            group.put_dataset_meta(planned.metric, &planned.meta)?;
        }
        peers.barrier()?;

        for planned in &plan {
            let dataset = group.dataset(planned.metric)?;
            let step = planned.meta.steps() - 1;
            match planned.value {
                MetricValue::Count(v) => dataset.write_cell(rank, step, v)?,
                MetricValue::Seconds(v) => dataset.write_cell(rank, step, v)?,
            }
        }
        peers.barrier()?;

        debug!(
            rank,
            region = %snapshot.region,
            metrics = plan.len(),
            step = plan.first().map(|p| p.meta.steps() - 1),
            "array round written"
        );
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Array
    }
}

/// Reads every cell of a container back as records.
///
/// Records are ordered by region, then round, then rank; within one peer's
/// round counters come in dataset name order followed by `Runtime`.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<OutputRecord>> {
    let store = ArrayStore::open(path.as_ref())?;
    let mut records = Vec::new();

    for region in store.groups()? {
        let group = store.group(&region)?;
        let mut names = group.datasets()?;
        // Runtime closes every block, as in the delimited log.
        if let Some(pos) = names.iter().position(|n| n == RUNTIME_METRIC) {
            let runtime = names.remove(pos);
            names.push(runtime);
        }
        let datasets = names
            .iter()
            .map(|name| group.dataset(name))
            .collect::<Result<Vec<_>>>()?;

        let (peers, steps) = datasets
            .iter()
            .fold((0, 0), |(p, s), d| (p.max(d.meta().peers()), s.max(d.meta().steps())));

        for step in 0..steps {
            for rank in 0..peers {
                for dataset in &datasets {
                    let meta = dataset.meta();
                    if rank >= meta.peers() || step >= meta.steps() {
                        continue;
                    }
                    let value = match meta.dtype {
                        Dtype::U64 => MetricValue::Count(dataset.read_cell(rank, step)?),
                        Dtype::F64 => MetricValue::Seconds(dataset.read_cell(rank, step)?),
                    };
                    records.push(OutputRecord::new(
                        rank as usize,
                        region.as_str(),
                        dataset.metric(),
                        value,
                    ));
                }
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::{LocalGroup, Solo};
    use crate::snapshot::CounterSample;
    use std::thread;
    use std::time::Duration;

    fn snapshot(region: &str, values: &[(&str, u64)], runtime: f64) -> RegionSnapshot {
        RegionSnapshot::new(
            region,
            values
                .iter()
                .map(|(name, value)| CounterSample::new(*name, *value))
                .collect(),
            runtime,
        )
    }

    #[test]
    fn test_extent_grows_one_step_per_round() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.1.pda");
        let mut writer = ArrayWriter::new(&path);

        for round in 0..3u64 {
            writer
                .write(&Solo, &snapshot("loop", &[("A", round * 2)], 0.5 * round as f64))
                .unwrap();
        }

        let store = ArrayStore::open(&path).unwrap();
        let group = store.group("loop").unwrap();
        assert_eq!(group.datasets().unwrap(), vec!["A", "Runtime"]);

        let counts = group.dataset("A").unwrap();
        assert_eq!(counts.shape(), [1, 1, 3]);
        assert_eq!(counts.read_rank::<u64>(0).unwrap(), vec![0, 2, 4]);

        let runtime = group.dataset("Runtime").unwrap();
        assert_eq!(runtime.meta().dtype, Dtype::F64);
        assert_eq!(runtime.read_rank::<f64>(0).unwrap(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_regions_get_separate_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.1.pda");
        let mut writer = ArrayWriter::new(&path);

        writer.write(&Solo, &snapshot("init", &[("A", 1)], 0.1)).unwrap();
        writer.write(&Solo, &snapshot("solve", &[("A", 2)], 0.2)).unwrap();
        writer.write(&Solo, &snapshot("solve", &[("A", 3)], 0.3)).unwrap();

        let store = ArrayStore::open(&path).unwrap();
        assert_eq!(store.groups().unwrap(), vec!["init", "solve"]);
        let init = store.group("init").unwrap().dataset("A").unwrap();
        let solve = store.group("solve").unwrap().dataset("A").unwrap();
        assert_eq!(init.shape(), [1, 1, 1]);
        assert_eq!(solve.shape(), [1, 1, 2]);
    }

    #[test]
    fn test_peers_fill_their_own_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.4.pda");
        let group = LocalGroup::new(4);
        let rounds = 3u64;

        let handles: Vec<_> = group
            .peers()
            .into_iter()
            .map(|peer| {
                let path = path.clone();
                thread::spawn(move || {
                    let rank = peer.rank() as u64;
                    let mut writer = ArrayWriter::new(&path);
                    for round in 0..rounds {
                        thread::sleep(Duration::from_millis(2 * ((rank + round) % 4)));
                        let snap = snapshot(
                            "loop",
                            &[("A", 100 * rank + round), ("B", u64::MAX - rank)],
                            rank as f64 + round as f64 / 8.0,
                        );
                        writer.write(&peer, &snap).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = ArrayStore::open(&path).unwrap();
        let loop_group = store.group("loop").unwrap();
        let a = loop_group.dataset("A").unwrap();
        let b = loop_group.dataset("B").unwrap();
        let runtime = loop_group.dataset("Runtime").unwrap();
        assert_eq!(a.shape(), [4, 1, rounds]);
        assert_eq!(runtime.shape(), [4, 1, rounds]);

        for rank in 0..4u64 {
            for round in 0..rounds {
                assert_eq!(a.read_cell::<u64>(rank, round).unwrap(), 100 * rank + round);
                assert_eq!(b.read_cell::<u64>(rank, round).unwrap(), u64::MAX - rank);
                assert_eq!(
                    runtime.read_cell::<f64>(rank, round).unwrap().to_bits(),
                    (rank as f64 + round as f64 / 8.0).to_bits()
                );
            }
        }
    }

    #[test]
    fn test_peer_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.pda");
        let store = ArrayStore::create_or_open(&path).unwrap();
        store
            .require_group("loop")
            .unwrap()
            .put_dataset_meta("A", &DatasetMeta::new(Dtype::U64, 3))
            .unwrap();

        let err = ArrayWriter::new(&path)
            .write(&Solo, &snapshot("loop", &[("A", 1)], 0.0))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PeerCountMismatch {
                found: 3,
                expected: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_dtype_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.1.pda");
        let store = ArrayStore::create_or_open(&path).unwrap();
        store
            .require_group("loop")
            .unwrap()
            .put_dataset_meta(RUNTIME_METRIC, &DatasetMeta::new(Dtype::U64, 1))
            .unwrap();

        let err = ArrayWriter::new(&path)
            .write(&Solo, &snapshot("loop", &[("A", 1)], 0.0))
            .unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn test_unusual_names_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.1.pda");
        let mut writer = ArrayWriter::new(&path);
        for region in ["", ".warmup", "phase\\1", "io/read"] {
            writer
                .write(&Solo, &snapshot(region, &[("a/b", 7)], 0.5))
                .unwrap();
        }

        let records = read_records(&path).unwrap();
        let mut regions: Vec<_> = records.iter().map(|r| r.region.as_str()).collect();
        regions.dedup();
        assert_eq!(regions, vec!["", ".warmup", "io/read", "phase\\1"]);
        assert!(records
            .iter()
            .filter(|r| r.metric != RUNTIME_METRIC)
            .all(|r| r.metric == "a/b" && r.value == MetricValue::Count(7)));
    }

    #[test]
    fn test_read_records_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf_dump.1.pda");
        let mut writer = ArrayWriter::new(&path);
        writer.write(&Solo, &snapshot("r", &[("B", 2), ("A", 1)], 0.5)).unwrap();
        writer.write(&Solo, &snapshot("r", &[("B", 4), ("A", 3)], 0.25)).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(
            records,
            vec![
                OutputRecord::new(0, "r", "A", MetricValue::Count(1)),
                OutputRecord::new(0, "r", "B", MetricValue::Count(2)),
                OutputRecord::new(0, "r", RUNTIME_METRIC, MetricValue::Seconds(0.5)),
                OutputRecord::new(0, "r", "A", MetricValue::Count(3)),
                OutputRecord::new(0, "r", "B", MetricValue::Count(4)),
                OutputRecord::new(0, "r", RUNTIME_METRIC, MetricValue::Seconds(0.25)),
            ]
        );
    }
}
