//! Flat, append-only delimited log.
//!
//! Every round appends one block per peer, blocks ordered by rank:
//!
//! ```text
//! 0,solve,MINFLT,120
//! 0,solve,UTIME,57
//! 0,solve,Runtime,0.8000000
//! 1,solve,MINFLT,98
//! 1,solve,UTIME,61
//! 1,solve,Runtime,0.7990000
//! ```
//!
//! A round goes like this on every peer:
//!
//! 1. serialize this peer's rows and measure the block,
//! 2. read the artifact size at round start (`base`),
//! 3. exchange block lengths ([`exchange`](crate::exchange::exchange)),
//! 4. write the block at `base + Σ lengths of lower ranks`,
//! 5. wait at a barrier so the next round sees the complete file.
//!
//! Offsets come only from the gathered lengths, so which peer finishes
//! serializing first never changes the layout.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{write_all_at, ParallelWriter};
use crate::config::OutputFormat;
use crate::counters::{MetricValue, RUNTIME_METRIC};
use crate::error::{Error, Result};
use crate::exchange;
use crate::peers::PeerGroup;
use crate::snapshot::{OutputRecord, RegionSnapshot};

/// Writer for the delimited log format.
#[derive(Debug, Clone)]
pub struct DelimitedWriter {
    path: PathBuf,
}

impl DelimitedWriter {
    /// Creates a writer appending to `path`. Nothing is opened until the
    /// first round.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ParallelWriter for DelimitedWriter {
    fn write(&mut self, peers: &dyn PeerGroup, snapshot: &RegionSnapshot) -> Result<()> {
        let rank = peers.rank();
        let block = serialize(rank, snapshot);

        // Positional writes: an O_APPEND descriptor would ignore the offset.
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        let base = file
            .metadata()
            .map_err(|e| Error::io(&self.path, e))?
            .len();

        let placement = exchange::exchange(peers, base, block.len() as u64)?;
        write_all_at(&file, block.as_bytes(), placement.offset)
            .map_err(|e| Error::io(&self.path, e))?;
        file.sync_data().map_err(|e| Error::io(&self.path, e))?;
        drop(file);

        peers.barrier()?;
        debug!(
            rank,
            region = %snapshot.region,
            offset = placement.offset,
            len = placement.len,
            round_bytes = placement.total,
            "delimited round written"
        );
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Csv
    }
}

/// Serializes one peer's block: one row per counter, then the runtime row.
///
/// # Examples
///
/// ```rust
/// use perfdump::snapshot::{CounterSample, RegionSnapshot};
/// use perfdump::writers::delimited::serialize;
///
/// let snapshot = RegionSnapshot::new("solve", vec![CounterSample::new("MINFLT", 25)], 0.8);
/// assert_eq!(serialize(3, &snapshot), "3,solve,MINFLT,25\n3,solve,Runtime,0.8000000\n");
/// ```
pub fn serialize(rank: usize, snapshot: &RegionSnapshot) -> String {
    let mut block = String::new();
    for (metric, value) in snapshot.metrics() {
        // Writing into a String cannot fail.
        let _ = writeln!(block, "{},{},{},{}", rank, snapshot.region, metric, value);
    }
    block
}

/// Parses one line of the log.
///
/// Region names may contain commas, metric names may not: the rank is split
/// off the front, value and metric off the back.
pub fn parse_line(line: &str) -> Result<OutputRecord> {
    let malformed = || Error::Format(format!("malformed delimited row {:?}", line));

    let mut tail = line.rsplitn(3, ',');
    let value = tail.next().ok_or_else(malformed)?;
    let metric = tail.next().ok_or_else(malformed)?;
    let head = tail.next().ok_or_else(malformed)?;
    let (rank, region) = head.split_once(',').ok_or_else(malformed)?;

    let rank = rank.parse().map_err(|_| malformed())?;
    let value = if metric == RUNTIME_METRIC {
        MetricValue::Seconds(value.parse().map_err(|_| malformed())?)
    } else {
        MetricValue::Count(value.parse().map_err(|_| malformed())?)
    };
    Ok(OutputRecord::new(rank, region, metric, value))
}

/// Reads every record of a delimited log, in file order.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<OutputRecord>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}
