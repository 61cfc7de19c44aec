//! Coordinated parallel writers.
//!
//! At the end of every region each peer hands its [`RegionSnapshot`] to the
//! session's writer. All peers call [`ParallelWriter::write`] for the same
//! region in the same order (a *round*) and the writer merges their records
//! into one shared artifact without locks and without a coordinator.
//!
//! | Writer | Format | Layout |
//! |--------|--------|--------|
//! | [`DelimitedWriter`] | [`OutputFormat::Csv`] | `rank,region,metric,value` lines, one contiguous rank-ordered block per round |
//! | [`ArrayWriter`] | [`OutputFormat::Array`] | one group per region, one `[peers, 1, rounds]` dataset per metric |
//!
//! Exactly one writer is active per session; it is picked at init from the
//! configuration and never changes.
//!
//! # Caller obligations
//!
//! Rounds are collective and lockstep. A peer that skips a round, or writes
//! regions in a different order than the others, blocks the group or
//! corrupts the artifact. Writers do not try to detect this.

pub mod array;
pub mod delimited;

pub use array::ArrayWriter;
pub use delimited::DelimitedWriter;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::OutputFormat;
use crate::error::Result;
use crate::peers::PeerGroup;
use crate::snapshot::RegionSnapshot;

/// Durable, collective append of one record set per round.
pub trait ParallelWriter: Send {
    /// Appends this peer's records for one round.
    ///
    /// Rank and group size come from `peers`. Collective: every peer of the
    /// group must call it for the same region in the same round.
    fn write(&mut self, peers: &dyn PeerGroup, snapshot: &RegionSnapshot) -> Result<()>;

    /// Path of the shared artifact.
    fn path(&self) -> &Path;

    /// Layout this writer produces.
    fn format(&self) -> OutputFormat;
}

/// Creates the writer for `format`, targeting `path`.
pub fn create(format: OutputFormat, path: impl Into<PathBuf>) -> Box<dyn ParallelWriter> {
    match format {
        OutputFormat::Csv => Box::new(DelimitedWriter::new(path)),
        OutputFormat::Array => Box::new(ArrayWriter::new(path)),
    }
}

/// Writes all of `buf` at `offset` without moving any shared cursor.
#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes at `offset`; returns how many were read.
#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64)? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        match file.seek_read(&mut buf[filled..], offset + filled as u64)? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
