//! Collective offset exchange.
//!
//! Given the number of bytes each peer wants to append, every peer learns
//! where its own bytes go: an all-gather of the lengths followed by an
//! exclusive prefix sum over the lower ranks.
//!
//! ```text
//!   lengths   L0=30   L1=12   L2=25
//!   base=100  ├───────┼───────┼───────┤
//!             100     130     142     167
//!             rank 0  rank 1  rank 2
//! ```
//!
//! The result depends only on the gathered lengths, never on which peer
//! finished first, so blocks are always contiguous, disjoint and in rank
//! order. The exchange knows nothing about file formats.

use std::ops::Range;

use crate::error::{Error, Result};
use crate::peers::PeerGroup;

/// Where one peer's block lands in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// First byte of this peer's block.
    pub offset: u64,
    /// Length of this peer's block.
    pub len: u64,
    /// Total bytes appended by all peers this round.
    pub total: u64,
}

impl Placement {
    /// The byte range this peer writes.
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }
}

/// Sum of the lengths of all ranks strictly below `rank`.
///
/// # Examples
///
/// ```rust
/// use perfdump::exchange::exclusive_prefix_sum;
///
/// let lengths = [30, 12, 25];
/// assert_eq!(exclusive_prefix_sum(&lengths, 0), 0);
/// assert_eq!(exclusive_prefix_sum(&lengths, 1), 30);
/// assert_eq!(exclusive_prefix_sum(&lengths, 2), 42);
/// ```
pub fn exclusive_prefix_sum(lengths: &[u64], rank: usize) -> u64 {
    lengths.iter().take(rank).sum()
}

/// Computes this peer's placement from already gathered lengths.
pub fn place(base: u64, lengths: &[u64], rank: usize) -> Result<Placement> {
    let len = *lengths.get(rank).ok_or_else(|| {
        Error::Format(format!(
            "rank {} missing from {} gathered lengths",
            rank,
            lengths.len()
        ))
    })?;
    Ok(Placement {
        offset: base + exclusive_prefix_sum(lengths, rank),
        len,
        total: lengths.iter().sum(),
    })
}

/// Exchanges `len` with every peer and returns this peer's placement after
/// `base`.
///
/// Collective: every peer of the group must call it once per round. A group
/// of one skips the exchange.
pub fn exchange<P: PeerGroup + ?Sized>(peers: &P, base: u64, len: u64) -> Result<Placement> {
    if peers.size() == 1 {
        return Ok(Placement {
            offset: base,
            len,
            total: len,
        });
    }
    let lengths = peers.all_gather(len)?;
    place(base, &lengths, peers.rank())
}
