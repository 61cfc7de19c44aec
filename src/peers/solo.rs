//! Single-process peer group.

use tracing::error;

use super::PeerGroup;
use crate::error::Result;

/// A peer group of one: rank 0 of 1.
///
/// Collectives complete immediately. Aborting only logs, since no other
/// peer can be left waiting; the fatal error is still returned to the caller.
///
/// # Examples
///
/// ```rust
/// use perfdump::peers::{PeerGroup, Solo};
///
/// let peers = Solo;
/// assert_eq!(peers.rank(), 0);
/// assert_eq!(peers.size(), 1);
/// assert_eq!(peers.all_gather(17).unwrap(), vec![17]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Solo;

impl PeerGroup for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
        Ok(vec![value])
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self, reason: &str) {
        error!(reason, "aborting single-peer group");
    }
}
