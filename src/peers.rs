//! The peer group: the fixed set of cooperating processes of one session.
//!
//! Writers never lock anything and never elect a coordinator. Everything they
//! need from the other peers goes through two collectives, an all-gather of
//! one `u64` per peer and a barrier. Every peer must issue every collective of
//! a round exactly once; a peer that skips one leaves the others blocked.
//!
//! # Implementations
//!
//! | Type | Peers | Use |
//! |------|-------|-----|
//! | [`Solo`] | 1 | a single process, collectives return immediately |
//! | [`LocalGroup`] / [`LocalPeer`] | N threads | peers as threads of one process |
//! | [`TcpPeer`] | N processes | one process per rank, joined by a TCP mesh |
//!
//! Other transports (an MPI communicator, say) plug in by implementing
//! [`PeerGroup`].
//!
//! # Aborting
//!
//! A fatal error in one peer must not leave the others waiting forever on a
//! collective that will never complete. [`PeerGroup::abort`] tears the whole
//! group down: every pending and future collective of every peer fails with
//! [`Error::Aborted`](crate::Error::Aborted).

mod local;
mod solo;
mod tcp;

pub use local::{LocalGroup, LocalPeer};
pub use solo::Solo;
pub use tcp::{TcpPeer, DEFAULT_CONNECT_TIMEOUT};

use crate::error::Result;

/// Collective operations over a fixed group of peers.
pub trait PeerGroup: Send {
    /// This peer's rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of peers in the group. Never changes.
    fn size(&self) -> usize;

    /// Contributes `value` and returns every peer's contribution, indexed by
    /// rank. Completes only once every peer has contributed.
    fn all_gather(&self, value: u64) -> Result<Vec<u64>>;

    /// Blocks until every peer has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Aborts the whole group after a fatal error in this peer.
    fn abort(&self, reason: &str);
}

impl<P: PeerGroup + ?Sized> PeerGroup for Box<P> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
        (**self).all_gather(value)
    }

    fn barrier(&self) -> Result<()> {
        (**self).barrier()
    }

    fn abort(&self, reason: &str) {
        (**self).abort(reason)
    }
}
