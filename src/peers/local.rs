//! Peers as threads of one process.
//!
//! [`LocalGroup`] runs a whole peer group inside a single process, one thread
//! per rank. It is what the tests and the demo use to exercise the collective
//! write paths without launching processes.
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!              │               Shared state               │
//!              ├──────────────────────────────────────────┤
//!   rank 0 ──► │ [slot 0] ████████ (CachePadded<AtomicU64>)│
//!   rank 1 ──► │ [slot 1] ████████                        │
//!     ...      │   ...                                    │
//!              │ barrier: arrived / generation / aborted  │
//!              └──────────────────────────────────────────┘
//! ```
//!
//! An all-gather stores this rank's value in its own slot, waits at the
//! barrier, reads every slot, then waits once more so that no peer can start
//! the next all-gather (and overwrite its slot) while a slower peer is still
//! reading.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam_utils::CachePadded;
use tracing::error;

use super::PeerGroup;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: Option<String>,
}

#[derive(Debug)]
struct Shared {
    slots: Vec<CachePadded<AtomicU64>>,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(reason) = &state.aborted {
            return Err(Error::Aborted(reason.clone()));
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.slots.len() {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation && state.aborted.is_none() {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        match (&state.aborted, state.generation == generation) {
            (Some(reason), true) => Err(Error::Aborted(reason.clone())),
            _ => Ok(()),
        }
    }

    fn abort(&self, reason: &str) {
        let mut state = self.lock();
        if state.aborted.is_none() {
            state.aborted = Some(reason.to_string());
        }
        self.released.notify_all();
    }
}

/// A peer group whose members are threads of the current process.
///
/// Cloning a `LocalGroup` yields another handle to the same group.
///
/// # Examples
///
/// ```rust
/// use perfdump::peers::{LocalGroup, PeerGroup};
/// use std::thread;
///
/// let group = LocalGroup::new(3);
/// let handles: Vec<_> = group
///     .peers()
///     .into_iter()
///     .map(|peer| thread::spawn(move || peer.all_gather(peer.rank() as u64 * 10).unwrap()))
///     .collect();
///
/// for handle in handles {
///     assert_eq!(handle.join().unwrap(), vec![0, 10, 20]);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LocalGroup {
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates a group of `size` peers.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a peer group needs at least one peer");
        let slots = (0..size)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self {
            shared: Arc::new(Shared {
                slots,
                state: Mutex::new(BarrierState::default()),
                released: Condvar::new(),
            }),
        }
    }

    /// Number of peers in the group.
    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    /// Returns the handle for `rank`.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is out of range.
    pub fn peer(&self, rank: usize) -> LocalPeer {
        assert!(rank < self.size(), "rank {} out of range", rank);
        LocalPeer {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns one handle per rank, in rank order.
    pub fn peers(&self) -> Vec<LocalPeer> {
        (0..self.size()).map(|rank| self.peer(rank)).collect()
    }

    /// Returns the abort reason if any peer aborted the group.
    pub fn aborted(&self) -> Option<String> {
        self.shared.lock().aborted.clone()
    }
}

/// One rank's handle on a [`LocalGroup`].
#[derive(Debug)]
pub struct LocalPeer {
    rank: usize,
    shared: Arc<Shared>,
}

impl PeerGroup for LocalPeer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.slots.len()
    }

    fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
        self.shared.slots[self.rank].store(value, Ordering::Release);
        self.shared.barrier()?;
        let values = self
            .shared
            .slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect();
        self.shared.barrier()?;
        Ok(values)
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier()
    }

    fn abort(&self, reason: &str) {
        error!(rank = self.rank, reason, "aborting peer group");
        self.shared.abort(&format!("rank {}: {}", self.rank, reason));
    }
}
