use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use parking_lot::Mutex;

use crate::Epoch;

/// Tracks the monotonic cleaning epoch and the epochs of in-flight
/// requests.
///
/// Writers stamp each request with the current epoch by holding an
/// [`RpcGuard`] for its duration. The cleaner advances the epoch once
/// per cleaning pass, and the segment manager reclaims a cleaned
/// segment only once every request stamped with its cleaning epoch or
/// earlier has drained.
#[derive(Debug, Default)]
pub struct RpcEpochs {
    current: AtomicU64,
    // In-flight request epochs. A scan is plenty: the table is only as
    // large as the peak number of concurrent requests.
    inflight: Mutex<Inflight>,
}

#[derive(Debug, Default)]
struct Inflight {
    epochs: Vec<Option<Epoch>>,
    free: Vec<usize>,
}

/// RAII registration of one in-flight request. The request is
/// considered outstanding until the guard drops.
#[derive(Debug)]
pub struct RpcGuard<'a> {
    epochs: &'a RpcEpochs,
    slot: usize,
}

impl RpcEpochs {
    /// Build a fresh epoch source starting at epoch 0.
    pub fn new() -> RpcEpochs {
        RpcEpochs::default()
    }

    /// The current epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.current.load(SeqCst)
    }

    /// Advance the epoch, returning the new value. Callers stamp
    /// just-cleaned segments with `new - 1`, the last epoch any
    /// request could have observed them in.
    pub fn increment_current_epoch(&self) -> Epoch {
        self.current.fetch_add(1, SeqCst) + 1
    }

    /// Register an in-flight request at the current epoch.
    pub fn track(&self) -> RpcGuard<'_> {
        let epoch = self.current_epoch();
        let mut inflight = self.inflight.lock();
        let slot = match inflight.free.pop() {
            Some(slot) => {
                inflight.epochs[slot] = Some(epoch);
                slot
            }
            None => {
                inflight.epochs.push(Some(epoch));
                inflight.epochs.len() - 1
            }
        };
        RpcGuard { epochs: self, slot }
    }

    /// The earliest epoch of any in-flight request, or `u64::MAX` when
    /// none are outstanding.
    pub fn earliest_outstanding_epoch(&self) -> Epoch {
        let inflight = self.inflight.lock();
        inflight
            .epochs
            .iter()
            .filter_map(|slot| *slot)
            .min()
            .unwrap_or(u64::MAX)
    }
}

impl Drop for RpcGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.epochs.inflight.lock();
        inflight.epochs[self.slot] = None;
        inflight.free.push(self.slot);
    }
}
