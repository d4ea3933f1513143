use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{Error, Result, Segment, SegmentId};

/// Handle to one segment's replicas on backups. Owned by the segment;
/// the replica manager never holds a reference back into the segment
/// manager, keeping the ownership graph cycle-free.
pub trait ReplicatedSegment: Send {
    /// Mark the replicas closed. No further data will be appended.
    fn close(&self) -> Result<()>;

    /// Block until the first `up_to` bytes of the segment are durable
    /// on the required number of backups.
    fn sync(&self, up_to: u32) -> Result<()>;

    /// Identifier of the segment these replicas belong to.
    fn segment_id(&self) -> SegmentId;
}

/// Persists segments to backups. Head allocations are synchronously
/// replicated before returning, so the caller may rely on the header
/// and digest being durable; non-head (survivor) allocations replicate
/// in the background and are synced explicitly.
pub trait ReplicaManager: Send + Sync {
    /// Open replicas for a new head segment. `prev` is the previous
    /// head's handle, used to chain the close of the old head after
    /// the open of the new one on each backup.
    fn allocate_head(
        &self,
        id: SegmentId,
        segment: &Segment,
        prev: Option<&dyn ReplicatedSegment>,
    ) -> Result<Box<dyn ReplicatedSegment>>;

    /// Open replicas for a closed (non-head) segment.
    fn allocate_non_head(
        &self,
        id: SegmentId,
        segment: &Segment,
    ) -> Result<Box<dyn ReplicatedSegment>>;
}

/// Everything observable about a `MemReplicaManager`'s history, in
/// call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A head was opened. `chained_from` is the previous head's id.
    AllocateHead {
        /// The new head's segment id.
        id: SegmentId,
        /// Bytes already appended (header + digest) at open time.
        bytes: u32,
        /// The previous replicated head, if any.
        chained_from: Option<SegmentId>,
    },
    /// A non-head (survivor) segment was opened.
    AllocateNonHead {
        /// The survivor's segment id.
        id: SegmentId,
    },
    /// A segment's replicas were closed.
    Close {
        /// The closed segment's id.
        id: SegmentId,
    },
    /// A segment's replicas were synced up to a length.
    Sync {
        /// The synced segment's id.
        id: SegmentId,
        /// The durable length.
        up_to: u32,
    },
}

#[derive(Debug, Default)]
struct MemInner {
    events: Vec<ReplicaEvent>,
    open: HashMap<SegmentId, bool>,
    heads: HashSet<SegmentId>,
    synced: HashMap<SegmentId, u32>,
    fail_allocations: bool,
}

/// An in-memory, non-durable `ReplicaManager`. Records every call so
/// tests can assert on replication ordering, and serves single-node
/// deployments that run without backups.
#[derive(Debug, Default)]
pub struct MemReplicaManager {
    inner: Arc<Mutex<MemInner>>,
}

/// The handle type `MemReplicaManager` hands out.
#[derive(Debug)]
pub struct MemReplica {
    id: SegmentId,
    inner: Arc<Mutex<MemInner>>,
}

impl MemReplicaManager {
    /// Build an empty manager.
    pub fn new() -> MemReplicaManager {
        MemReplicaManager::default()
    }

    /// Make every subsequent allocation fail, to exercise the fatal
    /// replication path.
    pub fn fail_allocations(&self, fail: bool) {
        self.inner.lock().fail_allocations = fail;
    }

    /// The full call history.
    pub fn events(&self) -> Vec<ReplicaEvent> {
        self.inner.lock().events.clone()
    }

    /// Whether the given segment's replicas are currently open.
    pub fn is_open(&self, id: SegmentId) -> bool {
        self.inner.lock().open.get(&id) == Some(&true)
    }

    /// The durable length recorded for the given segment.
    pub fn synced_len(&self, id: SegmentId) -> u32 {
        self.inner.lock().synced.get(&id).copied().unwrap_or(0)
    }

    /// How many heads are open right now. The rotation protocol keeps
    /// this at exactly one once the first head exists; it dips to zero
    /// only between the open of a new head and the close of its
    /// predecessor, inside a single rotation.
    pub fn open_head_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .heads
            .iter()
            .filter(|id| inner.open.get(id) == Some(&true))
            .count()
    }

    fn allocate(
        &self,
        id: SegmentId,
        segment: &Segment,
        chained_from: Option<SegmentId>,
        head: bool,
    ) -> Result<Box<dyn ReplicatedSegment>> {
        let mut inner = self.inner.lock();
        if inner.fail_allocations {
            return Err(Error::ReplicaFailure("allocation refused"));
        }

        let bytes = segment.appended_len();
        if head {
            trace!(
                "opening replicated head {} with {} initial bytes",
                id,
                bytes
            );
            inner.events.push(ReplicaEvent::AllocateHead { id, bytes, chained_from });
            inner.heads.insert(id);
            // Head opens are synchronously durable.
            inner.synced.insert(id, bytes);
        } else {
            trace!("opening replicated non-head {}", id);
            inner.events.push(ReplicaEvent::AllocateNonHead { id });
        }
        inner.open.insert(id, true);

        Ok(Box::new(MemReplica { id, inner: Arc::clone(&self.inner) }))
    }
}

impl ReplicaManager for MemReplicaManager {
    fn allocate_head(
        &self,
        id: SegmentId,
        segment: &Segment,
        prev: Option<&dyn ReplicatedSegment>,
    ) -> Result<Box<dyn ReplicatedSegment>> {
        self.allocate(id, segment, prev.map(|p| p.segment_id()), true)
    }

    fn allocate_non_head(
        &self,
        id: SegmentId,
        segment: &Segment,
    ) -> Result<Box<dyn ReplicatedSegment>> {
        self.allocate(id, segment, None, false)
    }
}

impl ReplicatedSegment for MemReplica {
    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        debug!("closing replicated segment {}", self.id);
        inner.events.push(ReplicaEvent::Close { id: self.id });
        inner.open.insert(self.id, false);
        Ok(())
    }

    fn sync(&self, up_to: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.events.push(ReplicaEvent::Sync { id: self.id, up_to });
        let synced = inner.synced.entry(self.id).or_insert(0);
        if up_to > *synced {
            *synced = up_to;
        }
        Ok(())
    }

    fn segment_id(&self) -> SegmentId {
        self.id
    }
}
