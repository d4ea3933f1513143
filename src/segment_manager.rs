//! The segment manager owns every log segment in DRAM and drives each
//! one through its lifecycle: allocation, head duty, cleaning, digest
//! retirement, epoch-gated reclamation, and finally the return of its
//! slot and seglets to the pool.
//!
//! All bookkeeping lives under one mutex. The two replication calls
//! made during head rotation intentionally happen while it is held:
//! serializing rotations is the price of never having zero open
//! replicated heads.

use std::sync::Arc;

use fnv::FnvHashMap;
use log::{debug, info, trace};
use parking_lot::Mutex;

use crate::constants::EMERGENCY_HEAD_COUNT;
use crate::metrics::Metrics;
use crate::segment::ReserveKind;
use crate::{
    Config, EntryType, Error, LogDigest, Measure, ReplicaManager, Result,
    RpcEpochs, Segment, SegmentHeader, SegmentId, SegletAllocator, Slot,
    INVALID_SEGMENT_ID, M,
};

/// The lifecycle state of a live segment. Every live segment is on
/// exactly one state list; `Freed` is terminal and never stored, since
/// freeing vacates the slot entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The open segment accepting appends. At most one exists.
    Head,
    /// Closed, but not yet advertised to the cleaner.
    NewlyCleanable,
    /// Closed and visible to the cleaner.
    Cleanable,
    /// A survivor the cleaner is writing. Not yet part of the log.
    CleaningInto,
    /// Cleaning finished; waits for the next digest to join the log.
    CleanablePendingDigest,
    /// A cleaned source segment; must leave the next digest before it
    /// can be reclaimed.
    FreeablePendingDigestAndReferences,
    /// Out of every digest; waits for requests from its cleaning epoch
    /// or earlier to drain.
    FreeablePendingReferences,
    /// Terminal. The slot has returned to the free stack.
    Freed,
}

const STATE_LIST_COUNT: usize = 7;

impl State {
    fn list_index(self) -> usize {
        match self {
            State::Head => 0,
            State::NewlyCleanable => 1,
            State::Cleanable => 2,
            State::CleaningInto => 3,
            State::CleanablePendingDigest => 4,
            State::FreeablePendingDigestAndReferences => 5,
            State::FreeablePendingReferences => 6,
            State::Freed => panic!("freed segments are not on any list"),
        }
    }
}

/// What an allocation is for. Decides which reserve may satisfy it and
/// which initial state the segment takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    Head,
    EmergencyHead,
    Survivor,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    next: Option<Slot>,
    prev: Option<Slot>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotList {
    head: Option<Slot>,
    tail: Option<Slot>,
    len: usize,
}

#[derive(Clone, Copy)]
enum LinkField {
    State,
    All,
}

struct SlotEntry {
    segment: Arc<Segment>,
    state: State,
    state_link: Links,
    all_link: Links,
}

struct Inner {
    next_segment_id: SegmentId,
    slots: Vec<Option<SlotEntry>>,
    free_slots: Vec<Slot>,
    id_to_slot: FnvHashMap<SegmentId, Slot>,
    by_state: [SlotList; STATE_LIST_COUNT],
    all: SlotList,
    emergency_heads_alloced: usize,
    survivor_reserve: usize,
    survivor_alloced: usize,
    log_iterator_count: usize,
}

/// The central bookkeeper of the log. See the crate docs for the
/// safety properties it maintains.
pub struct SegmentManager {
    log_id: u64,
    max_segments: usize,
    allocator: Arc<SegletAllocator>,
    replicas: Arc<dyn ReplicaManager>,
    epochs: Arc<RpcEpochs>,
    inner: Mutex<Inner>,
}

fn link_of(entry: &mut SlotEntry, field: LinkField) -> &mut Links {
    match field {
        LinkField::State => &mut entry.state_link,
        LinkField::All => &mut entry.all_link,
    }
}

fn list_push_back(
    slots: &mut [Option<SlotEntry>],
    list: &mut SlotList,
    slot: Slot,
    field: LinkField,
) {
    {
        let links = link_of(slots[slot].as_mut().unwrap(), field);
        links.prev = list.tail;
        links.next = None;
    }

    match list.tail {
        Some(tail) => {
            link_of(slots[tail].as_mut().unwrap(), field).next = Some(slot)
        }
        None => list.head = Some(slot),
    }

    list.tail = Some(slot);
    list.len += 1;
}

fn list_remove(
    slots: &mut [Option<SlotEntry>],
    list: &mut SlotList,
    slot: Slot,
    field: LinkField,
) {
    let Links { next, prev } = *link_of(slots[slot].as_mut().unwrap(), field);

    match prev {
        Some(p) => link_of(slots[p].as_mut().unwrap(), field).next = next,
        None => list.head = next,
    }
    match next {
        Some(n) => link_of(slots[n].as_mut().unwrap(), field).prev = prev,
        None => list.tail = prev,
    }

    *link_of(slots[slot].as_mut().unwrap(), field) = Links::default();
    list.len -= 1;
}

fn head_segment(inner: &Inner) -> Option<Arc<Segment>> {
    let list = &inner.by_state[State::Head.list_index()];
    assert!(list.len <= 1, "multiple head segments");
    list.head.map(|slot| inner.slots[slot].as_ref().unwrap().segment.clone())
}

impl SegmentManager {
    /// Build a segment manager over the given pool, replica manager,
    /// and epoch source.
    ///
    /// Fails with [`Error::BadFactor`] when the disk expansion factor
    /// is below 1.0, and with [`Error::TooFewSegments`] when the pool
    /// cannot even cover the emergency head reserve.
    pub fn new(
        config: &Config,
        allocator: Arc<SegletAllocator>,
        replicas: Arc<dyn ReplicaManager>,
        epochs: Arc<RpcEpochs>,
    ) -> Result<SegmentManager> {
        if config.disk_expansion_factor < 1.0 {
            return Err(Error::BadFactor);
        }

        let initial_free = allocator.free_segment_count();
        if initial_free < EMERGENCY_HEAD_COUNT {
            return Err(Error::TooFewSegments);
        }

        let max_segments =
            (initial_free as f64 * config.disk_expansion_factor) as usize;
        assert!(max_segments >= initial_free);

        debug!(
            "pinning log {} memory region {:?} ({} bytes), {} slots",
            config.log_id,
            allocator.base_address(),
            allocator.total_bytes(),
            max_segments
        );

        let mut slots = Vec::with_capacity(max_segments);
        slots.resize_with(max_segments, || None);

        Ok(SegmentManager {
            log_id: config.log_id,
            max_segments,
            allocator,
            replicas,
            epochs,
            inner: Mutex::new(Inner {
                next_segment_id: 0,
                slots,
                free_slots: (0..max_segments).collect(),
                id_to_slot: FnvHashMap::default(),
                by_state: [SlotList::default(); STATE_LIST_COUNT],
                all: SlotList::default(),
                emergency_heads_alloced: 0,
                survivor_reserve: 0,
                survivor_alloced: 0,
                log_iterator_count: 0,
            }),
        })
    }

    /// Allocate a new head segment, writing its header and the log
    /// digest, opening it on backups, and retiring the previous head.
    /// The caller need not do anything special: the returned segment
    /// is already durable as the open head of the log.
    ///
    /// Returns `Ok(None)` when memory is exhausted and no emergency
    /// head is warranted; the previous head remains the head of the
    /// log. With `must_not_fail`, an immutable emergency head is
    /// returned instead of `None`.
    pub fn alloc_head(
        &self,
        must_not_fail: bool,
    ) -> Result<Option<Arc<Segment>>> {
        let _measure = Measure::new(&M.head_rotation);
        let mut inner = self.inner.lock();

        let prev_head = head_segment(&inner);

        let new_head = match self.alloc(&mut inner, AllocKind::Head) {
            Some(segment) => segment,
            None => {
                // Even when out of memory we may need an emergency
                // head, either because the caller cannot take no for
                // an answer (replica failure recovery) or because
                // cleaned segments are waiting on a digest to free
                // memory.
                let freeable = State::FreeablePendingDigestAndReferences;
                if must_not_fail
                    || inner.by_state[freeable.list_index()].len > 0
                {
                    self.alloc(&mut inner, AllocKind::EmergencyHead)
                        .expect("emergency head reserve exhausted")
                } else {
                    return Ok(None);
                }
            }
        };

        self.write_header(&new_head, INVALID_SEGMENT_ID)?;

        match &prev_head {
            Some(prev) if !prev.is_emergency_head() => {
                self.write_digest(&mut inner, &new_head, Some(prev.as_ref()))?
            }
            _ => self.write_digest(&mut inner, &new_head, None)?,
        }

        // An emergency head exists only to keep a replicated segment
        // open; nothing else may enter it, and the next rotation
        // reclaims it without cleaning.
        if new_head.is_emergency_head() {
            new_head.disable_appends();
        }

        // Open the new head on backups. This synchronously replicates
        // the header and digest before returning.
        let replica = match &prev_head {
            Some(prev) => prev.with_replica(|prev_replica| {
                self.replicas.allocate_head(
                    new_head.id(),
                    &new_head,
                    prev_replica,
                )
            })?,
            None => self.replicas.allocate_head(new_head.id(), &new_head, None)?,
        };
        new_head.install_replica(replica);

        // Close the old head only after the new one is open, so that
        // backups always hold an open segment for this log unless a
        // coordinated failure makes that unambiguously detectable.
        if let Some(prev) = prev_head {
            prev.with_replica(|replica| -> Result<()> {
                let replica = replica
                    .ok_or(Error::ReplicaFailure("previous head lost its replica"))?;
                replica.close()?;
                replica.sync(prev.appended_len())
            })?;

            if prev.is_emergency_head() {
                self.free(&mut inner, prev.slot());
            } else {
                self.change_state(&mut inner, prev.slot(), State::NewlyCleanable);
            }
        }

        debug!(
            "rotated log {} head to segment {}{}",
            self.log_id,
            new_head.id(),
            if new_head.is_emergency_head() { " (emergency)" } else { "" }
        );

        Ok(Some(new_head))
    }

    /// Allocate a segment for the cleaner to write survivor data into.
    ///
    /// `head_id_during_cleaning` is the head's identifier when the
    /// current cleaning pass began; stamping it lets recovery order
    /// survivor contents before that head. Returns `Ok(None)` when the
    /// survivor reserve is exhausted and the cleaner must back off.
    pub fn alloc_survivor(
        &self,
        head_id_during_cleaning: SegmentId,
    ) -> Result<Option<Arc<Segment>>> {
        let mut inner = self.inner.lock();

        let segment = match self.alloc(&mut inner, AllocKind::Survivor) {
            Some(segment) => segment,
            None => return Ok(None),
        };

        self.write_header(&segment, head_id_during_cleaning)?;

        let replica =
            self.replicas.allocate_non_head(segment.id(), &segment)?;
        segment.install_replica(replica);

        Ok(Some(segment))
    }

    /// Notify the manager that a cleaning pass has completed.
    ///
    /// Every survivor allocated since the previous pass will join the
    /// log at the next digest; every segment in `cleaned` is stamped
    /// with the pass's epoch and leaves the log at the next digest.
    pub fn cleaning_complete(&self, cleaned: &[Arc<Segment>]) {
        let mut inner = self.inner.lock();

        let mut seglets_used = 0;
        let mut seglets_freed = 0;

        // Survivors wait for the next digest before becoming part of
        // the log.
        let cleaning_into = State::CleaningInto.list_index();
        while let Some(slot) = inner.by_state[cleaning_into].head {
            let segment =
                inner.slots[slot].as_ref().unwrap().segment.clone();
            seglets_used += segment.seglets_allocated();
            self.change_state(
                &mut inner,
                slot,
                State::CleanablePendingDigest,
            );
        }

        // Save the last epoch any in-flight request could have seen
        // the cleaned segments in.
        let epoch = self.epochs.increment_current_epoch() - 1;

        for segment in cleaned {
            seglets_freed += segment.seglets_allocated();
            segment.set_cleaned_epoch(epoch);
            self.change_state(
                &mut inner,
                segment.slot(),
                State::FreeablePendingDigestAndReferences,
            );
        }

        Metrics::bump(&M.cleanings_completed);
        info!(
            "cleaning pass (epoch {}) used {} seglets to free {}",
            epoch, seglets_used, seglets_freed
        );
        assert!(
            seglets_used <= seglets_freed,
            "cleaning must not enlarge the log"
        );
    }

    /// Drain the segments that have become cleanable since the last
    /// call into `out`. The cleaner polls this periodically.
    pub fn cleanable_segments(&self, out: &mut Vec<Arc<Segment>>) {
        let mut inner = self.inner.lock();

        let newly = State::NewlyCleanable.list_index();
        while let Some(slot) = inner.by_state[newly].head {
            out.push(inner.slots[slot].as_ref().unwrap().segment.clone());
            self.change_state(&mut inner, slot, State::Cleanable);
        }
    }

    /// Called whenever a log iterator is created. While any iterator
    /// exists, the digest-visible membership of the log cannot shrink:
    /// cleaned segments stay advertised and pending survivors stay
    /// out. Iteration should therefore be bounded by the caller, since
    /// those segments cannot be reclaimed until the last iterator is
    /// destroyed.
    pub fn log_iterator_created(&self) {
        let mut inner = self.inner.lock();
        inner.log_iterator_count += 1;
        trace!("log iterators: {}", inner.log_iterator_count);
    }

    /// Called whenever a log iterator is destroyed.
    pub fn log_iterator_destroyed(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.log_iterator_count > 0);
        inner.log_iterator_count -= 1;
        trace!("log iterators: {}", inner.log_iterator_count);
    }

    /// Collect every segment currently part of the log with id at
    /// least `min_id`, in no particular order. Only valid while a log
    /// iterator exists, which is what pins the membership being
    /// walked; fails with [`Error::NotIterating`] otherwise.
    ///
    /// Callers walking incrementally should filter with `min_id` and
    /// tolerate seeing a segment twice across calls.
    pub fn active_segments(
        &self,
        min_id: SegmentId,
        out: &mut Vec<Arc<Segment>>,
    ) -> Result<()> {
        let inner = self.inner.lock();

        if inner.log_iterator_count == 0 {
            return Err(Error::NotIterating);
        }

        // The cleaner cannot insert survivors into the log nor free
        // cleaned segments while iterators exist, so what is presently
        // on these lists is exactly the log's membership.
        let active = [
            State::NewlyCleanable,
            State::Cleanable,
            State::FreeablePendingDigestAndReferences,
        ];

        for state in active {
            let mut cursor = inner.by_state[state.list_index()].head;
            while let Some(slot) = cursor {
                let entry = inner.slots[slot].as_ref().unwrap();
                if entry.segment.id() >= min_id {
                    out.push(entry.segment.clone());
                }
                cursor = entry.state_link.next;
            }
        }

        if let Some(head) = head_segment(&inner) {
            if head.id() >= min_id {
                out.push(head);
            }
        }

        Ok(())
    }

    /// Reserve `n` full segments for the cleaner's survivors. The
    /// reserve may only grow; requests below the current reserve or
    /// beyond what the pool can cover alongside the emergency heads
    /// return `false` and leave the reserve unchanged.
    pub fn increase_survivor_reserve(&self, n: usize) -> bool {
        let mut inner = self.inner.lock();

        // Shrinking could leave more allocated than reserved, which
        // would underflow the unallocated-reserve arithmetic.
        if n < inner.survivor_reserve {
            return false;
        }

        if n + EMERGENCY_HEAD_COUNT > self.allocator.free_segment_count() {
            return false;
        }

        inner.survivor_reserve = n;
        true
    }

    /// Look up the segment at `slot`.
    ///
    /// Callers receive slot numbers alongside entry handles from the
    /// log layer and must never use one after the segment it named was
    /// freed; nothing here can detect a recycled slot that has since
    /// been reoccupied.
    pub fn segment(&self, slot: Slot) -> Result<Arc<Segment>> {
        let inner = self.inner.lock();
        match inner.slots.get(slot) {
            Some(Some(entry)) => Ok(entry.segment.clone()),
            _ => Err(Error::InvalidSlot { slot }),
        }
    }

    /// The state of the segment at `slot`.
    pub fn segment_state(&self, slot: Slot) -> Result<State> {
        let inner = self.inner.lock();
        match inner.slots.get(slot) {
            Some(Some(entry)) => Ok(entry.state),
            _ => Err(Error::InvalidSlot { slot }),
        }
    }

    /// Whether a segment with the given id currently exists. Used with
    /// tombstones to decide when they may be garbage collected.
    pub fn does_id_exist(&self, id: SegmentId) -> bool {
        self.inner.lock().id_to_slot.contains_key(&id)
    }

    /// The number of live segments.
    pub fn allocated_segment_count(&self) -> usize {
        self.inner.lock().all.len
    }

    /// The number of full segments the pool can currently supply.
    pub fn free_segment_count(&self) -> usize {
        let _inner = self.inner.lock();
        self.allocator.free_segment_count()
    }

    /// How many survivor segments the cleaner may still allocate
    /// before backing off.
    pub fn free_survivor_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.survivor_reserve - inner.survivor_alloced
    }

    /// The most segments that may ever exist at once.
    pub fn maximum_segment_count(&self) -> usize {
        self.max_segments
    }

    /// Size in bytes of each seglet.
    pub fn seglet_size(&self) -> usize {
        self.allocator.seglet_size()
    }

    /// Size in bytes of each full segment.
    pub fn segment_size(&self) -> usize {
        self.allocator.segment_size()
    }

    fn write_header(
        &self,
        segment: &Segment,
        head_id_during_cleaning: SegmentId,
    ) -> Result<()> {
        let header = SegmentHeader {
            log_id: self.log_id,
            segment_id: segment.id(),
            capacity: segment.capacity(),
            head_id_during_cleaning,
        };

        if !segment.append(EntryType::SegHeader, &header.serialize()) {
            return Err(Error::HeaderAppendFailed);
        }

        Ok(())
    }

    /// Write the log digest into the new head. Must only be called
    /// from `alloc_head`: the transitions performed here are not
    /// idempotent.
    fn write_digest(
        &self,
        inner: &mut Inner,
        new_head: &Segment,
        prev_head: Option<&Segment>,
    ) -> Result<()> {
        let mut digest = LogDigest::default();

        // Survivors only join the log when no iteration is in
        // progress; iterators must see a stable membership.
        if inner.log_iterator_count == 0 {
            let pending = State::CleanablePendingDigest.list_index();
            while let Some(slot) = inner.by_state[pending].head {
                self.change_state(inner, slot, State::NewlyCleanable);
            }
        }

        for state in [State::Cleanable, State::NewlyCleanable] {
            let mut cursor = inner.by_state[state.list_index()].head;
            while let Some(slot) = cursor {
                let entry = inner.slots[slot].as_ref().unwrap();
                digest.add_segment_id(entry.segment.id());
                cursor = entry.state_link.next;
            }
        }

        if let Some(prev) = prev_head {
            digest.add_segment_id(prev.id());
        }

        digest.add_segment_id(new_head.id());

        // Likewise cleaned segments only leave the log when no
        // iteration is in progress; until then they remain advertised.
        let freeable = State::FreeablePendingDigestAndReferences.list_index();
        if inner.log_iterator_count == 0 {
            while let Some(slot) = inner.by_state[freeable].head {
                self.change_state(
                    inner,
                    slot,
                    State::FreeablePendingReferences,
                );
            }
        } else {
            let mut cursor = inner.by_state[freeable].head;
            while let Some(slot) = cursor {
                let entry = inner.slots[slot].as_ref().unwrap();
                digest.add_segment_id(entry.segment.id());
                cursor = entry.state_link.next;
            }
        }

        let bytes = digest.serialize();
        M.digest_bytes.measure(bytes.len() as f64);

        if !new_head.append(EntryType::LogDigest, &bytes) {
            return Err(Error::DigestAppendFailed);
        }

        trace!(
            "digest in segment {}: {:?}",
            new_head.id(),
            digest.segment_ids
        );

        Ok(())
    }

    fn change_state(&self, inner: &mut Inner, slot: Slot, new_state: State) {
        let (id, old_state) = {
            let entry = inner.slots[slot].as_ref().unwrap();
            (entry.segment.id(), entry.state)
        };

        list_remove(
            &mut inner.slots,
            &mut inner.by_state[old_state.list_index()],
            slot,
            LinkField::State,
        );
        inner.slots[slot].as_mut().unwrap().state = new_state;
        list_push_back(
            &mut inner.slots,
            &mut inner.by_state[new_state.list_index()],
            slot,
            LinkField::State,
        );

        trace!("segment {} slot {}: {:?} -> {:?}", id, slot, old_state, new_state);
    }

    fn may_alloc(&self, inner: &Inner, kind: AllocKind) -> bool {
        assert!(inner.emergency_heads_alloced <= EMERGENCY_HEAD_COUNT);
        assert!(inner.survivor_alloced <= inner.survivor_reserve);

        let emergency_reserved =
            EMERGENCY_HEAD_COUNT - inner.emergency_heads_alloced;
        let survivor_reserved =
            inner.survivor_reserve - inner.survivor_alloced;
        let total_reserved = emergency_reserved + survivor_reserved;

        let free = self.allocator.free_segment_count();
        assert!(free >= total_reserved);

        match kind {
            AllocKind::EmergencyHead => {
                // The rotation protocol frees one emergency head
                // before allocating a third, so the reserve can never
                // be empty here.
                assert!(emergency_reserved > 0);
                assert!(!inner.free_slots.is_empty());
                assert!(free > 0);
                true
            }
            AllocKind::Survivor => {
                if survivor_reserved == 0 {
                    return false;
                }
                assert!(!inner.free_slots.is_empty());
                assert!(free > 0);
                true
            }
            AllocKind::Head => {
                // Ordinary heads must not eat into the reserves.
                if free <= total_reserved {
                    return false;
                }
                assert!(!inner.free_slots.is_empty());
                true
            }
        }
    }

    fn alloc(
        &self,
        inner: &mut Inner,
        kind: AllocKind,
    ) -> Option<Arc<Segment>> {
        self.free_unreferenced_segments(inner);

        if !self.may_alloc(inner, kind) {
            return None;
        }

        let id = inner.next_segment_id;
        inner.next_segment_id += 1;

        let slot = inner.free_slots.pop().unwrap();
        assert!(inner.slots[slot].is_none());

        let (is_emergency_head, reserve, state) = match kind {
            AllocKind::Head => (false, ReserveKind::None, State::Head),
            AllocKind::EmergencyHead => {
                (true, ReserveKind::EmergencyHead, State::Head)
            }
            AllocKind::Survivor => {
                (false, ReserveKind::Survivor, State::CleaningInto)
            }
        };

        let segment = Arc::new(
            Segment::new(&self.allocator, id, slot, is_emergency_head, reserve)
                .expect("reserve accounting guarantees seglets"),
        );

        inner.id_to_slot.insert(id, slot);
        inner.slots[slot] = Some(SlotEntry {
            segment: Arc::clone(&segment),
            state,
            state_link: Links::default(),
            all_link: Links::default(),
        });
        list_push_back(
            &mut inner.slots,
            &mut inner.all,
            slot,
            LinkField::All,
        );
        list_push_back(
            &mut inner.slots,
            &mut inner.by_state[state.list_index()],
            slot,
            LinkField::State,
        );

        match kind {
            AllocKind::Head => Metrics::bump(&M.heads_allocated),
            AllocKind::EmergencyHead => {
                inner.emergency_heads_alloced += 1;
                Metrics::bump(&M.emergency_heads_allocated);
            }
            AllocKind::Survivor => {
                inner.survivor_alloced += 1;
                Metrics::bump(&M.survivors_allocated);
            }
        }

        trace!(
            "allocated segment {} at slot {} for {:?}",
            id,
            slot,
            kind
        );

        Some(segment)
    }

    /// Free the segment at `slot`, returning its slot to the free
    /// stack and its seglets to the pool. Only legal once the segment
    /// is out of the log and no references to it can remain: an
    /// emergency head being retired, or a segment whose cleaning epoch
    /// has drained.
    fn free(&self, inner: &mut Inner, slot: Slot) {
        let (id, state) = {
            let entry = inner.slots[slot].as_ref().unwrap();
            (entry.segment.id(), entry.state)
        };

        list_remove(
            &mut inner.slots,
            &mut inner.by_state[state.list_index()],
            slot,
            LinkField::State,
        );
        list_remove(&mut inner.slots, &mut inner.all, slot, LinkField::All);

        let entry = inner.slots[slot].take().unwrap();
        inner.free_slots.push(slot);
        inner.id_to_slot.remove(&id);

        // Hand the memory back now rather than when the last handle
        // drops: the reserve arithmetic in may_alloc reads the pool's
        // free count and a freed segment must already be part of it.
        entry.segment.release_seglets();

        match entry.segment.reserve() {
            ReserveKind::EmergencyHead => {
                assert!(inner.emergency_heads_alloced > 0);
                inner.emergency_heads_alloced -= 1;
            }
            ReserveKind::Survivor => {
                assert!(inner.survivor_alloced > 0);
                inner.survivor_alloced -= 1;
            }
            ReserveKind::None => {}
        }

        Metrics::bump(&M.segments_freed);
        trace!("segment {} slot {}: {:?} -> {:?}", id, slot, state, State::Freed);
    }

    /// Scan the freeable segments and reclaim those no in-flight
    /// request could still reference. Runs at the head of every
    /// allocation.
    fn free_unreferenced_segments(&self, inner: &mut Inner) {
        let freeable = State::FreeablePendingReferences.list_index();
        if inner.by_state[freeable].len == 0 {
            return;
        }

        let earliest = self.epochs.earliest_outstanding_epoch();

        let mut cursor = inner.by_state[freeable].head;
        while let Some(slot) = cursor {
            let (next, id, cleaned_epoch) = {
                let entry = inner.slots[slot].as_ref().unwrap();
                (
                    entry.state_link.next,
                    entry.segment.id(),
                    entry.segment.cleaned_epoch(),
                )
            };
            cursor = next;

            if cleaned_epoch < earliest {
                debug!(
                    "reclaiming segment {} (cleaned epoch {} < earliest outstanding {})",
                    id, cleaned_epoch, earliest
                );
                self.free(inner, slot);
            }
        }
    }

    /// Check every structural invariant of the bookkeeping. Intended
    /// for tests driving randomized histories.
    #[doc(hidden)]
    pub fn assert_invariants(&self) {
        let inner = self.inner.lock();

        assert!(
            inner.by_state[State::Head.list_index()].len <= 1,
            "more than one head segment"
        );

        let live: usize = inner.by_state.iter().map(|list| list.len).sum();
        assert_eq!(live, inner.all.len);
        assert_eq!(inner.free_slots.len() + inner.all.len, self.max_segments);
        assert_eq!(inner.id_to_slot.len(), inner.all.len);

        // Every occupied slot is on its state list exactly once, and
        // the recorded state matches the list it was found on.
        let mut seen = vec![false; self.max_segments];
        for (index, list) in inner.by_state.iter().enumerate() {
            let mut cursor = list.head;
            let mut walked = 0;
            while let Some(slot) = cursor {
                let entry = inner.slots[slot].as_ref().unwrap();
                assert_eq!(entry.state.list_index(), index);
                assert!(!seen[slot], "slot on two state lists");
                seen[slot] = true;
                walked += 1;
                cursor = entry.state_link.next;
            }
            assert_eq!(walked, list.len);
        }
        for (slot, entry) in inner.slots.iter().enumerate() {
            assert_eq!(entry.is_some(), seen[slot]);
            if let Some(entry) = entry {
                assert_eq!(inner.id_to_slot.get(&entry.segment.id()), Some(&slot));
                if entry.state == State::Head && entry.segment.appends_disabled() {
                    assert!(entry.segment.is_emergency_head());
                }
            }
        }

        assert!(inner.emergency_heads_alloced <= EMERGENCY_HEAD_COUNT);
        assert!(inner.survivor_alloced <= inner.survivor_reserve);
        let reserved = (EMERGENCY_HEAD_COUNT - inner.emergency_heads_alloced)
            + (inner.survivor_reserve - inner.survivor_alloced);
        assert!(self.allocator.free_segment_count() >= reserved);
    }
}
