use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::constants::ENTRY_HEADER_LEN;
use crate::seglet::{Seglet, SegletAllocator};
use crate::{Epoch, EntryType, LogDigest, ReplicatedSegment, SegmentId, Slot};

/// Which reserve, if any, a segment's allocation consumed. Recorded at
/// allocation so that `free` decrements only the matching reserve; a
/// head allocated from the general pool was never counted against a
/// reserve and must not release one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveKind {
    /// Allocated from the general pool.
    None,
    /// Allocated from the emergency head reserve.
    EmergencyHead,
    /// Allocated from the cleaner's survivor reserve.
    Survivor,
}

struct AppendBuf {
    seglets: Vec<Seglet>,
    len: u32,
    disabled: bool,
}

/// An in-memory log segment: a fixed-size append buffer composed of
/// seglets, identified by a globally monotonic id, resident at a fixed
/// slot in the segment manager's table.
///
/// The manager owns every live segment. Handles returned to callers
/// stay valid only as long as the segment's state permits: a head
/// until the next rotation retires it, a cleanable segment until the
/// digest retires it and its epoch drains.
pub struct Segment {
    id: SegmentId,
    slot: Slot,
    is_emergency_head: bool,
    reserve: ReserveKind,
    capacity: u32,
    allocator: Arc<SegletAllocator>,
    buf: Mutex<AppendBuf>,
    replica: Mutex<Option<Box<dyn ReplicatedSegment>>>,
    cleaned_epoch: AtomicU64,
}

impl Segment {
    /// Reserve one full segment's worth of seglets and wrap them.
    /// `None` if the allocator cannot supply a full segment.
    pub(crate) fn new(
        allocator: &Arc<SegletAllocator>,
        id: SegmentId,
        slot: Slot,
        is_emergency_head: bool,
        reserve: ReserveKind,
    ) -> Option<Segment> {
        let seglets = allocator.alloc_segment()?;
        let capacity = allocator.segment_size() as u32;

        Some(Segment {
            id,
            slot,
            is_emergency_head,
            reserve,
            capacity,
            allocator: Arc::clone(allocator),
            buf: Mutex::new(AppendBuf { seglets, len: 0, disabled: false }),
            replica: Mutex::new(None),
            cleaned_epoch: AtomicU64::new(0),
        })
    }

    /// The segment's globally monotonic identifier.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// The segment's fixed index in the segment table.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Whether this segment was allocated from the emergency head
    /// reserve. Emergency heads never carry user data.
    pub fn is_emergency_head(&self) -> bool {
        self.is_emergency_head
    }

    /// Which reserve this segment's allocation consumed. `free`
    /// releases only the matching reserve.
    pub fn reserve(&self) -> ReserveKind {
        self.reserve
    }

    /// Full capacity of the append buffer in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of seglets backing this segment.
    pub fn seglets_allocated(&self) -> usize {
        self.buf.lock().seglets.len()
    }

    /// Append one framed entry. Returns `false` if appends have been
    /// disabled or the entry does not fit.
    pub fn append(&self, entry_type: EntryType, bytes: &[u8]) -> bool {
        let mut buf = self.buf.lock();
        if buf.disabled {
            return false;
        }

        let needed = ENTRY_HEADER_LEN + bytes.len();
        if buf.len as usize + needed > self.capacity as usize {
            return false;
        }

        let mut framing = [0; ENTRY_HEADER_LEN];
        framing[0] = entry_type.into();
        framing[1..].copy_from_slice(&(bytes.len() as u32).to_le_bytes());

        let at = buf.len as usize;
        write_bytes(&buf.seglets, at, &framing);
        write_bytes(&buf.seglets, at + ENTRY_HEADER_LEN, bytes);
        buf.len += needed as u32;

        trace!(
            "segment {} appended {:?} of {} bytes at offset {}",
            self.id,
            entry_type,
            bytes.len(),
            at
        );

        true
    }

    /// Number of bytes appended so far.
    pub fn appended_len(&self) -> u32 {
        self.buf.lock().len
    }

    /// Permanently refuse further appends. Called on emergency heads,
    /// which exist only to keep one replicated segment open.
    pub fn disable_appends(&self) {
        self.buf.lock().disabled = true;
    }

    /// Whether appends have been disabled.
    pub fn appends_disabled(&self) -> bool {
        self.buf.lock().disabled
    }

    /// Walk the framed entries appended so far, copying payloads out.
    pub fn entries(&self) -> Vec<(EntryType, Vec<u8>)> {
        let buf = self.buf.lock();
        let mut out = vec![];
        let mut at = 0;

        while at + ENTRY_HEADER_LEN <= buf.len as usize {
            let mut framing = [0; ENTRY_HEADER_LEN];
            read_bytes(&buf.seglets, at, &mut framing);

            let entry_type = match EntryType::from_u8(framing[0]) {
                Some(t) => t,
                None => break,
            };
            let len =
                u32::from_le_bytes(framing[1..].try_into().unwrap()) as usize;

            let mut payload = vec![0; len];
            read_bytes(&buf.seglets, at + ENTRY_HEADER_LEN, &mut payload);
            out.push((entry_type, payload));
            at += ENTRY_HEADER_LEN + len;
        }

        out
    }

    /// The most recent log digest appended to this segment, if any.
    pub fn last_digest(&self) -> Option<LogDigest> {
        self.entries()
            .into_iter()
            .rev()
            .find(|(t, _)| *t == EntryType::LogDigest)
            .and_then(|(_, payload)| LogDigest::deserialize(&payload))
    }

    /// The epoch this segment was cleaned in. Only meaningful once the
    /// manager has stamped it during `cleaning_complete`.
    pub fn cleaned_epoch(&self) -> Epoch {
        self.cleaned_epoch.load(SeqCst)
    }

    pub(crate) fn set_cleaned_epoch(&self, epoch: Epoch) {
        self.cleaned_epoch.store(epoch, SeqCst);
    }

    /// Hand every seglet back to the allocator immediately, leaving
    /// the buffer empty and append-disabled. Called by the manager at
    /// free time, when the epoch protocol guarantees no caller still
    /// reads through a handle.
    pub(crate) fn release_seglets(&self) {
        let mut buf = self.buf.lock();
        let seglets = std::mem::take(&mut buf.seglets);
        buf.len = 0;
        buf.disabled = true;
        self.allocator.release(seglets);
    }

    pub(crate) fn install_replica(&self, replica: Box<dyn ReplicatedSegment>) {
        let mut cell = self.replica.lock();
        debug_assert!(cell.is_none(), "replica installed twice");
        *cell = Some(replica);
    }

    /// Run `f` with this segment's replicated handle, if one has been
    /// installed.
    pub(crate) fn with_replica<R>(
        &self,
        f: impl FnOnce(Option<&dyn ReplicatedSegment>) -> R,
    ) -> R {
        let cell = self.replica.lock();
        f(cell.as_deref())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let seglets = std::mem::take(&mut self.buf.get_mut().seglets);
        self.allocator.release(seglets);
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("is_emergency_head", &self.is_emergency_head)
            .finish()
    }
}

fn write_bytes(seglets: &[Seglet], mut at: usize, mut data: &[u8]) {
    while !data.is_empty() {
        let seglet = &seglets[at / seglets[0].len()];
        let offset = at % seglets[0].len();
        let n = (seglet.len() - offset).min(data.len());
        seglet.write_at(offset, &data[..n]);
        at += n;
        data = &data[n..];
    }
}

fn read_bytes(seglets: &[Seglet], mut at: usize, mut out: &mut [u8]) {
    while !out.is_empty() {
        let seglet = &seglets[at / seglets[0].len()];
        let offset = at % seglets[0].len();
        let n = (seglet.len() - offset).min(out.len());
        seglet.read_at(offset, &mut out[..n]);
        at += n;
        out = &mut out[n..];
    }
}
