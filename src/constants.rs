use super::SegmentId;

/// Identifier stamped into a segment header's
/// `head_id_during_cleaning` field when the segment is a head rather
/// than a cleaner survivor.
pub const INVALID_SEGMENT_ID: SegmentId = u64::MAX;

/// Number of full segments permanently reserved for emergency heads.
///
/// Two are required: one may be in use as the current (immutable)
/// emergency head while a second rotation is already in progress.
pub const EMERGENCY_HEAD_COUNT: usize = 2;

// kind: u8 1
// len: u32 4
/// Appended entries are framed with a header of this length.
pub const ENTRY_HEADER_LEN: usize = 5;

/// Default seglet size: 64kb.
pub const DEFAULT_SEGLET_SIZE: usize = 64 * 1024;

/// Default number of seglets composing one full segment (8mb segments).
pub const DEFAULT_SEGLETS_PER_SEGMENT: usize = 128;

/// Default number of full segments in the pool.
pub const DEFAULT_POOL_SEGMENTS: usize = 16;
