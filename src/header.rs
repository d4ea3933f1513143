use serde::{Deserialize, Serialize};

use crate::SegmentId;

/// A byte used to disambiguate appended entry types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EntryType {
    /// The fixed header written first into every segment.
    SegHeader = 1,
    /// The log digest written into every head segment.
    LogDigest = 2,
}

impl EntryType {
    pub(crate) const fn into(self) -> u8 {
        self as u8
    }

    /// Decode a framing byte. `None` for unknown tags, which callers
    /// treat as corruption.
    pub fn from_u8(byte: u8) -> Option<EntryType> {
        match byte {
            1 => Some(EntryType::SegHeader),
            2 => Some(EntryType::LogDigest),
            _ => None,
        }
    }
}

/// The first entry in every segment. Identifies the owning log and the
/// segment itself, so replicas found on backups can be attributed after
/// a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Identifier of the log this segment belongs to.
    pub log_id: u64,
    /// The segment's own identifier.
    pub segment_id: SegmentId,
    /// Full capacity of the segment in bytes.
    pub capacity: u32,
    /// For cleaner survivors, the id of the head segment when the
    /// cleaning pass began, so survivor contents order before that
    /// head. `INVALID_SEGMENT_ID` for heads.
    pub head_id_during_cleaning: SegmentId,
}

impl SegmentHeader {
    pub(crate) fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("segment header is always serializable")
    }

    /// Decode a header from the payload of a `SegHeader` entry.
    pub fn deserialize(buf: &[u8]) -> Option<SegmentHeader> {
        bincode::deserialize(buf).ok()
    }
}

/// The list of segment identifiers that constitute the durable log as
/// of the head segment the digest is written into. Replayed during
/// recovery to decide which replicas on backups are live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogDigest {
    /// Identifiers of every segment in the log, in no particular order.
    pub segment_ids: Vec<SegmentId>,
}

impl LogDigest {
    pub(crate) fn add_segment_id(&mut self, id: SegmentId) {
        self.segment_ids.push(id);
    }

    /// Whether the digest advertises the given segment.
    pub fn contains(&self, id: SegmentId) -> bool {
        self.segment_ids.contains(&id)
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("log digest is always serializable")
    }

    /// Decode a digest from the payload of a `LogDigest` entry.
    pub fn deserialize(buf: &[u8]) -> Option<LogDigest> {
        bincode::deserialize(buf).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_SEGMENT_ID;

    #[test]
    fn header_survives_the_wire() {
        let header = SegmentHeader {
            log_id: 9,
            segment_id: 4,
            capacity: 1 << 20,
            head_id_during_cleaning: INVALID_SEGMENT_ID,
        };
        let bytes = header.serialize();
        assert_eq!(SegmentHeader::deserialize(&bytes), Some(header));
    }

    #[test]
    fn digest_membership() {
        let mut digest = LogDigest::default();
        digest.add_segment_id(0);
        digest.add_segment_id(2);
        assert!(digest.contains(0));
        assert!(!digest.contains(1));
    }
}
