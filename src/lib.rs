//! `ramlog` is the segment bookkeeping core of a log-structured,
//! in-memory storage engine. A master node keeps all of its data in DRAM
//! as an append-only log of fixed-size segments, and the same log is
//! replicated to durable backups as it is written.
//!
//! The [`SegmentManager`] owns every segment in the log and must keep
//! these critical safety properties:
//!
//! A. There is always exactly one open segment replicated on backups,
//!    so that a coordinated failure of the master is unambiguously
//!    detectable. A new head is made durable *before* the previous head
//!    is closed.
//! B. A segment's memory is never handed back to the allocator while
//!    any in-flight request may still hold a reference into it. Cleaned
//!    segments are stamped with the cleaning epoch at retirement and are
//!    reclaimed only once every request from that epoch or earlier has
//!    drained.
//! C. Reserved memory for emergency heads and cleaner survivors is never
//!    consumed by ordinary head allocation, so the log can always roll
//!    its head and the cleaner can always make progress, even when the
//!    pool is otherwise exhausted.
//!
//! Writers drive [`SegmentManager::alloc_head`], the cleaner drives
//! [`SegmentManager::alloc_survivor`] and
//! [`SegmentManager::cleaning_complete`], and log iterators pin the
//! digest-visible membership of the log through
//! [`SegmentManager::log_iterator_created`]. All bookkeeping lives under
//! one mutex; the hot path is dominated by replica synchronization, not
//! by the lock.

#![cfg_attr(test, deny(warnings))]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod constants;
mod epoch;
mod header;
mod metrics;
mod replica;
mod result;
mod seglet;
mod segment;
mod segment_manager;

pub use self::{
    config::{Config, ConfigBuilder},
    constants::{EMERGENCY_HEAD_COUNT, ENTRY_HEADER_LEN, INVALID_SEGMENT_ID},
    epoch::{RpcEpochs, RpcGuard},
    header::{EntryType, LogDigest, SegmentHeader},
    replica::{MemReplica, MemReplicaManager, ReplicaEvent, ReplicaManager, ReplicatedSegment},
    result::{Error, Result},
    seglet::SegletAllocator,
    segment::{ReserveKind, Segment},
    segment_manager::{SegmentManager, State},
};

pub(crate) use self::metrics::{Measure, M};

/// The globally monotonic identifier of a segment. Identifiers are
/// assigned in allocation order and are never reused.
pub type SegmentId = u64;

/// An index into the segment manager's table of segments. Slots are
/// recycled; identifiers are not.
pub type Slot = usize;

/// A cleaning epoch. Compared against the earliest epoch of any
/// in-flight request to bound safe reclamation.
pub type Epoch = u64;
