use std::{error::Error as StdError, fmt};

use crate::Slot;

/// The top-level result type for fallible segment manager operations.
/// The errors tend to be fail-stop: an exhausted pool is *not* an error
/// (allocation returns `None` and the caller retries or backs off), but
/// a violated invariant or a failed replication is, because the log
/// cannot advance past either.
pub type Result<T> = std::result::Result<T, Error>;

/// An `Error` type encapsulating the ways the segment manager can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The disk expansion factor handed to the constructor was below 1.0.
    BadFactor,
    /// The seglet allocator offers fewer segments than the emergency
    /// head reserve requires.
    TooFewSegments,
    /// A slot handed to the segment table was out of range or vacant.
    /// Slot references must never be recycled by callers.
    InvalidSlot {
        /// The offending table index.
        slot: Slot,
    },
    /// `active_segments` was called while no log iterator existed.
    NotIterating,
    /// A fresh segment refused its own header. This cannot happen on a
    /// correctly sized segment and indicates a corrupted geometry.
    HeaderAppendFailed,
    /// The new head refused the log digest.
    DigestAppendFailed,
    /// The replica manager could not allocate or synchronize a
    /// replicated segment. The log cannot advance without durability.
    ReplicaFailure(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;

        match *self {
            BadFactor => write!(f, "disk expansion factor must be >= 1.0"),
            TooFewSegments => {
                write!(f, "allocator must offer at least the emergency head reserve")
            }
            InvalidSlot { slot } => write!(f, "invalid segment slot {}", slot),
            NotIterating => {
                write!(f, "active segment walk is only valid while a log iterator exists")
            }
            HeaderAppendFailed => write!(f, "could not append segment header"),
            DigestAppendFailed => write!(f, "could not append log digest"),
            ReplicaFailure(why) => write!(f, "replica manager failure: {}", why),
        }
    }
}

impl StdError for Error {}
