use std::ops::Deref;
use std::sync::Arc;

use crate::constants::{
    DEFAULT_POOL_SEGMENTS, DEFAULT_SEGLETS_PER_SEGMENT, DEFAULT_SEGLET_SIZE,
};

/// Top-level configuration for the log's memory pool and identity.
///
/// # Examples
///
/// ```
/// let _config = ramlog::ConfigBuilder::new()
///     .log_id(7)
///     .seglet_size(64 * 1024)
///     .seglets_per_segment(128)
///     .pool_segments(32)
///     .disk_expansion_factor(2.0)
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigBuilder {
    #[doc(hidden)]
    pub log_id: u64,
    #[doc(hidden)]
    pub seglet_size: usize,
    #[doc(hidden)]
    pub seglets_per_segment: usize,
    #[doc(hidden)]
    pub pool_segments: usize,
    #[doc(hidden)]
    pub disk_expansion_factor: f64,
}

impl Default for ConfigBuilder {
    fn default() -> ConfigBuilder {
        ConfigBuilder {
            log_id: 0,
            seglet_size: DEFAULT_SEGLET_SIZE,
            seglets_per_segment: DEFAULT_SEGLETS_PER_SEGMENT,
            pool_segments: DEFAULT_POOL_SEGMENTS,
            disk_expansion_factor: 1.0,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $set:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> ConfigBuilder {
                self.$name = to;
                self
            }
        )*
    }
}

impl ConfigBuilder {
    /// Returns a default `ConfigBuilder`.
    pub fn new() -> ConfigBuilder {
        Self::default()
    }

    /// Finalize the configuration.
    pub fn build(self) -> Config {
        assert!(self.seglet_size > 0, "seglets must not be empty");
        assert!(
            self.seglets_per_segment > 0,
            "segments must hold at least one seglet"
        );

        Config { inner: Arc::new(self) }
    }

    builder!(
        (log_id, set_log_id, u64, "identifier stamped into every segment header so replicas can be attributed to this log"),
        (seglet_size, set_seglet_size, usize, "size in bytes of the allocator's unit of memory"),
        (seglets_per_segment, set_seglets_per_segment, usize, "number of seglets composing one full segment"),
        (pool_segments, set_pool_segments, usize, "number of full segments the memory pool holds"),
        (disk_expansion_factor, set_disk_expansion_factor, f64, "multiple of the pool's segment count that may exist on backup disks; must be >= 1.0")
    );
}

/// A finalized `ConfigBuilder` that can be shared between the allocator
/// and the segment manager.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigBuilder>,
}

impl Deref for Config {
    type Target = ConfigBuilder;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Config {
    /// Size in bytes of one full segment.
    pub fn segment_size(&self) -> usize {
        self.seglet_size * self.seglets_per_segment
    }
}
