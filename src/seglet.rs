use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

use log::trace;
use parking_lot::Mutex;

use crate::Config;

/// A fixed pool of equal-sized seglets carved out of one contiguous,
/// zeroed heap region. Segments occupy one or more seglets; the pool
/// hands memory out at full-segment granularity and takes it back one
/// seglet set at a time.
///
/// The region is allocated once and never moves, so its base address
/// can be registered with a transport layer for memory pinning.
pub struct SegletAllocator {
    base: NonNull<u8>,
    layout: Layout,
    seglet_size: usize,
    seglets_per_segment: usize,
    total_seglets: usize,
    free: Mutex<Vec<u32>>,
}

// Seglet ranges never overlap and the free stack never hands the same
// index out twice, so distinct owners write through disjoint memory.
unsafe impl Send for SegletAllocator {}
unsafe impl Sync for SegletAllocator {}

/// One seglet: an exclusively owned, fixed-size range of the pool.
#[derive(Debug)]
pub struct Seglet {
    ptr: NonNull<u8>,
    index: u32,
    len: usize,
}

unsafe impl Send for Seglet {}
unsafe impl Sync for Seglet {}

impl Seglet {
    /// Copy `buf` into this seglet starting at `offset`.
    pub(crate) fn write_at(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= self.len);
        unsafe {
            ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.ptr.as_ptr().add(offset),
                buf.len(),
            );
        }
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub(crate) fn read_at(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len);
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl SegletAllocator {
    /// Build the pool described by `config`.
    pub fn new(config: &Config) -> SegletAllocator {
        let seglet_size = config.seglet_size;
        let seglets_per_segment = config.seglets_per_segment;
        let total_seglets = config.pool_segments * seglets_per_segment;
        let total_bytes = total_seglets * seglet_size;

        let (base, layout) = if total_bytes == 0 {
            (NonNull::dangling(), Layout::new::<u8>())
        } else {
            let layout = Layout::from_size_align(total_bytes, 4096)
                .expect("pool geometry fits a layout");
            let raw = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(raw).expect("pool allocation failed");
            (base, layout)
        };

        trace!(
            "seglet pool of {} seglets x {} bytes at {:?}",
            total_seglets,
            seglet_size,
            base
        );

        // Popping from the stack tail yields low indices first, which
        // keeps early allocations at the front of the region.
        let free = (0..total_seglets as u32).rev().collect();

        SegletAllocator {
            base,
            layout,
            seglet_size,
            seglets_per_segment,
            total_seglets,
            free: Mutex::new(free),
        }
    }

    /// Reserve enough seglets for one full segment. `None` if the pool
    /// cannot supply a full segment's worth.
    pub(crate) fn alloc_segment(&self) -> Option<Vec<Seglet>> {
        let mut free = self.free.lock();
        if free.len() < self.seglets_per_segment {
            return None;
        }

        let seglets = (0..self.seglets_per_segment)
            .map(|_| {
                let index = free.pop().unwrap();
                self.seglet(index)
            })
            .collect();

        Some(seglets)
    }

    /// Return a segment's seglets to the pool.
    pub(crate) fn release(&self, seglets: Vec<Seglet>) {
        let mut free = self.free.lock();
        for seglet in seglets {
            debug_assert!(!free.contains(&seglet.index), "double-free of a seglet");
            free.push(seglet.index);
        }
    }

    fn seglet(&self, index: u32) -> Seglet {
        assert!((index as usize) < self.total_seglets);
        let offset = index as usize * self.seglet_size;
        let ptr = unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(offset))
        };
        Seglet { ptr, index, len: self.seglet_size }
    }

    /// The number of full segments the pool can currently supply.
    pub fn free_segment_count(&self) -> usize {
        self.free.lock().len() / self.seglets_per_segment
    }

    /// Size in bytes of each seglet.
    pub fn seglet_size(&self) -> usize {
        self.seglet_size
    }

    /// Size in bytes of each full segment.
    pub fn segment_size(&self) -> usize {
        self.seglet_size * self.seglets_per_segment
    }

    /// Total size of the backing region in bytes.
    pub fn total_bytes(&self) -> u64 {
        (self.total_seglets * self.seglet_size) as u64
    }

    /// Base address of the backing region, for transport registration.
    pub fn base_address(&self) -> *const u8 {
        self.base.as_ptr()
    }
}

impl Drop for SegletAllocator {
    fn drop(&mut self) {
        if self.total_seglets * self.seglet_size > 0 {
            unsafe {
                dealloc(self.base.as_ptr(), self.layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigBuilder;

    fn pool(segments: usize) -> SegletAllocator {
        let config = ConfigBuilder::new()
            .seglet_size(64)
            .seglets_per_segment(4)
            .pool_segments(segments)
            .build();
        SegletAllocator::new(&config)
    }

    #[test]
    fn exhausts_and_refills() {
        let allocator = pool(2);
        assert_eq!(allocator.free_segment_count(), 2);

        let a = allocator.alloc_segment().unwrap();
        let b = allocator.alloc_segment().unwrap();
        assert_eq!(allocator.free_segment_count(), 0);
        assert!(allocator.alloc_segment().is_none());

        allocator.release(a);
        assert_eq!(allocator.free_segment_count(), 1);
        allocator.release(b);
        assert_eq!(allocator.free_segment_count(), 2);
    }

    #[test]
    fn seglets_round_trip_bytes() {
        let allocator = pool(1);
        let seglets = allocator.alloc_segment().unwrap();

        seglets[0].write_at(3, b"hello");
        let mut out = [0; 5];
        seglets[0].read_at(3, &mut out);
        assert_eq!(&out, b"hello");

        allocator.release(seglets);
    }
}
