use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use historian::Histo;
use lazy_static::lazy_static;

lazy_static! {
    /// A metric collector for all segment managers running in this
    /// process.
    pub static ref M: Metrics = Metrics::default();
}

/// Measure the duration of an event, and call `Histo::measure()` on drop.
pub struct Measure<'h> {
    start: Instant,
    histo: &'h Histo,
}

impl<'h> Measure<'h> {
    #[inline(always)]
    pub fn new(histo: &'h Histo) -> Measure<'h> {
        Measure { histo, start: Instant::now() }
    }
}

impl<'h> Drop for Measure<'h> {
    #[inline(always)]
    fn drop(&mut self) {
        let nanos = (self.start.elapsed().as_secs() * 1_000_000_000)
            + u64::from(self.start.elapsed().subsec_nanos());
        self.histo.measure(nanos as f64);
    }
}

#[derive(Default, Debug)]
pub struct Metrics {
    pub head_rotation: Histo,
    pub digest_bytes: Histo,
    pub heads_allocated: CachePadded<AtomicUsize>,
    pub emergency_heads_allocated: CachePadded<AtomicUsize>,
    pub survivors_allocated: CachePadded<AtomicUsize>,
    pub segments_freed: CachePadded<AtomicUsize>,
    pub cleanings_completed: CachePadded<AtomicUsize>,
}

impl Metrics {
    #[inline]
    pub fn bump(counter: &CachePadded<AtomicUsize>) {
        counter.fetch_add(1, Relaxed);
    }
}
