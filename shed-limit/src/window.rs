//! Time-bucketed rolling statistics.
//!
//! A [`RollingWindow`] is a fixed ring of [`Bucket`]s, each covering `bucket_duration`.
//! The ring rotates lazily: a write that lands in a later time slot than the last one
//! clears every bucket it skips over before appending. Reads never mutate; they simply
//! ignore buckets whose slot has fallen out of the window.
//!
//! All access to a window is serialized by a single mutex. The critical sections are a
//! handful of vector operations, so contention stays short.

use std::num::NonZeroUsize;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

pub(crate) const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_BUCKET_COUNT: NonZeroUsize = NonZeroUsize::new(100).unwrap();

/// The observations that landed in one time slot.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Bucket {
    count: u64,
    points: Vec<f64>,
}

impl Bucket {
    /// Number of writes that landed in this bucket.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Recorded values, in write order. Accumulated writes share a single point.
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn sum(&self) -> f64 {
        self.points.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn append(&mut self, value: f64) {
        self.points.push(value);
        self.count += 1;
    }

    fn accumulate(&mut self, value: f64) {
        match self.points.first_mut() {
            Some(point) => *point += value,
            None => self.points.push(value),
        }
        self.count += 1;
    }

    fn reset(&mut self) {
        self.count = 0;
        self.points.clear();
    }
}

#[derive(Debug)]
struct Ring {
    buckets: Vec<Bucket>,
    /// Index of the bucket holding `slot`
    offset: usize,
    /// Absolute time slot (bucket_duration units since anchor) last written
    slot: u64,
}

/// A ring of time buckets approximating statistics over the last `size * bucket_duration`.
#[derive(Debug)]
pub struct RollingWindow {
    ring: Mutex<Ring>,
    size: usize,
    bucket_ns: u64,
    clock: Clock,
    anchor: Instant,
}

impl RollingWindow {
    /// Creates a new `RollingWindow`.
    ///
    /// # Arguments
    ///
    /// * `size` - The number of buckets in the ring.
    /// * `bucket_duration` - The span of time covered by each bucket. Clamped to at
    ///   least one nanosecond.
    pub fn new(size: NonZeroUsize, bucket_duration: Duration) -> Self {
        Self::with_clock(size, bucket_duration, Clock::new())
    }

    pub fn with_clock(size: NonZeroUsize, bucket_duration: Duration, clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            ring: Mutex::new(Ring {
                buckets: vec![Bucket::default(); size.get()],
                offset: 0,
                slot: 0,
            }),
            size: size.get(),
            bucket_ns: (bucket_duration.as_nanos() as u64).max(1),
            clock,
            anchor,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::from_nanos(self.bucket_ns)
    }

    /// Total span covered by the ring.
    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.bucket_ns * self.size as u64)
    }

    /// Append `value` as a new point in the current bucket.
    pub fn add(&self, value: f64) {
        let slot = self.current_slot();
        let mut ring = self.ring.lock();
        self.rotate(&mut ring, slot);
        let offset = ring.offset;
        ring.buckets[offset].append(value);
    }

    /// Fold `value` into the current bucket's running point.
    ///
    /// Counts the same as [`add`](Self::add) but keeps one point per bucket, so memory
    /// stays bounded for counters written on every request.
    pub fn accumulate(&self, value: f64) {
        let slot = self.current_slot();
        let mut ring = self.ring.lock();
        self.rotate(&mut ring, slot);
        let offset = ring.offset;
        ring.buckets[offset].accumulate(value);
    }

    /// Fold over the completed buckets in the window, oldest first.
    ///
    /// The bucket for the current time slot is excluded, so at most `size - 1`
    /// buckets are visited.
    pub fn reduce<T, F>(&self, f: F) -> T
    where
        F: FnOnce(Buckets<'_>) -> T,
    {
        self.visit(false, f)
    }

    /// Like [`reduce`](Self::reduce), but also visits the bucket being written in the
    /// current time slot.
    pub fn reduce_with_current<T, F>(&self, f: F) -> T
    where
        F: FnOnce(Buckets<'_>) -> T,
    {
        self.visit(true, f)
    }

    fn visit<T, F>(&self, with_current: bool, f: F) -> T
    where
        F: FnOnce(Buckets<'_>) -> T,
    {
        let slot = self.current_slot();
        let ring = self.ring.lock();
        let span = slot.saturating_sub(ring.slot);
        let size = self.size as u64;

        // Bucket j steps back from `offset` holds slot `ring.slot - j`. It is live while
        // that slot is still inside the window ending at `slot`.
        let (start, remaining) = if span >= size {
            (0, 0)
        } else {
            let oldest = size - span - 1;
            let newest = if span == 0 && !with_current { 1 } else { 0 };
            if oldest < newest {
                (0, 0)
            } else {
                let start = (ring.offset + self.size - oldest as usize) % self.size;
                (start, (oldest - newest + 1) as usize)
            }
        };

        f(Buckets {
            buckets: &ring.buckets,
            next: start,
            remaining,
        })
    }

    fn rotate(&self, ring: &mut Ring, slot: u64) {
        let span = slot.saturating_sub(ring.slot);
        if span == 0 {
            return;
        }
        let stale = span.min(self.size as u64) as usize;
        for step in 1..=stale {
            let idx = (ring.offset + step) % self.size;
            ring.buckets[idx].reset();
        }
        ring.offset = ((ring.offset as u64 + span) % self.size as u64) as usize;
        ring.slot = slot;
    }

    fn current_slot(&self) -> u64 {
        let now = self.clock.now().duration_since(self.anchor).as_nanos() as u64;
        now / self.bucket_ns
    }
}

/// Iterator over the live buckets of a [`RollingWindow`], oldest first.
#[derive(Debug, Clone)]
pub struct Buckets<'a> {
    buckets: &'a [Bucket],
    next: usize,
    remaining: usize,
}

impl<'a> Iterator for Buckets<'a> {
    type Item = &'a Bucket;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let bucket = &self.buckets[self.next];
        self.next = (self.next + 1) % self.buckets.len();
        self.remaining -= 1;
        Some(bucket)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Buckets<'_> {}

/// Stock folds for [`RollingWindow::reduce`].
pub mod fold {
    use super::Bucket;
    use super::Buckets;

    /// Sum of every point.
    pub fn sum(buckets: Buckets<'_>) -> f64 {
        buckets.map(Bucket::sum).sum()
    }

    /// Number of writes.
    pub fn count(buckets: Buckets<'_>) -> u64 {
        buckets.map(Bucket::count).sum()
    }

    /// Sum of every point divided by the number of writes, or 0 if there were none.
    pub fn avg(buckets: Buckets<'_>) -> f64 {
        let (total, count) = buckets
            .fold((0.0, 0), |(total, count), b| (total + b.sum(), count + b.count()));
        if count == 0 { 0.0 } else { total / count as f64 }
    }

    /// Largest single point, or 0 if there were none.
    pub fn max(buckets: Buckets<'_>) -> f64 {
        buckets
            .flat_map(|b| b.points().iter().copied())
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    /// Smallest single point, or 0 if there were none.
    pub fn min(buckets: Buckets<'_>) -> f64 {
        buckets
            .flat_map(|b| b.points().iter().copied())
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Largest per-bucket sum, or 0 if there were no buckets.
    pub fn max_bucket_sum(buckets: Buckets<'_>) -> f64 {
        buckets
            .map(Bucket::sum)
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    /// Smallest per-bucket average over the buckets that saw any writes.
    pub fn min_bucket_avg(buckets: Buckets<'_>) -> Option<f64> {
        buckets
            .filter(|b| !b.is_empty())
            .map(|b| b.sum() / b.count() as f64)
            .reduce(f64::min)
    }
}
