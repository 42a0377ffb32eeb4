//! Rolling Average Window
//!
//! Fixed-capacity ring of the most recent samples with a running total, used
//! by every stage and device to smooth timing and throughput observations.
//!
//! # Design
//!
//! - Capacity is a const generic; a zero capacity fails to compile
//! - `add_sample` is amortized O(1): the evicted sample is subtracted from
//!   the total, and the total is re-summed from the ring each time it wraps
//!   so floating point error cannot build up
//! - The accumulator type can be wider than the sample type (e.g. `u32`
//!   samples summed in a `u64`) to avoid overflow

use std::ops::{Add, Sub};

/// Numeric type a window can sum samples into and divide by a count.
pub trait Accumulator: Copy + Default + Add<Output = Self> + Sub<Output = Self> {
    /// Divide the running total by the number of samples held.
    fn divide(self, count: usize) -> Self;
}

impl Accumulator for u64 {
    fn divide(self, count: usize) -> Self {
        self / count as u64
    }
}

impl Accumulator for u128 {
    fn divide(self, count: usize) -> Self {
        self / count as u128
    }
}

impl Accumulator for i64 {
    fn divide(self, count: usize) -> Self {
        self / count as i64
    }
}

impl Accumulator for f64 {
    fn divide(self, count: usize) -> Self {
        self / count as f64
    }
}

/// Rolling average over the last `N` samples.
#[derive(Debug, Clone)]
pub struct AverageWindow<T, A = T, const N: usize = 64> {
    samples: [T; N],
    next: usize,
    filled: usize,
    total: A,
}

impl<T, A, const N: usize> AverageWindow<T, A, N>
where
    T: Copy + Default + Into<A>,
    A: Accumulator,
{
    const NON_ZERO_CAPACITY: () = assert!(N > 0, "AverageWindow capacity must be non-zero");

    /// Create an empty window.
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_ZERO_CAPACITY;
        Self {
            samples: [T::default(); N],
            next: 0,
            filled: 0,
            total: A::default(),
        }
    }

    /// Record one observation, evicting the oldest once full.
    pub fn add_sample(&mut self, value: T) {
        if self.filled == N {
            self.total = self.total - self.samples[self.next].into();
        } else {
            self.filled += 1;
        }
        self.samples[self.next] = value;
        self.total = self.total + value.into();
        self.next = (self.next + 1) % N;

        if self.next == 0 {
            self.total = self
                .samples
                .iter()
                .fold(A::default(), |sum, &sample| sum + sample.into());
        }
    }

    /// Arithmetic mean of the stored samples, zero when empty.
    pub fn average(&self) -> A {
        if self.filled == 0 {
            return A::default();
        }
        self.total.divide(self.filled)
    }

    /// Mean of the stored samples, or `default` if nothing was recorded yet.
    pub fn average_or(&self, default: A) -> A {
        if self.filled == 0 {
            default
        } else {
            self.average()
        }
    }

    /// Number of samples currently held (at most `N`).
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Forget every sample.
    pub fn clear(&mut self) {
        self.samples = [T::default(); N];
        self.next = 0;
        self.filled = 0;
        self.total = A::default();
    }
}

impl<T, A, const N: usize> Default for AverageWindow<T, A, N>
where
    T: Copy + Default + Into<A>,
    A: Accumulator,
{
    fn default() -> Self {
        Self::new()
    }
}
