//! Bounded worker pool for feature extraction.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::warn;

use crate::error::{Error, Result};

/// Runs CPU-heavy extraction jobs on a dedicated rayon pool and caps how
/// many requests may be in flight at once.
pub struct ExtractionPool {
    pool: ThreadPool,
    in_flight: AtomicUsize,
    capacity: usize,
}

/// Admission slot held for the lifetime of one request.
#[derive(Debug)]
pub struct Permit<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ExtractionPool {
    /// `workers == 0` lets rayon pick one thread per core.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `capacity` is zero or the pool cannot be built.
    pub fn new(workers: usize, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("pool capacity must be at least 1".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("biolock-extract-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot start extraction pool: {e}")))?;
        Ok(Self {
            pool,
            in_flight: AtomicUsize::new(0),
            capacity,
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim an admission slot without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] when `capacity` requests are already admitted.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|n| {
                warn!(in_flight = n, capacity = self.capacity, "request refused, pool saturated");
                Error::Busy
            })?;
        Ok(Permit {
            in_flight: &self.in_flight,
        })
    }

    /// Run `job` on the pool, blocking the caller until it finishes.
    pub fn install<R, F>(&self, job: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(job)
    }

    /// Run two jobs in parallel on the pool.
    pub fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        self.pool.install(|| rayon::join(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(ExtractionPool::new(1, 0), Err(Error::Config(_))));
    }

    #[test]
    fn permits_are_bounded_and_released() {
        let pool = ExtractionPool::new(1, 2).unwrap();
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert!(matches!(pool.try_acquire(), Err(Error::Busy)));

        drop(a);
        assert_eq!(pool.in_flight(), 1);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn jobs_run_on_pool_threads() {
        let pool = ExtractionPool::new(2, 4).unwrap();
        let name = pool.install(|| std::thread::current().name().map(str::to_owned));
        assert!(name.unwrap().starts_with("biolock-extract-"));

        let (a, b) = pool.join(|| 2 + 2, || "done");
        assert_eq!(a, 4);
        assert_eq!(b, "done");
        assert_eq!(pool.workers(), 2);
    }

    #[test]
    fn concurrent_acquire_never_exceeds_capacity() {
        let pool = ExtractionPool::new(1, 3).unwrap();
        let admitted = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    if let Ok(_permit) = pool.try_acquire() {
                        let now = admitted.fetch_add(1, Ordering::SeqCst) + 1;
                        assert!(now <= 3);
                        std::thread::yield_now();
                        admitted.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(pool.in_flight(), 0);
    }
}
