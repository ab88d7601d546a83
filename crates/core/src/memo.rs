//! Memoizing wrapper.
//!
//! Results are keyed by the exact argument value. The cache is bounded by
//! default; once full, the oldest inserted entry is evicted first.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Hit and miss counters for a [`Memoized`] function.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// A function whose results are cached per argument value.
pub struct Memoized<F, A, T> {
    f: F,
    cache: HashMap<A, T>,
    order: VecDeque<A>,
    capacity: Option<usize>,
    stats: CacheStats,
}

/// Wraps `f` with a cache of [`DEFAULT_CAPACITY`] entries.
///
/// Functions without arguments use `()` as the key.
///
/// # Examples
///
/// ```
/// use wrapkit_core::memo::memoize;
///
/// let mut runs = 0;
/// let mut answer = memoize(|()| {
///     runs += 1;
///     42
/// });
/// assert_eq!(answer.call(()), 42);
/// assert_eq!(answer.call(()), 42);
/// drop(answer);
/// assert_eq!(runs, 1);
/// ```
pub fn memoize<F, A, T>(f: F) -> Memoized<F, A, T>
where
    F: FnMut(A) -> T,
    A: Eq + Hash + Clone,
    T: Clone,
{
    Memoized::with_capacity(f, DEFAULT_CAPACITY)
}

impl<F, A, T> Memoized<F, A, T>
where
    F: FnMut(A) -> T,
    A: Eq + Hash + Clone,
    T: Clone,
{
    /// Bounded cache holding at most `capacity` entries (at least one).
    pub fn with_capacity(f: F, capacity: usize) -> Self {
        Self::build(f, Some(capacity.max(1)))
    }

    /// Cache that keeps every entry for the lifetime of the wrapper.
    pub fn unbounded(f: F) -> Self {
        Self::build(f, None)
    }

    fn build(f: F, capacity: Option<usize>) -> Self {
        Self {
            f,
            cache: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn call(&mut self, args: A) -> T {
        if let Some(hit) = self.cache.get(&args) {
            self.stats.hits += 1;
            return hit.clone();
        }

        self.stats.misses += 1;
        let value = (self.f)(args.clone());

        if let Some(capacity) = self.capacity {
            while self.cache.len() >= capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.cache.remove(&oldest);
                tracing::trace!(capacity, "memo cache full; evicted oldest entry");
            }
        }
        self.order.push_back(args.clone());
        self.cache.insert(args, value.clone());
        value
    }

    pub fn contains(&self, args: &A) -> bool {
        self.cache.contains_key(args)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drops every cached entry; counters are kept.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.order.clear();
    }
}
