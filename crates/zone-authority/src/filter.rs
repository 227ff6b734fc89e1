//! The zone existence filter.
//!
//! Most junk traffic asks about names this service has never heard of.
//! A Bloom filter over the active zone names answers "definitely not
//! hosted" without touching the cache or the store; a false positive
//! just means one wasted store read, which then comes back empty and
//! turns into NXDOMAIN anyway.
//!
//! The filter cannot forget individual names, so deletions are handled
//! by rebuilding it wholesale from a store scan and swapping it in
//! under the lock.  Readers outside the lock see the old filter or the
//! new one, never a torn state.

use bloomfilter::Bloom;
use std::sync::RwLock;

/// How many zone names the filter is sized for.
pub const FILTER_CAPACITY: usize = 1_000_000;

/// The target false-positive rate at capacity.
pub const FILTER_FP_RATE: f64 = 0.01;

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] filter lock poisoned, cannot recover from this - aborting";

/// A swappable Bloom filter over the set of active zone names.
pub struct ZoneFilter {
    bloom: RwLock<Bloom<str>>,
}

impl ZoneFilter {
    /// An empty filter: nothing is hosted yet.
    pub fn new() -> Self {
        Self {
            bloom: RwLock::new(fresh_bloom()),
        }
    }

    /// Build a filter holding the given names.
    pub fn from_names<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let filter = Self::new();
        filter.replace_with(names);
        filter
    }

    /// Whether the zone might be hosted.  `false` is definitive;
    /// `true` may be a false positive at the configured rate.
    pub fn contains(&self, zone_name: &str) -> bool {
        self.bloom.read().expect(LOCK_POISON_MESSAGE).check(zone_name)
    }

    /// Add one name.  Serialized with swaps by the write lock.
    pub fn insert(&self, zone_name: &str) {
        self.bloom.write().expect(LOCK_POISON_MESSAGE).set(zone_name);
    }

    /// Swap in a freshly built filter holding exactly the given names.
    pub fn replace_with<I>(&self, names: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut fresh = fresh_bloom();
        for name in names {
            fresh.set(name.as_ref());
        }

        *self.bloom.write().expect(LOCK_POISON_MESSAGE) = fresh;
    }
}

impl Default for ZoneFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_bloom() -> Bloom<str> {
    Bloom::new_for_fp_rate(FILTER_CAPACITY, FILTER_FP_RATE)
}
