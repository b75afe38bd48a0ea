use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

/// (poll_id, participant_id): serializes one participant's edits on one poll.
pub type VoteKey = (i64, i64);
/// (guild_id, category): serializes every write to one leaderboard scope.
pub type ScopeKey = (i64, String);

/// Async mutual exclusion per key.
///
/// Work on different keys never waits on each other. Entries are dropped once
/// no task holds or waits on them, so the map only grows with live contention.
pub struct KeyedLocks<K>
where
    K: Eq + Hash,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Run `work` while holding the lock for `key`.
    ///
    /// The key is released when this future completes or is dropped, so a
    /// cancelled caller does not leave an idle entry behind.
    pub async fn run<F, T>(&self, key: K, work: F) -> T
    where
        F: Future<Output = T>,
    {
        // Declared first so it drops after the lock handle below.
        let _release = ReleaseKey {
            locks: &self.locks,
            key: key.clone(),
        };
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let _guard = lock.lock().await;
        work.await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a key from its map once no other task shares the lock.
struct ReleaseKey<'a, K>
where
    K: Eq + Hash,
{
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
}

impl<K> Drop for ReleaseKey<'_, K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Default)]
pub struct EngineLocks {
    pub votes: KeyedLocks<VoteKey>,
    pub scopes: KeyedLocks<ScopeKey>,
}

impl EngineLocks {
    pub fn new() -> Self {
        Self::default()
    }
}
