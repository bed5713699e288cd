//! Leaderboard rank cache.
//!
//! One ordered skiplist per `(leaderboard_id, expiry)` window, paired with
//! an owner index mapping `user_id -> (generation, score, subscore)`.  Rank
//! lookups and top-k listings never touch the database.  A monotonic
//! per-owner generation (the record's `num_score`) guards against stale
//! writes: an insert only replaces the cached node when its generation is
//! strictly newer.

pub mod cursor;
pub mod skiplist;
pub mod warmup;

use crate::error::{ServerError, ServerResult};
use arena_protocol::RecordEntry;
use skiplist::SkipList;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    Ascending,
    Descending,
}

impl RankOrder {
    pub fn from_sort_order(sort_order: i16) -> Self {
        if sort_order == 0 { Self::Ascending } else { Self::Descending }
    }
}

/// Sort key: `(score, subscore, owner_bytes)` lexicographic, inverted
/// wholesale for descending leaderboards.  Owner bytes are the raw 16-byte
/// identifier so the order is total and independent of string formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RankKey {
    descending: bool,
    score: i64,
    subscore: i64,
    owner: [u8; 16],
}

impl RankKey {
    fn new(order: RankOrder, score: i64, subscore: i64, owner: Uuid) -> Self {
        Self {
            descending: order == RankOrder::Descending,
            score,
            subscore,
            owner: *owner.as_bytes(),
        }
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let natural = self
            .score
            .cmp(&other.score)
            .then(self.subscore.cmp(&other.subscore))
            .then(self.owner.cmp(&other.owner));
        if self.descending { natural.reverse() } else { natural }
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRecord {
    generation: i64,
    score: i64,
    subscore: i64,
}

struct RankCacheEntry {
    order: RankOrder,
    list: SkipList<RankKey>,
    owners: HashMap<Uuid, CachedRecord>,
}

impl RankCacheEntry {
    fn key_for(&self, owner: Uuid, record: CachedRecord) -> RankKey {
        RankKey::new(self.order, record.score, record.subscore, owner)
    }
}

type CacheKey = (String, i64);

pub struct LeaderboardRankCache {
    caches: RwLock<HashMap<CacheKey, Arc<Mutex<RankCacheEntry>>>>,
    blacklist: HashSet<String>,
    disable_all: bool,
}

impl LeaderboardRankCache {
    pub fn new(blacklist: HashSet<String>) -> Self {
        let disable_all = blacklist.contains("*");
        Self {
            caches: RwLock::new(HashMap::new()),
            blacklist,
            disable_all,
        }
    }

    pub fn caching_enabled(&self, leaderboard_id: &str) -> bool {
        !self.disable_all && !self.blacklist.contains(leaderboard_id)
    }

    fn entry(&self, leaderboard_id: &str, expiry: i64) -> Option<Arc<Mutex<RankCacheEntry>>> {
        self.caches
            .read()
            .expect("rank cache map poisoned")
            .get(&(leaderboard_id.to_owned(), expiry))
            .cloned()
    }

    /// The map write lock is taken only to create a missing entry.
    fn entry_or_create(
        &self,
        leaderboard_id: &str,
        expiry: i64,
        order: RankOrder,
    ) -> Arc<Mutex<RankCacheEntry>> {
        if let Some(entry) = self.entry(leaderboard_id, expiry) {
            return entry;
        }
        let mut caches = self.caches.write().expect("rank cache map poisoned");
        caches
            .entry((leaderboard_id.to_owned(), expiry))
            .or_insert_with(|| {
                Arc::new(Mutex::new(RankCacheEntry {
                    order,
                    list: SkipList::new(),
                    owners: HashMap::new(),
                }))
            })
            .clone()
    }

    /// 1-based rank of an owner; 0 when the leaderboard is uncached or the
    /// owner has no record.
    pub fn get(&self, leaderboard_id: &str, expiry: i64, owner: Uuid) -> i64 {
        if !self.caching_enabled(leaderboard_id) {
            return 0;
        }
        let Some(entry) = self.entry(leaderboard_id, expiry) else {
            return 0;
        };
        let entry = entry.lock().expect("rank cache entry poisoned");
        let Some(&record) = entry.owners.get(&owner) else {
            return 0;
        };
        entry
            .list
            .rank(&entry.key_for(owner, record))
            .map_or(0, |rank| rank as i64)
    }

    /// Owner and scores at a 1-based rank.
    pub fn get_by_rank(
        &self,
        leaderboard_id: &str,
        expiry: i64,
        rank: i64,
    ) -> ServerResult<(Uuid, i64, i64)> {
        if !self.caching_enabled(leaderboard_id) {
            return Err(ServerError::FailedPrecondition(
                "rank caching is disabled for this leaderboard".to_owned(),
            ));
        }
        let entry = self
            .entry(leaderboard_id, expiry)
            .ok_or_else(|| ServerError::NotFound("leaderboard not cached".to_owned()))?;
        let entry = entry.lock().expect("rank cache entry poisoned");
        let rank = usize::try_from(rank)
            .map_err(|_| ServerError::invalid_input("rank must be positive"))?;
        let key = entry
            .list
            .get_by_rank(rank)
            .ok_or_else(|| ServerError::NotFound("rank out of range".to_owned()))?;
        Ok((Uuid::from_bytes(key.owner), key.score, key.subscore))
    }

    /// Stamp ranks onto a listing.  Returns the entry's current size.
    pub fn fill(
        &self,
        leaderboard_id: &str,
        expiry: i64,
        records: &mut [RecordEntry],
        enable_ranks: bool,
    ) -> usize {
        if !enable_ranks || !self.caching_enabled(leaderboard_id) {
            return 0;
        }
        let Some(entry) = self.entry(leaderboard_id, expiry) else {
            return 0;
        };
        let entry = entry.lock().expect("rank cache entry poisoned");
        for record in records {
            if let Some(&cached) = entry.owners.get(&record.owner_id) {
                record.rank = entry
                    .list
                    .rank(&entry.key_for(record.owner_id, cached))
                    .map_or(0, |rank| rank as i64);
            }
        }
        entry.list.len()
    }

    /// Insert or refresh an owner's record.  A stale or equal generation is
    /// dropped and the rank of the stored node is returned unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        leaderboard_id: &str,
        order: RankOrder,
        score: i64,
        subscore: i64,
        generation: i64,
        expiry: i64,
        owner: Uuid,
        enable_ranks: bool,
    ) -> i64 {
        if !enable_ranks || !self.caching_enabled(leaderboard_id) {
            return 0;
        }
        let entry = self.entry_or_create(leaderboard_id, expiry, order);
        let mut entry = entry.lock().expect("rank cache entry poisoned");

        if let Some(&existing) = entry.owners.get(&owner) {
            if generation <= existing.generation {
                return entry
                    .list
                    .rank(&entry.key_for(owner, existing))
                    .map_or(0, |rank| rank as i64);
            }
            let old_key = entry.key_for(owner, existing);
            let _ = entry.list.remove(&old_key);
        }
        let record = CachedRecord {
            generation,
            score,
            subscore,
        };
        let _ = entry.owners.insert(owner, record);
        let key = entry.key_for(owner, record);
        entry.list.insert(key) as i64
    }

    pub fn delete(&self, leaderboard_id: &str, expiry: i64, owner: Uuid) -> bool {
        if !self.caching_enabled(leaderboard_id) {
            return false;
        }
        let Some(entry) = self.entry(leaderboard_id, expiry) else {
            return false;
        };
        let mut entry = entry.lock().expect("rank cache entry poisoned");
        let Some(record) = entry.owners.remove(&owner) else {
            return false;
        };
        let key = entry.key_for(owner, record);
        entry.list.remove(&key)
    }

    pub fn delete_leaderboard(&self, leaderboard_id: &str, expiry: i64) {
        let mut caches = self.caches.write().expect("rank cache map poisoned");
        let _ = caches.remove(&(leaderboard_id.to_owned(), expiry));
    }

    /// Drop every window whose non-zero expiry has passed.  Never-expiring
    /// windows (`expiry == 0`) are retained.
    pub fn trim_expired(&self, now_unix: i64) {
        let mut caches = self.caches.write().expect("rank cache map poisoned");
        caches.retain(|&(_, expiry), _| expiry == 0 || expiry > now_unix);
    }

    #[cfg(test)]
    pub(crate) fn window_sizes(&self, leaderboard_id: &str, expiry: i64) -> Option<(usize, usize)> {
        let entry = self.entry(leaderboard_id, expiry)?;
        let entry = entry.lock().expect("rank cache entry poisoned");
        Some((entry.list.len(), entry.owners.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> LeaderboardRankCache {
        LeaderboardRankCache::new(HashSet::new())
    }

    #[test]
    fn descending_insert_and_rank() {
        let cache = cache();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(
            cache.insert("lb1", RankOrder::Descending, 100, 0, 1, 0, a, true),
            1
        );
        assert_eq!(
            cache.insert("lb1", RankOrder::Descending, 150, 0, 1, 0, b, true),
            1
        );
        assert_eq!(cache.get("lb1", 0, a), 2);

        // Newer generation moves the owner.
        assert_eq!(
            cache.insert("lb1", RankOrder::Descending, 200, 0, 2, 0, a, true),
            1
        );
        assert_eq!(cache.get("lb1", 0, a), 1);
        assert_eq!(cache.get("lb1", 0, b), 2);

        // A stale write is a no-op.
        assert_eq!(
            cache.insert("lb1", RankOrder::Descending, 50, 0, 1, 0, a, true),
            1
        );
        assert_eq!(cache.get("lb1", 0, a), 1);
        let (owner, score, subscore) = cache.get_by_rank("lb1", 0, 1).expect("rank 1 exists");
        assert_eq!((owner, score, subscore), (a, 200, 0));
    }

    #[test]
    fn equal_generation_ties_keep_the_first_write() {
        let cache = cache();
        let a = Uuid::new_v4();
        let _ = cache.insert("lb1", RankOrder::Ascending, 10, 0, 3, 0, a, true);
        let _ = cache.insert("lb1", RankOrder::Ascending, 99, 0, 3, 0, a, true);
        let (sizes, owners) = cache.window_sizes("lb1", 0).expect("window exists");
        assert_eq!((sizes, owners), (1, 1));
        let (_, score, _) = cache.get_by_rank("lb1", 0, 1).expect("rank 1 exists");
        assert_eq!(score, 10);
    }

    #[test]
    fn skiplist_and_owner_index_sizes_stay_equal() {
        let cache = cache();
        let owners: Vec<Uuid> = (0..40).map(|_| Uuid::new_v4()).collect();
        for (i, owner) in owners.iter().enumerate() {
            let _ = cache.insert(
                "lb1",
                RankOrder::Ascending,
                (i as i64) % 7,
                0,
                1,
                0,
                *owner,
                true,
            );
        }
        assert_eq!(cache.window_sizes("lb1", 0), Some((40, 40)));
        for owner in owners.iter().take(10) {
            assert!(cache.delete("lb1", 0, *owner));
        }
        assert_eq!(cache.window_sizes("lb1", 0), Some((30, 30)));
    }

    #[test]
    fn owner_bytes_break_score_ties_deterministically() {
        let cache = cache();
        let mut owners: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        for owner in &owners {
            let _ = cache.insert("lb1", RankOrder::Ascending, 5, 5, 1, 0, *owner, true);
        }
        owners.sort_by_key(|o| *o.as_bytes());
        for (i, owner) in owners.iter().enumerate() {
            assert_eq!(cache.get("lb1", 0, *owner), (i + 1) as i64);
        }
    }

    #[test]
    fn blacklisted_leaderboards_are_noops() {
        let mut blacklist = HashSet::new();
        let _ = blacklist.insert("banned".to_owned());
        let cache = LeaderboardRankCache::new(blacklist);
        let owner = Uuid::new_v4();

        assert_eq!(
            cache.insert("banned", RankOrder::Ascending, 1, 0, 1, 0, owner, true),
            0
        );
        assert_eq!(cache.get("banned", 0, owner), 0);
        assert!(cache.get_by_rank("banned", 0, 1).is_err());

        // Other leaderboards still cache.
        assert_eq!(
            cache.insert("open", RankOrder::Ascending, 1, 0, 1, 0, owner, true),
            1
        );
    }

    #[test]
    fn global_disable_shuts_everything_off() {
        let mut blacklist = HashSet::new();
        let _ = blacklist.insert("*".to_owned());
        let cache = LeaderboardRankCache::new(blacklist);
        let owner = Uuid::new_v4();
        assert_eq!(
            cache.insert("any", RankOrder::Ascending, 1, 0, 1, 0, owner, true),
            0
        );
        assert_eq!(cache.get("any", 0, owner), 0);
    }

    #[test]
    fn trim_expired_retains_never_expiring_windows() {
        let cache = cache();
        let owner = Uuid::new_v4();
        let _ = cache.insert("lb1", RankOrder::Ascending, 1, 0, 1, 0, owner, true);
        let _ = cache.insert("lb1", RankOrder::Ascending, 1, 0, 1, 500, owner, true);
        let _ = cache.insert("lb1", RankOrder::Ascending, 1, 0, 1, 2000, owner, true);

        cache.trim_expired(1000);
        assert!(cache.window_sizes("lb1", 0).is_some(), "expiry 0 retained");
        assert!(cache.window_sizes("lb1", 500).is_none(), "past window dropped");
        assert!(cache.window_sizes("lb1", 2000).is_some(), "future window kept");
    }

    #[test]
    fn delete_leaderboard_removes_the_window() {
        let cache = cache();
        let owner = Uuid::new_v4();
        let _ = cache.insert("lb1", RankOrder::Ascending, 1, 0, 1, 0, owner, true);
        cache.delete_leaderboard("lb1", 0);
        assert_eq!(cache.get("lb1", 0, owner), 0);
    }

    #[test]
    fn fill_stamps_ranks_on_records() {
        let cache = cache();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _ = cache.insert("lb1", RankOrder::Descending, 10, 0, 1, 0, a, true);
        let _ = cache.insert("lb1", RankOrder::Descending, 20, 0, 1, 0, b, true);

        let mut records = vec![
            RecordEntry {
                owner_id: a,
                username: None,
                score: 10,
                subscore: 0,
                num_score: 1,
                rank: 0,
            },
            RecordEntry {
                owner_id: Uuid::new_v4(),
                username: None,
                score: 0,
                subscore: 0,
                num_score: 1,
                rank: 0,
            },
        ];
        let size = cache.fill("lb1", 0, &mut records, true);
        assert_eq!(size, 2);
        assert_eq!(records[0].rank, 2);
        assert_eq!(records[1].rank, 0, "uncached owner keeps rank 0");
    }
}
