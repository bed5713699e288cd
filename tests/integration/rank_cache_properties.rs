//! Rank cache property checks across many interleavings: generation
//! monotonicity, skiplist/owner-index agreement, tie ordering, expiry
//! trimming, and cursor opacity.

use server::leaderboard::cursor::{self, RecordCursor};
use server::leaderboard::{LeaderboardRankCache, RankOrder};
use std::collections::HashSet;
use uuid::Uuid;

fn cache() -> LeaderboardRankCache {
    LeaderboardRankCache::new(HashSet::new())
}

#[test]
fn descending_best_scenario() {
    let cache = cache();
    let owner_a = Uuid::new_v4();
    let owner_b = Uuid::new_v4();
    let expiry = 0;

    let _ = cache.insert("lb1", RankOrder::Descending, 100, 0, 1, expiry, owner_a, true);
    let _ = cache.insert("lb1", RankOrder::Descending, 150, 0, 1, expiry, owner_b, true);
    let _ = cache.insert("lb1", RankOrder::Descending, 200, 0, 2, expiry, owner_a, true);

    assert_eq!(cache.get("lb1", expiry, owner_a), 1);
    assert_eq!(cache.get("lb1", expiry, owner_b), 2);

    // Stale generation: a no-op.
    let _ = cache.insert("lb1", RankOrder::Descending, 50, 0, 1, expiry, owner_a, true);
    assert_eq!(cache.get("lb1", expiry, owner_a), 1);
    let (owner, score, _) = cache.get_by_rank("lb1", expiry, 1).expect("rank 1");
    assert_eq!((owner, score), (owner_a, 200));
}

#[test]
fn final_generation_is_the_maximum_of_all_writes() {
    let cache = cache();
    let owner = Uuid::new_v4();
    // Interleave stale and fresh writes; the payload of the max generation
    // must win regardless of arrival order.
    let writes: &[(i64, i64)] = &[(3, 30), (1, 10), (5, 50), (2, 20), (4, 40)];
    for &(generation, score) in writes {
        let _ = cache.insert("lb", RankOrder::Ascending, score, 0, generation, 0, owner, true);
    }
    let (_, score, _) = cache.get_by_rank("lb", 0, 1).expect("rank 1");
    assert_eq!(score, 50, "payload of generation 5 must be stored");
}

#[test]
fn same_generation_twice_yields_a_single_node() {
    let cache = cache();
    let owner = Uuid::new_v4();
    let _ = cache.insert("lb", RankOrder::Ascending, 7, 0, 2, 0, owner, true);
    let _ = cache.insert("lb", RankOrder::Ascending, 7, 0, 2, 0, owner, true);
    assert_eq!(cache.get("lb", 0, owner), 1);
    assert!(cache.get_by_rank("lb", 0, 2).is_err(), "exactly one node");
}

#[test]
fn ascending_and_descending_agree_on_reversed_order() {
    let asc = cache();
    let desc = cache();
    let owners: Vec<Uuid> = (0..25).map(|_| Uuid::new_v4()).collect();
    for (i, owner) in owners.iter().enumerate() {
        let score = (i as i64 * 13) % 17;
        let _ = asc.insert("lb", RankOrder::Ascending, score, 0, 1, 0, *owner, true);
        let _ = desc.insert("lb", RankOrder::Descending, score, 0, 1, 0, *owner, true);
    }
    let n = owners.len() as i64;
    for rank in 1..=n {
        let (owner_asc, ..) = asc.get_by_rank("lb", 0, rank).expect("asc rank");
        let (owner_desc, ..) = desc.get_by_rank("lb", 0, n + 1 - rank).expect("desc rank");
        assert_eq!(owner_asc, owner_desc, "rank {rank} mirrors");
    }
}

#[test]
fn delete_and_trim_maintain_consistency() {
    let cache = cache();
    let owners: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
    for (i, owner) in owners.iter().enumerate() {
        let _ = cache.insert("lb", RankOrder::Ascending, i as i64, 0, 1, 0, *owner, true);
        let _ = cache.insert("lb", RankOrder::Ascending, i as i64, 0, 1, 999, *owner, true);
    }
    assert!(cache.delete("lb", 0, owners[0]));
    assert!(!cache.delete("lb", 0, owners[0]), "second delete is a no-op");
    assert_eq!(cache.get("lb", 0, owners[1]), 1);

    // Trim at a time past the 999 window: only the never-expiring window
    // survives.
    cache.trim_expired(1_000);
    assert_eq!(cache.get("lb", 999, owners[1]), 0);
    assert_eq!(cache.get("lb", 0, owners[1]), 1);
}

#[test]
fn get_by_rank_rejects_out_of_range_and_disabled() {
    let mut blacklist = HashSet::new();
    let _ = blacklist.insert("dark".to_owned());
    let cache = LeaderboardRankCache::new(blacklist);
    let owner = Uuid::new_v4();

    let _ = cache.insert("lb", RankOrder::Ascending, 1, 0, 1, 0, owner, true);
    assert!(cache.get_by_rank("lb", 0, 0).is_err());
    assert!(cache.get_by_rank("lb", 0, 2).is_err());
    assert!(cache.get_by_rank("lb", 0, 1).is_ok());
    assert!(cache.get_by_rank("dark", 0, 1).is_err(), "blacklisted");
}

#[test]
fn many_owners_rank_like_a_sorted_vector() {
    let cache = cache();
    let mut expected: Vec<(i64, i64, [u8; 16])> = Vec::new();
    for i in 0..300i64 {
        let owner = Uuid::new_v4();
        let score = (i * 7919) % 101;
        let subscore = i % 3;
        let _ = cache.insert("lb", RankOrder::Ascending, score, subscore, 1, 0, owner, true);
        expected.push((score, subscore, *owner.as_bytes()));
    }
    expected.sort();
    for (idx, &(score, _, owner_bytes)) in expected.iter().enumerate() {
        let owner = Uuid::from_bytes(owner_bytes);
        assert_eq!(
            cache.get("lb", 0, owner),
            (idx + 1) as i64,
            "owner with score {score}"
        );
    }
}

#[test]
fn cursors_round_trip_and_reject_tampering() {
    let cursor = RecordCursor {
        score: 10,
        subscore: 2,
        owner: Uuid::new_v4(),
        expiry: 1_700_000_000,
        rank: 7,
    };
    let encoded = cursor::encode(&cursor).expect("encode");
    assert_eq!(cursor::decode(&encoded).expect("decode"), cursor);
    assert!(cursor::decode("@@@not-a-cursor@@@").is_err());
}
