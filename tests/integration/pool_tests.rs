//! Credential pool behavior through the public API

use crate::common::Harness;
use index_harvester::credential::PoolError;
use std::collections::HashSet;
use std::time::Duration;

#[test]
fn test_least_used_rotation_hands_out_each_credential_once() {
    let harness = Harness::new("http://127.0.0.1:9", 1);
    harness.add_credential("c1");
    harness.add_credential("c2");

    let first = harness.pool.acquire().unwrap();
    let second = harness.pool.acquire().unwrap();
    let ids: HashSet<String> = [first.id, second.id].into_iter().collect();
    assert_eq!(ids.len(), 2);

    // Usage reaches the store on the next sync
    harness.pool.sync().unwrap();
    let usage: Vec<u64> = harness
        .pool
        .list()
        .unwrap()
        .iter()
        .map(|c| c.usage_count)
        .collect();
    assert_eq!(usage, vec![1, 1]);
}

#[test]
fn test_banned_credentials_leave_rotation() {
    let harness = Harness::new("http://127.0.0.1:9", 1);
    harness.add_credential("c1");
    harness.add_credential("c2");

    harness.pool.report("c1", false, true).unwrap();
    harness
        .pool
        .ban_temporary("c2", Duration::from_secs(600))
        .unwrap();
    assert!(matches!(harness.pool.acquire(), Err(PoolError::Exhausted)));

    // A valid report never lifts a permanent ban
    harness.pool.report("c1", true, false).unwrap();
    assert!(!harness.pool.unban("c1").unwrap());
    assert!(matches!(harness.pool.acquire(), Err(PoolError::Exhausted)));

    harness.pool.report("c2", true, false).unwrap();
    assert_eq!(harness.pool.acquire().unwrap().id, "c2");

    harness.pool.force_unban("c1").unwrap();
    let status = harness.pool.status().unwrap();
    assert_eq!(status.available, 2);
    assert_eq!(status.perm_banned, 0);
}

#[test]
fn test_deleted_credential_is_never_acquired() {
    let harness = Harness::new("http://127.0.0.1:9", 1);
    harness.add_credential("c1");

    assert!(harness.pool.delete("c1").unwrap());
    assert!(!harness.pool.delete("c1").unwrap());
    assert!(matches!(harness.pool.acquire(), Err(PoolError::Exhausted)));
}
