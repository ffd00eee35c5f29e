//! Claim / expiry lifecycle of the slot pool, driven through the mock
//! cluster store.

mod common;

use common::{build_pool, up_params, MockFetcher, MockStore};
use envpool::pool::{now_secs, PoolError, SlotStatus, CLAIM_EXPIRE_SECONDS};

#[tokio::test]
async fn test_claims_exhaust_pool_then_deny() {
    let pool = build_pool(2, MockStore::new(), MockFetcher::with_files(&[]));

    let first = pool.claim().await;
    let second = pool.claim().await;
    assert!(first.claim_granted);
    assert!(second.claim_granted);
    assert_ne!(first.claim_token, second.claim_token);
    // claim tokens are uuids
    assert_eq!(first.claim_token.len(), 36);

    let third = pool.claim().await;
    assert!(!third.claim_granted);
    assert!(third.claim_token.is_empty());
    assert_eq!(third.message, "No environments available");

    // stays denied for as long as nothing frees up
    let fourth = pool.claim().await;
    assert!(!fourth.claim_granted);
}

#[tokio::test]
async fn test_claim_scans_slots_in_index_order() {
    let pool = build_pool(3, MockStore::new(), MockFetcher::with_files(&[]));
    pool.claim().await;
    let slots = pool.snapshot().await;
    assert_eq!(slots[0].status, SlotStatus::Claimed);
    assert_eq!(slots[1].status, SlotStatus::Idle);
    assert_eq!(slots[2].status, SlotStatus::Idle);
}

#[tokio::test]
async fn test_expired_claim_is_released_and_token_invalidated() {
    let pool = build_pool(2, MockStore::new(), MockFetcher::with_files(&[]));
    let claim = pool.claim().await;
    assert!(claim.claim_granted);

    pool.reconcile(now_secs() + CLAIM_EXPIRE_SECONDS + 5).await;

    let slots = pool.snapshot().await;
    assert!(slots
        .iter()
        .all(|s| s.status == SlotStatus::Idle && s.claim_token.is_empty()));

    // the stale token no longer authorises an up
    let result = pool
        .up(up_params(&claim.claim_token, "https://github.com/x/y"))
        .await;
    match result {
        Err(PoolError::Unauthorized(message)) => assert_eq!(message, "Invalid claim token"),
        other => panic!("expected unauthorized, got {other:?}"),
    }
}

#[tokio::test]
async fn test_claim_within_expiry_window_survives() {
    let pool = build_pool(1, MockStore::new(), MockFetcher::with_files(&[]));
    let claim = pool.claim().await;

    pool.reconcile(now_secs() + CLAIM_EXPIRE_SECONDS - 1).await;

    let slots = pool.snapshot().await;
    assert_eq!(slots[0].status, SlotStatus::Claimed);
    assert_eq!(slots[0].claim_token, claim.claim_token);
}

#[tokio::test]
async fn test_ping_unknown_token() {
    let pool = build_pool(1, MockStore::new(), MockFetcher::with_files(&[]));
    let response = pool.ping("no-such-token", false).await.unwrap();
    assert!(!response.claim_granted);
    assert!(!response.up);
}

#[tokio::test]
async fn test_ping_empty_token_does_not_match_idle_slots() {
    let pool = build_pool(1, MockStore::new(), MockFetcher::with_files(&[]));
    let response = pool.ping("", false).await.unwrap();
    assert!(!response.claim_granted);
}

#[tokio::test]
async fn test_ping_refreshes_claim() {
    let pool = build_pool(1, MockStore::new(), MockFetcher::with_files(&[]));
    let claim = pool.claim().await;
    let response = pool.ping(&claim.claim_token, false).await.unwrap();
    assert!(response.claim_granted);
    assert!(!response.up);

    let slots = pool.snapshot().await;
    assert!(slots[0].last_activity >= now_secs() - 1);
}

#[tokio::test]
async fn test_provisioning_completes_to_idle() {
    let store = MockStore::new();
    let pool = build_pool(1, store.clone(), MockFetcher::with_files(&[]));
    // empty cluster: init provisions the slot, and the mock job spawns a
    // running provisioner pod, so the first pass keeps it Provisioning
    pool.init().await.unwrap();
    let slots = pool.snapshot().await;
    assert_eq!(slots[0].status, SlotStatus::Provisioning);
    assert!(store.state.lock().unwrap().jobs.contains_key("env-1-provision-job"));

    // provisioner finishes
    store.set_pod_phase("env-1-provision", "Succeeded");
    pool.reconcile(now_secs()).await;

    let slots = pool.snapshot().await;
    assert_eq!(slots[0].status, SlotStatus::Idle);
    assert!(!store.state.lock().unwrap().jobs.contains_key("env-1-provision-job"));
}

#[tokio::test]
async fn test_reconcile_ignores_idle_slots() {
    let pool = build_pool(2, MockStore::new(), MockFetcher::with_files(&[]));
    pool.reconcile(now_secs() + 1_000_000).await;
    let slots = pool.snapshot().await;
    assert!(slots.iter().all(|s| s.status == SlotStatus::Idle));
}
