use std::sync::Arc;

use apdu_relay::clock::{ManualClock, SharedClock};
use apdu_relay::config::KeyConfig;
use apdu_relay::crypto::session_keys::KeyExchangeManager;
use apdu_relay::error::AppError;
use chrono::{Duration, Utc};
use tokio::sync::Barrier;

fn manager() -> (Arc<KeyExchangeManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let shared: SharedClock = clock.clone();
    (Arc::new(KeyExchangeManager::new(&KeyConfig::default(), shared)), clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generation_yields_one_key_set() {
    let (keys, _clock) = manager();
    let start = Arc::new(Barrier::new(16));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let keys = keys.clone();
        let start = start.clone();
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            keys.generate_session_keys("pair_race").await.unwrap()
        }));
    }

    let mut generated = Vec::new();
    for task in tasks {
        generated.push(task.await.unwrap());
    }
    let first = &generated[0];
    assert!(generated.iter().all(|k| Arc::ptr_eq(k, first)));
    assert_eq!(keys.key_count().await, 1);
}

#[tokio::test]
async fn key_sets_are_distinct_per_session() {
    let (keys, _clock) = manager();
    let a = keys.generate_session_keys("pair_a").await.unwrap();
    let b = keys.generate_session_keys("pair_b").await.unwrap();

    assert!(a.key_id.starts_with("key_"));
    assert_eq!(a.key_id.len(), "key_".len() + 16);
    assert_ne!(a.key_id, b.key_id);
    assert_ne!(a.encryption_key, b.encryption_key);
    assert_ne!(a.encryption_key, a.mac_key);

    let again = keys.get_session_keys("pair_a").await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
}

#[tokio::test]
async fn keys_expire_after_their_lifetime() {
    let (keys, clock) = manager();
    let issued = keys.generate_session_keys("pair_exp").await.unwrap();
    assert_eq!(issued.expires_at - issued.created_at, Duration::hours(48));

    clock.advance(Duration::hours(48) - Duration::seconds(1));
    assert!(keys.get_session_keys("pair_exp").await.is_ok());

    clock.advance(Duration::seconds(1));
    let err = keys.get_session_keys("pair_exp").await.unwrap_err();
    assert!(matches!(err, AppError::Expired(_)));

    // an expired set is replaced on the next generation
    let renewed = keys.generate_session_keys("pair_exp").await.unwrap();
    assert_ne!(renewed.key_id, issued.key_id);
    assert!(keys.get_session_keys("pair_exp").await.is_ok());
}

#[tokio::test]
async fn cleanup_drops_only_expired_sets() {
    let (keys, clock) = manager();
    keys.generate_session_keys("pair_old").await.unwrap();
    clock.advance(Duration::hours(24));
    keys.generate_session_keys("pair_new").await.unwrap();

    assert_eq!(keys.cleanup_expired_keys().await, 0);

    clock.advance(Duration::hours(24) + Duration::seconds(1));
    assert_eq!(keys.cleanup_expired_keys().await, 1);
    assert_eq!(keys.key_count().await, 1);
    assert!(matches!(
        keys.get_session_keys("pair_old").await.unwrap_err(),
        AppError::NotFound(_)
    ));
    assert!(keys.get_session_keys("pair_new").await.is_ok());
}

#[tokio::test]
async fn revocation_is_idempotent() {
    let (keys, _clock) = manager();
    keys.generate_session_keys("pair_rev").await.unwrap();

    assert!(keys.revoke_session_keys("pair_rev").await);
    assert!(!keys.revoke_session_keys("pair_rev").await);
    assert!(matches!(
        keys.get_session_keys("pair_rev").await.unwrap_err(),
        AppError::NotFound(_)
    ));
}

#[tokio::test]
async fn empty_session_ids_are_rejected() {
    let (keys, _clock) = manager();
    assert!(matches!(
        keys.generate_session_keys("").await.unwrap_err(),
        AppError::Validation(_)
    ));
}
