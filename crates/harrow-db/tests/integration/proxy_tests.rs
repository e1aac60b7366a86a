use std::collections::BTreeSet;

use harrow_core::error::AppError;
use harrow_core::models::{NewProxy, ProxyKey, ProxyScheme, SelectionPolicy};
use harrow_core::registry::ProxyRegistry;
use harrow_core::traits::ProxyStore;

use crate::common::setup_test_db;

fn candidates(endpoints: &[&str]) -> Vec<NewProxy> {
    endpoints
        .iter()
        .map(|e| NewProxy::new(*e, ProxyScheme::Http, "test"))
        .collect()
}

fn key(endpoint: &str) -> ProxyKey {
    ProxyKey::new(endpoint, ProxyScheme::Http)
}

#[tokio::test]
async fn insert_many_ignores_known_keys() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();

    let inserted = repo
        .insert_many(&candidates(&["http://10.0.0.1:80", "http://10.0.0.2:80"]))
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let mut again = candidates(&["http://10.0.0.2:80", "http://10.0.0.3:80"]);
    again.push(NewProxy::new("http://10.0.0.1:80", ProxyScheme::Https, "test"));
    let inserted = repo.insert_many(&again).await.unwrap();
    assert_eq!(inserted, 2, "same endpoint with another scheme is a new proxy");

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.eligible, 4);
}

#[tokio::test]
async fn new_proxy_round_trips_fields() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();
    repo.insert_many(&[NewProxy::new("http://10.0.0.9:3128", ProxyScheme::Https, "fpl")])
        .await
        .unwrap();

    let proxy = repo
        .get(&ProxyKey::new("http://10.0.0.9:3128", ProxyScheme::Https))
        .await
        .unwrap()
        .expect("proxy should exist");
    assert_eq!(proxy.scheme, ProxyScheme::Https);
    assert_eq!(proxy.source, "fpl");
    assert_eq!(proxy.ping_ms, None);
    assert!(proxy.is_eligible());

    assert!(repo.get(&key("http://10.0.0.9:3128")).await.unwrap().is_none());
}

#[tokio::test]
async fn select_skips_frozen_and_deleted() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();
    repo.insert_many(&candidates(&["http://a:1", "http://b:1", "http://c:1"]))
        .await
        .unwrap();

    repo.freeze(&key("http://a:1")).await.unwrap();
    repo.mark_deleted(&key("http://b:1")).await.unwrap();

    for policy in [SelectionPolicy::Lru, SelectionPolicy::Random] {
        for _ in 0..5 {
            let picked = repo.select(policy).await.unwrap().unwrap();
            assert_eq!(picked.endpoint, "http://c:1");
        }
    }

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.eligible, 1);
    assert_eq!(stats.frozen, 1);
    assert_eq!(stats.deleted, 1);
}

#[tokio::test]
async fn lru_select_rotates_through_pool() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();
    repo.insert_many(&candidates(&["http://a:1", "http://b:1", "http://c:1"]))
        .await
        .unwrap();

    let mut seen = BTreeSet::new();
    for _ in 0..3 {
        let picked = repo.select(SelectionPolicy::Lru).await.unwrap().unwrap();
        seen.insert(picked.endpoint);
    }
    assert_eq!(seen.len(), 3, "each proxy picked once before any repeats");
}

#[tokio::test]
async fn empty_pool_reports_no_proxy() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();
    assert!(repo.select(SelectionPolicy::Lru).await.unwrap().is_none());

    let registry = ProxyRegistry::new(repo);
    assert!(matches!(
        registry.select(SelectionPolicy::Random).await,
        Err(AppError::NoProxyAvailable)
    ));
}

#[tokio::test]
async fn unfreeze_all_restores_frozen_only() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();
    repo.insert_many(&candidates(&["http://a:1", "http://b:1", "http://c:1"]))
        .await
        .unwrap();
    repo.freeze(&key("http://a:1")).await.unwrap();
    repo.freeze(&key("http://b:1")).await.unwrap();
    repo.mark_deleted(&key("http://b:1")).await.unwrap();

    // b is both frozen and deleted; it thaws but stays out of rotation.
    assert_eq!(repo.unfreeze_all().await.unwrap(), 2);
    assert_eq!(repo.unfreeze_all().await.unwrap(), 0);

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.eligible, 2);
    assert_eq!(stats.deleted, 1);
    let deleted = repo.get(&key("http://b:1")).await.unwrap().unwrap();
    assert!(!deleted.is_eligible());
}

#[tokio::test]
async fn verification_results_are_recorded() {
    let (db, _container) = setup_test_db().await;
    let repo = db.proxy_repo();
    repo.insert_many(&candidates(&["http://a:1", "http://b:1"]))
        .await
        .unwrap();

    repo.record_verified(&key("http://a:1"), 120).await.unwrap();
    repo.mark_deleted(&key("http://b:1")).await.unwrap();
    repo.record_verified(&key("http://b:1"), 80).await.unwrap();

    let a = repo.get(&key("http://a:1")).await.unwrap().unwrap();
    assert_eq!(a.ping_ms, Some(120));

    let b = repo.get(&key("http://b:1")).await.unwrap().unwrap();
    assert!(b.is_deleted);
    assert_eq!(b.ping_ms, None);

    let verifiable = repo.list_verifiable().await.unwrap();
    let endpoints: Vec<&str> = verifiable.iter().map(|p| p.endpoint.as_str()).collect();
    assert_eq!(endpoints, vec!["http://a:1"]);
}
