//! Conformance suite shared by every [`SharedStore`] backend.
//!
//! Backends call [`run_store_conformance_tests`] from their own test
//! modules so that all implementations agree on the observable contract.

use std::time::Duration;

use crate::error::StateError;
use crate::key::{KeyKind, StateKey};
use crate::store::SharedStore;

fn key(id: &str) -> StateKey {
    StateKey::new(KeyKind::Custom("conformance".into()), id)
}

/// Exercise the store contract. Panics (via `assert!`) on violation so the
/// failure points at the specific expectation.
pub async fn run_store_conformance_tests(store: &dyn SharedStore) -> Result<(), StateError> {
    // get on a missing key
    assert!(store.get(&key("missing")).await?.is_none());

    // set / get / overwrite
    store.set(&key("a"), "1", None).await?;
    assert_eq!(store.get(&key("a")).await?.as_deref(), Some("1"));
    store.set(&key("a"), "2", None).await?;
    assert_eq!(store.get(&key("a")).await?.as_deref(), Some("2"));

    // delete reports prior existence
    assert!(store.delete(&key("a")).await?);
    assert!(!store.delete(&key("a")).await?);
    assert!(store.get(&key("a")).await?.is_none());

    // incr from zero, repeated, negative delta
    assert_eq!(store.incr(&key("ctr"), 1).await?, 1);
    assert_eq!(store.incr(&key("ctr"), 1).await?, 2);
    assert_eq!(store.incr(&key("ctr"), -2).await?, 0);
    store.delete(&key("ctr")).await?;

    // expire on a missing key must not create it
    store.expire(&key("ghost"), Duration::from_secs(60)).await?;
    assert!(store.get(&key("ghost")).await?.is_none());

    // scan_prefix sees only matching live keys
    store.set(&key("scan:one"), "x", None).await?;
    store.set(&key("scan:two"), "y", None).await?;
    store.set(&key("other"), "z", None).await?;
    let mut found = store
        .scan_prefix(KeyKind::Custom("conformance".into()), "scan:")
        .await?;
    found.sort();
    assert_eq!(found.len(), 2, "scan should match exactly the prefix");
    assert!(found.iter().all(|(id, _)| id.starts_with("scan:")));

    // delete_prefix removes them and reports the count
    let removed = store
        .delete_prefix(KeyKind::Custom("conformance".into()), "scan:")
        .await?;
    assert_eq!(removed, 2);
    assert!(store.get(&key("scan:one")).await?.is_none());
    assert_eq!(store.get(&key("other")).await?.as_deref(), Some("z"));
    store.delete(&key("other")).await?;

    // health check round-trips
    store.health_check().await?;

    Ok(())
}
