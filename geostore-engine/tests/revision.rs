//! Revision chain behavior, run against both backends

use chrono::Utc;
use geostore_core::*;
use geostore_engine::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn backends() -> Vec<(Arc<dyn BucketFactory>, Option<tempfile::TempDir>)> {
    let (fjall, temp) = FjallStorage::temp().unwrap();
    vec![
        (Arc::new(fjall), Some(temp)),
        (Arc::new(MemoryStorage::default()), None),
    ]
}

fn bucket(factory: &Arc<dyn BucketFactory>) -> Arc<dyn Bucket> {
    let options = BucketOptions::default().with_srid(4326);
    factory
        .create_bucket(&BucketName::new("b1").unwrap(), false, options)
        .unwrap()
}

fn mapper(x: i64) -> Mapper {
    let mut properties = JsonObject::new();
    properties.insert("x".to_string(), serde_json::json!(x));
    Mapper::new(properties, JsonObject::new(), "POINT (1 1)", 4326)
}

fn x_of(mapper: &Mapper) -> i64 {
    mapper.properties["x"].as_i64().unwrap()
}

#[test]
fn alice_scenario() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);

        let r1 = b1.commit("alice", &mapper(1), None).unwrap().revision.unwrap();
        let r2 = b1.commit("alice", &mapper(2), Some(&r1)).unwrap().revision.unwrap();
        assert_ne!(r1, r2);

        let err = b1.commit("alice", &mapper(3), Some(&r1)).unwrap_err();
        assert!(matches!(err, GeoStoreError::NotHeadRevision { .. }));

        let (commit, old) = b1.checkout("alice", Some(&r1)).unwrap();
        assert_eq!(x_of(&old), 1);
        assert_eq!(commit.revision, Some(r1));
        assert!(!commit.expires_at.is_infinity());

        let (commit, live) = b1.checkout("alice", None).unwrap();
        assert_eq!(x_of(&live), 2);
        assert_eq!(commit.revision, Some(r2));
        assert!(commit.is_live());
        assert_eq!(commit.name, "b1.alice");
    }
}

#[test]
fn linear_history_checks_out_every_revision() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);

        let mut revisions = Vec::new();
        let mut parent = None;
        for x in 0..10 {
            let commit = b1.commit("item", &mapper(x), parent.as_ref()).unwrap();
            parent = commit.revision.clone();
            revisions.push(commit.revision.unwrap());
        }

        assert_eq!(x_of(&b1.checkout("item", None).unwrap().1), 9);
        for (k, revision) in revisions.iter().enumerate() {
            let (_, mapper) = b1.checkout("item", Some(revision)).unwrap();
            assert_eq!(x_of(&mapper), k as i64);
        }

        let history = b1.history("item").unwrap();
        assert_eq!(history.len(), 10);
        for pair in history.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
            assert_eq!(pair[0].expires_at.timestamp(), Some(pair[1].created_at));
        }
        assert!(history[9].is_live());
    }
}

#[test]
fn fresh_chain_rejects_any_parent() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        let other = b1.commit("other", &mapper(1), None).unwrap().revision.unwrap();

        for parent in [Revision::new("deadbeef").unwrap(), other] {
            let err = b1.commit("alice", &mapper(1), Some(&parent)).unwrap_err();
            assert!(matches!(err, GeoStoreError::ParentRevisionNotFound { .. }));
        }
        assert!(b1.history("alice").unwrap_err().is_not_found());
    }
}

#[test]
fn remove_keeps_history_readable() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        let r1 = b1.commit("alice", &mapper(1), None).unwrap().revision.unwrap();

        let removed = b1.remove("alice", Some(&r1)).unwrap();
        assert_eq!(removed.revision, None);

        assert!(b1.checkout("alice", None).unwrap_err().is_not_found());
        assert!(b1.status("alice", None).unwrap_err().is_not_found());
        assert_eq!(x_of(&b1.checkout("alice", Some(&r1)).unwrap().1), 1);

        let err = b1.remove("alice", None).unwrap_err();
        assert!(matches!(err, GeoStoreError::FeatureNotFound { .. }));
    }
}

#[test]
fn remove_with_stale_parent_conflicts() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        let r1 = b1.commit("alice", &mapper(1), None).unwrap().revision.unwrap();
        b1.commit("alice", &mapper(2), Some(&r1)).unwrap();

        let err = b1.remove("alice", Some(&r1)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(x_of(&b1.checkout("alice", None).unwrap().1), 2);
    }
}

#[test]
fn commit_after_delete_starts_fresh_chain() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        let r1 = b1.commit("alice", &mapper(1), None).unwrap().revision.unwrap();
        b1.remove("alice", None).unwrap();

        let err = b1.commit("alice", &mapper(2), Some(&r1)).unwrap_err();
        assert!(matches!(err, GeoStoreError::ParentRevisionNotFound { .. }));

        let r2 = b1.commit("alice", &mapper(2), None).unwrap().revision.unwrap();
        assert_ne!(r1, r2);
        assert_eq!(x_of(&b1.checkout("alice", None).unwrap().1), 2);
        assert_eq!(b1.history("alice").unwrap().len(), 2);
    }
}

#[test]
fn parentless_commit_supersedes_live_revision() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        let r1 = b1.commit("alice", &mapper(1), None).unwrap().revision.unwrap();
        let r2 = b1.commit("alice", &mapper(2), None).unwrap().revision.unwrap();

        assert_eq!(b1.status("alice", None).unwrap().revision, Some(r2));
        assert!(!b1.status("alice", Some(&r1)).unwrap().is_live());
    }
}

#[test]
fn unknown_revision_is_not_found() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        b1.commit("alice", &mapper(1), None).unwrap();

        let err = b1.checkout("alice", Some(&Revision::new("cafe").unwrap())).unwrap_err();
        match err {
            GeoStoreError::FeatureNotFound { key, revision } => {
                assert_eq!(key, "b1.alice");
                assert_eq!(revision.as_deref(), Some("cafe"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn checkout_at_reads_point_in_time() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        let before = Utc::now();
        thread::sleep(Duration::from_millis(5));

        let r1 = b1.commit("alice", &mapper(1), None).unwrap().revision.unwrap();
        thread::sleep(Duration::from_millis(5));
        let between = Utc::now();
        thread::sleep(Duration::from_millis(5));

        b1.commit("alice", &mapper(2), Some(&r1)).unwrap();
        thread::sleep(Duration::from_millis(5));
        let after = Utc::now();
        thread::sleep(Duration::from_millis(5));
        b1.remove("alice", None).unwrap();

        assert!(b1.checkout_at("alice", &before).unwrap_err().is_not_found());
        assert_eq!(x_of(&b1.checkout_at("alice", &between).unwrap().1), 1);
        assert_eq!(x_of(&b1.checkout_at("alice", &after).unwrap().1), 2);
        assert!(b1.checkout_at("alice", &Utc::now()).unwrap_err().is_not_found());
    }
}

#[test]
fn names_lists_live_items_by_prefix() {
    for (factory, _temp) in backends() {
        let b1 = bucket(&factory);
        for name in ["roads.a1", "roads.a2", "rivers.nile", "roads.a3"] {
            b1.commit(name, &mapper(1), None).unwrap();
        }
        b1.remove("roads.a2", None).unwrap();

        assert_eq!(b1.names("roads.", None).unwrap(), vec!["roads.a1", "roads.a3"]);
        assert_eq!(b1.names("", Some(2)).unwrap().len(), 2);
        assert_eq!(b1.names("", None).unwrap().len(), 3);
    }
}

#[test]
fn expired_deadline_leaves_chain_unchanged() {
    let config = StorageConfig::default().with_operation_timeout(Duration::ZERO);
    let (fjall, _temp) = FjallStorage::temp_with(config.clone()).unwrap();
    let factories: Vec<Arc<dyn BucketFactory>> =
        vec![Arc::new(fjall), Arc::new(MemoryStorage::new(config))];

    for factory in factories {
        let b1 = bucket(&factory);
        let err = b1.commit("alice", &mapper(1), None).unwrap_err();
        assert!(matches!(err, GeoStoreError::DeadlineExceeded { .. }));
        assert!(b1.checkout("alice", None).unwrap_err().is_not_found());
        assert!(b1.history("alice").unwrap_err().is_not_found());
    }
}
