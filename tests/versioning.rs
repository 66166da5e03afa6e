//! Template versioning under concurrent writers, on a file-backed store.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use docforge_core::{DataStore, DocforgeError, SqliteStore, TemplateRepository};

fn empty() -> BTreeSet<String> {
    BTreeSet::new()
}

#[test]
fn concurrent_writers_on_same_base_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DataStore> = Arc::new(
        SqliteStore::open("primary", &dir.path().join("primary.db"), Duration::from_secs(5)).unwrap(),
    );
    TemplateRepository::new(store.clone())
        .create_template("schema-doc", "Schema", "schema-doc", "# v1", empty())
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["# v2 from alice", "# v2 from bob"]
        .into_iter()
        .map(|body| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let repo = TemplateRepository::new(store);
                barrier.wait();
                repo.create_version_from(1, "schema-doc", body, empty())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let conflict = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(
        conflict,
        DocforgeError::ConcurrentVersionConflict { expected: 1, found: 2, .. }
    ));
    assert!(conflict.is_retryable());

    let repo = TemplateRepository::new(store);
    assert_eq!(repo.history("schema-doc").unwrap().len(), 2);

    // The loser retries from the new base.
    let v3 = repo.create_version("schema-doc", "# v3", empty()).unwrap();
    assert_eq!(v3.version, 3);
}

#[test]
fn versions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("primary.db");
    {
        let store: Arc<dyn DataStore> =
            Arc::new(SqliteStore::open("primary", &path, Duration::from_secs(1)).unwrap());
        let repo = TemplateRepository::new(store);
        repo.create_template("t", "T", "c", "# one", empty()).unwrap();
        repo.create_version("t", "# two", empty()).unwrap();
        repo.deactivate("t", 2).unwrap();
    }
    let store: Arc<dyn DataStore> =
        Arc::new(SqliteStore::open("primary", &path, Duration::from_secs(1)).unwrap());
    let repo = TemplateRepository::new(store);
    assert_eq!(repo.get_active("t").unwrap().body, "# one");
    let history: Vec<_> = repo.history("t").unwrap().iter().map(|t| (t.version, t.active)).collect();
    assert_eq!(history, vec![(1, true), (2, false)]);
}
