//! Recovery stories
//!
//! Connections drop, watch history gets compacted and user logic fails.
//! The operator keeps going and nothing is lost or handled twice.

use std::sync::Arc;
use std::time::Duration;

use tether::crd::{Workspace, WorkspaceSpec};
use tether::sink::Phase;
use tether::store::{MemoryStore, ObjectStore};

use super::helpers::*;

/// Story: A dropped watch connection resumes where it left off
///
/// Objects created while reconnecting are picked up; objects already
/// handled are not handed to the reconciler again.
#[tokio::test]
async fn story_dropped_connection_resumes_without_loss() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(operator(&store, Recorder::new(&journal), &sink).build().unwrap());

    store.create(&workspace("alpha")).await.unwrap();
    eventually("alpha reconciled", || journal.count("reconcile:alpha") == 1).await;

    store.disconnect_watches();
    store.create(&workspace("beta")).await.unwrap();
    eventually("beta reconciled", || journal.count("reconcile:beta") == 1).await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(journal.count("reconcile:alpha"), 1);
    assert_eq!(sink.count(&Phase::Watch), 0);
    running.stop().await;
}

/// Story: Watch history expired during an outage
///
/// While the operator could not watch, one object changed, one was deleted
/// and one was created, and the history was compacted. The relist after
/// the outage catches up on all three.
#[tokio::test]
async fn story_expired_history_is_recovered_by_relisting() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(operator(&store, Recorder::new(&journal), &sink).build().unwrap());

    store.create(&workspace("alpha")).await.unwrap();
    store.create(&workspace("beta")).await.unwrap();
    eventually("initial reconciles", || {
        journal.count("reconcile:alpha") == 1 && journal.count("reconcile:beta") == 1
    })
    .await;

    store.set_watch_outage(true);
    let mut alpha = store.get(&key("alpha")).await.unwrap();
    alpha.spec = WorkspaceSpec::new("bob");
    store.update(&alpha).await.unwrap();
    store.delete(&key("beta")).await.unwrap();
    store.create(&workspace("gamma")).await.unwrap();
    store.compact();
    eventually("outage reported", || sink.count(&Phase::Watch) >= 1).await;
    store.set_watch_outage(false);

    eventually("catch-up after relist", || {
        journal.count("reconcile:alpha") == 2
            && journal.count("deleted:beta") == 1
            && journal.count("reconcile:gamma") == 1
    })
    .await;
    assert!(sink.keys().iter().all(Option::is_none));
    running.stop().await;
}

/// Story: A failed reconcile is reported and retried on resync
#[tokio::test]
async fn story_failed_reconcile_is_retried_on_resync() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(
            &store,
            Recorder::new(&journal).attaching(&["first"]).failing(1),
            &sink,
        )
        .config(fast_config().resync_every(Duration::from_millis(100)))
        .finalizer("first", recording_finalizer("first", journal.clone()))
        .build()
        .unwrap(),
    );

    store.create(&workspace("alpha")).await.unwrap();
    wait_for_finalizers(&store, "alpha", &["first"]).await;

    assert_eq!(journal.count("reconcile:alpha"), 2);
    assert_eq!(sink.count(&Phase::Reconcile), 1);
    assert_eq!(sink.keys(), [Some(key("alpha"))]);
    running.stop().await;
}

/// Story: A burst of new objects is claimed exactly once each
///
/// Identities are spread across the worker pool; every one is reconciled
/// once and gets a single attach write.
#[tokio::test]
async fn story_many_objects_are_all_claimed() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(&store, Recorder::new(&journal).attaching(&["first"]), &sink)
            .finalizer("first", recording_finalizer("first", journal.clone()))
            .build()
            .unwrap(),
    );

    let names: Vec<String> = (0..20).map(|i| format!("ws-{i}")).collect();
    for name in &names {
        store.create(&workspace(name)).await.unwrap();
    }
    for name in &names {
        wait_for_finalizers(&store, name, &["first"]).await;
    }

    tokio::time::sleep(QUIET).await;
    for name in &names {
        assert_eq!(journal.count(&format!("reconcile:{name}")), 1);
    }
    assert_eq!(store.update_count(), names.len() as u64);
    running.stop().await;
}
