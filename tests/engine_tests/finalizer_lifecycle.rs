//! Finalizer lifecycle stories
//!
//! A user creates a Workspace, the operator claims it with its finalizers,
//! and when the user deletes it every finalizer runs once, in registration
//! order, before the object is allowed to disappear.

use std::sync::Arc;

use kube::ResourceExt;
use tether::crd::Workspace;
use tether::finalizer::{finalizer_fn, Finalizer};
use tether::object::ObjectKey;
use tether::sink::Phase;
use tether::store::{MemoryStore, ObjectStore};
use tether::Error;

use super::helpers::*;

/// Story: One finalizer, from creation to removal
///
/// The reconciler attaches "first". Deleting the workspace runs the
/// "first" cleanup, then the object is removed and `deleted` fires once.
#[tokio::test]
async fn story_single_finalizer_is_attached_then_drained() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(&store, Recorder::new(&journal).attaching(&["first"]), &sink)
            .finalizer("first", recording_finalizer("first", journal.clone()))
            .build()
            .unwrap(),
    );

    store.create(&workspace("alpha")).await.unwrap();
    wait_for_finalizers(&store, "alpha", &["first"]).await;

    store.delete(&key("alpha")).await.unwrap();
    wait_for_removal(&store, "alpha").await;
    eventually("deleted callback", || journal.count("deleted:alpha") == 1).await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(
        journal.entries(),
        ["reconcile:alpha", "finalize:first:alpha", "deleted:alpha"]
    );
    assert_eq!(sink.count(&Phase::Reconcile), 0);
    running.stop().await;
}

/// Story: Two finalizers drain in the order they were registered
///
/// The reconciler attaches them in the opposite order; they still land on
/// the object in registration order, one write each, and drain that way.
#[tokio::test]
async fn story_finalizers_drain_in_registration_order() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(
            &store,
            Recorder::new(&journal).attaching(&["second", "first"]),
            &sink,
        )
        .finalizer("first", recording_finalizer("first", journal.clone()))
        .finalizer("second", recording_finalizer("second", journal.clone()))
        .build()
        .unwrap(),
    );

    store.create(&workspace("alpha")).await.unwrap();
    wait_for_finalizers(&store, "alpha", &["first", "second"]).await;
    assert_eq!(store.update_count(), 2);

    store.delete(&key("alpha")).await.unwrap();
    wait_for_removal(&store, "alpha").await;
    eventually("deleted callback", || journal.count("deleted:alpha") == 1).await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(
        journal.entries(),
        [
            "reconcile:alpha",
            "finalize:first:alpha",
            "finalize:second:alpha",
            "deleted:alpha"
        ]
    );
    running.stop().await;
}

/// Story: Finalizers owned by someone else are never touched
///
/// Another controller guards the workspace with its own finalizer. Our
/// finalizer drains, the guard stays, and the object waits for its owner.
#[tokio::test]
async fn story_foreign_finalizer_is_left_alone() {
    const GUARD: &str = "backup.vendor.io/guard";

    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(&store, Recorder::new(&journal).attaching(&["first"]), &sink)
            .finalizer("first", recording_finalizer("first", journal.clone()))
            .build()
            .unwrap(),
    );

    let mut guarded = workspace("alpha");
    guarded.metadata.finalizers = Some(vec![GUARD.to_string()]);
    store.create(&guarded).await.unwrap();
    wait_for_finalizers(&store, "alpha", &[GUARD, "first"]).await;

    store.delete(&key("alpha")).await.unwrap();
    wait_for_finalizers(&store, "alpha", &[GUARD]).await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(finalizers_of(&store, "alpha").await, [GUARD]);
    assert_eq!(journal.count("deleted:alpha"), 0);

    // The other controller finishes its work
    let mut released = store.get(&key("alpha")).await.unwrap();
    released.metadata.finalizers = Some(vec![]);
    store.update(&released).await.unwrap();

    wait_for_removal(&store, "alpha").await;
    eventually("deleted callback", || journal.count("deleted:alpha") == 1).await;
    assert_eq!(journal.count("finalize:first:alpha"), 1);
    running.stop().await;
}

/// Finalizer that journals its run, then has someone else label the object
///
/// The label lands while the drain is in flight, so the removal write that
/// follows conflicts and the labelled version is already queued behind it.
fn labelling_finalizer(
    id: &'static str,
    store: Arc<MemoryStore<Workspace>>,
    journal: Journal,
) -> impl Finalizer<Workspace> {
    finalizer_fn(move |ws: Workspace| {
        let store = store.clone();
        let journal = journal.clone();
        async move {
            journal.record(format!("finalize:{id}:{}", ws.name_any()));
            let mut current = store.get(&ObjectKey::of(&ws)).await?;
            if !current.labels().contains_key("team") {
                current
                    .labels_mut()
                    .insert("team".to_string(), "storage".to_string());
                store.update(&current).await?;
            }
            Ok::<_, Error>(())
        }
    })
}

/// Story: Someone edits the workspace while it is being torn down
///
/// A label edit lands between the deletion mark and the removal of the
/// first finalizer. The removal is re-applied on top of the edit, the
/// edit's own presentation is recognized as already drained, and every
/// finalizer still runs exactly once.
#[tokio::test]
async fn story_edit_during_deletion_runs_each_finalizer_once() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(
            &store,
            Recorder::new(&journal).attaching(&["first", "second"]),
            &sink,
        )
        .finalizer(
            "first",
            labelling_finalizer("first", store.clone(), journal.clone()),
        )
        .finalizer("second", recording_finalizer("second", journal.clone()))
        .build()
        .unwrap(),
    );

    store.create(&workspace("alpha")).await.unwrap();
    wait_for_finalizers(&store, "alpha", &["first", "second"]).await;

    store.delete(&key("alpha")).await.unwrap();
    wait_for_removal(&store, "alpha").await;
    eventually("deleted callback", || journal.count("deleted:alpha") == 1).await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(
        journal.entries(),
        [
            "reconcile:alpha",
            "finalize:first:alpha",
            "finalize:second:alpha",
            "deleted:alpha"
        ]
    );
    assert_eq!(sink.count(&Phase::Finalize("first".to_string())), 0);
    assert_eq!(sink.count(&Phase::Finalize("second".to_string())), 0);
    running.stop().await;
}

/// Story: A failing finalizer is retried, and the object outlives it
///
/// The cleanup fails twice. Each failure is reported with the finalizer's
/// phase, the object stays, and resync retries until cleanup succeeds.
#[tokio::test]
async fn story_failing_finalizer_is_retried_until_it_succeeds() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(&store, Recorder::new(&journal).attaching(&["first"]), &sink)
            .config(fast_config().resync_every(std::time::Duration::from_millis(100)))
            .finalizer("first", flaky_finalizer("first", journal.clone(), 2))
            .build()
            .unwrap(),
    );

    store.create(&workspace("alpha")).await.unwrap();
    wait_for_finalizers(&store, "alpha", &["first"]).await;

    store.delete(&key("alpha")).await.unwrap();
    eventually("first failure", || journal.count("failed:first:alpha") == 1).await;
    assert_eq!(finalizers_of(&store, "alpha").await, ["first"]);
    assert_eq!(journal.count("deleted:alpha"), 0);

    wait_for_removal(&store, "alpha").await;
    eventually("deleted callback", || journal.count("deleted:alpha") == 1).await;

    tokio::time::sleep(QUIET).await;
    assert_eq!(
        journal.entries(),
        [
            "reconcile:alpha",
            "failed:first:alpha",
            "failed:first:alpha",
            "finalize:first:alpha",
            "deleted:alpha"
        ]
    );
    assert_eq!(sink.count(&Phase::Finalize("first".to_string())), 2);
    running.stop().await;
}

/// Story: An operator restarted mid-deletion picks up where it left off
///
/// The workspace was already marked for deletion while no operator ran.
/// On start it is drained without ever being reconciled.
#[tokio::test]
async fn story_restart_resumes_pending_deletion() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let mut claimed = workspace("alpha");
    claimed.metadata.finalizers = Some(vec!["first".to_string(), "second".to_string()]);
    store.create(&claimed).await.unwrap();
    store.delete(&key("alpha")).await.unwrap();
    assert!(store
        .get(&key("alpha"))
        .await
        .unwrap()
        .metadata
        .deletion_timestamp
        .is_some());

    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(&store, Recorder::new(&journal).attaching(&["first", "second"]), &sink)
            .finalizer("first", recording_finalizer("first", journal.clone()))
            .finalizer("second", recording_finalizer("second", journal.clone()))
            .build()
            .unwrap(),
    );

    wait_for_removal(&store, "alpha").await;
    eventually("deleted callback", || journal.count("deleted:alpha") == 1).await;
    assert_eq!(
        journal.entries(),
        ["finalize:first:alpha", "finalize:second:alpha", "deleted:alpha"]
    );
    running.stop().await;
}

/// Story: A deletion marker without any finalizer we own is not ours to drain
#[tokio::test]
async fn story_unclaimed_deleting_object_is_never_reconciled() {
    let store = Arc::new(MemoryStore::<Workspace>::new());
    let mut held = workspace("alpha");
    held.metadata.finalizers = Some(vec!["backup.vendor.io/guard".to_string()]);
    store.create(&held).await.unwrap();
    store.delete(&key("alpha")).await.unwrap();

    let journal = Journal::default();
    let sink = Arc::new(CollectingSink::default());
    let running = start(
        operator(&store, Recorder::new(&journal).attaching(&["first"]), &sink)
            .finalizer("first", recording_finalizer("first", journal.clone()))
            .build()
            .unwrap(),
    );

    tokio::time::sleep(QUIET).await;
    assert!(journal.entries().is_empty());
    assert_eq!(finalizers_of(&store, "alpha").await, ["backup.vendor.io/guard"]);
    running.stop().await;
}
