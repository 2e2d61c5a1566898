//! Several sessions of one account sharing a remote must converge.
use ledger::{Document, EventKind, ManualClock, MILLIS_PER_HOUR};
use replica::{
    AccountId, InMemoryRemote, ResetConfirmation, SessionContext, SyncConfig, SyncSession,
};
use std::sync::Arc;
use std::time::Duration;
use store::MemoryKv;

async fn open_device(remote: &InMemoryRemote, clock: &ManualClock) -> SyncSession {
    let mut session = SyncSession::open(SessionContext {
        account: AccountId::new("shared"),
        kv: Arc::new(MemoryKv::new()),
        remote: Arc::new(remote.clone()),
        clock: Arc::new(clock.clone()),
        config: SyncConfig::default(),
    });
    session.pull().await.unwrap();
    session
}

fn timestamps(session: &SyncSession) -> Vec<i64> {
    session
        .current_state()
        .events
        .iter()
        .map(|e| e.timestamp)
        .collect()
}

fn remote_document(remote: &InMemoryRemote, session: &SyncSession) -> Document {
    Document::from_json_value(remote.document(session.path()).unwrap()).unwrap()
}

#[tokio::test]
async fn two_devices_converge_on_union() {
    let remote = InMemoryRemote::new();
    let clock_a = ManualClock::new(100 * MILLIS_PER_HOUR);
    let clock_b = ManualClock::new(100 * MILLIS_PER_HOUR + 500);

    let mut a = open_device(&remote, &clock_a).await;
    let mut b = open_device(&remote, &clock_b).await;

    a.log_event(EventKind::Normal).unwrap();
    a.push().await.unwrap();
    b.pull().await.unwrap();
    assert_eq!(timestamps(&b), timestamps(&a));

    clock_b.advance(60_000);
    b.log_event(EventKind::Override).unwrap();
    b.push().await.unwrap();
    a.pull().await.unwrap();

    assert_eq!(timestamps(&a).len(), 2);
    assert_eq!(a.current_state(), b.current_state());
    assert_eq!(remote_document(&remote, &a), *a.current_state());
}

#[tokio::test]
async fn offline_edits_merge_on_reconnect() {
    let remote = InMemoryRemote::new();
    let clock_a = ManualClock::new(50 * MILLIS_PER_HOUR);
    let clock_b = ManualClock::new(50 * MILLIS_PER_HOUR);
    let mut a = open_device(&remote, &clock_a).await;
    let mut b = open_device(&remote, &clock_b).await;

    remote.set_online(false);
    clock_a.advance(1_000);
    a.log_event(EventKind::Normal).unwrap();
    assert!(a.push().await.is_err());
    assert!(a.is_dirty());

    remote.set_online(true);
    clock_b.advance(2_000);
    b.log_event(EventKind::Normal).unwrap();
    b.push().await.unwrap();

    // A reads B's write, which lacks A's event, and must keep both.
    a.pull().await.unwrap();
    assert_eq!(timestamps(&a).len(), 2);
    assert!(!a.is_dirty());

    b.pull().await.unwrap();
    assert_eq!(timestamps(&b), timestamps(&a));
}

#[tokio::test]
async fn remote_reset_propagates() {
    let remote = InMemoryRemote::new();
    let clock = ManualClock::new(10 * MILLIS_PER_HOUR);
    let mut a = open_device(&remote, &clock).await;
    let mut b = open_device(&remote, &clock).await;

    a.log_event(EventKind::Normal).unwrap();
    a.push().await.unwrap();
    b.pull().await.unwrap();
    assert_eq!(timestamps(&b).len(), 1);

    clock.advance(10_000);
    let outcome = a.reset_all(ResetConfirmation::confirmed_by_user()).await;
    assert!(outcome.remote_confirmed);

    b.pull().await.unwrap();
    assert!(b.current_state().events.is_empty());
    assert!(remote_document(&remote, &b).events.is_empty());
}

#[tokio::test]
async fn recent_empty_remote_does_not_wipe_history() {
    let remote = InMemoryRemote::new();
    let clock = ManualClock::new(10 * MILLIS_PER_HOUR);
    let mut a = open_device(&remote, &clock).await;

    a.log_event(EventKind::Normal).unwrap();
    a.push().await.unwrap();

    // Another writer empties the log only 1s after our revision.
    let mut emptied = a.current_state().clone();
    emptied.events = Default::default();
    emptied.document_revision_time += 1_000;
    clock.advance(1_000);
    remote.put_raw(a.path(), Some(emptied.to_json_value().unwrap()));

    a.pull().await.unwrap();
    assert_eq!(timestamps(&a).len(), 1);
    assert_eq!(remote_document(&remote, &a).events.len(), 1);
}

#[tokio::test]
async fn subscription_delivers_other_devices_writes() {
    let remote = InMemoryRemote::new();
    let clock_a = ManualClock::new(20 * MILLIS_PER_HOUR);
    let clock_b = ManualClock::new(20 * MILLIS_PER_HOUR + 7);
    let mut a = open_device(&remote, &clock_a).await;
    let mut b = open_device(&remote, &clock_b).await;

    let mut feed = a.subscribe().await.unwrap();
    b.log_event(EventKind::Normal).unwrap();
    b.push().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while timestamps(&a).is_empty() {
            let snapshot = feed.recv().await.unwrap();
            a.apply_remote(snapshot).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(timestamps(&a), timestamps(&b));
}

#[tokio::test]
async fn history_wiped_by_a_false_reset_is_recoverable() {
    let remote = InMemoryRemote::new();
    let clock = ManualClock::new(10 * MILLIS_PER_HOUR);
    let mut a = open_device(&remote, &clock).await;
    let mut b = open_device(&remote, &clock).await;

    a.log_event(EventKind::Normal).unwrap();
    a.push().await.unwrap();
    b.pull().await.unwrap();

    remote.set_online(false);
    for _ in 0..2 {
        clock.advance(1_000);
        b.log_event(EventKind::Normal).unwrap();
    }
    assert!(b.push().await.is_err());
    remote.set_online(true);

    // A undoes down to an empty log well after B's last revision, which B
    // cannot tell apart from a reset.
    clock.advance(10_000);
    a.undo_last().unwrap();
    a.push().await.unwrap();
    b.pull().await.unwrap();
    assert!(b.current_state().events.is_empty());

    clock.advance(1_000);
    assert_eq!(b.restore_from_backup(), 3);
    b.push().await.unwrap();
    a.pull().await.unwrap();
    assert_eq!(timestamps(&a).len(), 3);
    assert_eq!(timestamps(&a), timestamps(&b));
}
