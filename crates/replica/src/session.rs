use biocore::{compute_state, daily_stats, BioState, DailyStats};
use ledger::{
    start_of_local_day, Clock, Document, EpochMillis, EventKind, EventLog, LoggedEvent, Settings,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use store::{BackupGuard, CacheKeys, KeyValueStore, LocalCache};
use tracing::{debug, info, warn};

use crate::{
    reconcile, AccountId, DocumentPath, RemoteSnapshot, RemoteStore, RemoteSubscription,
    ResetSource, Result, SessionId, SyncConfig,
};

pub type StateListener = Box<dyn Fn(&Document) + Send + Sync>;

/// How many of this session's own pushes are remembered to recognize their
/// echoes on the subscription.
const OWN_PUSH_HISTORY: usize = 16;

/// Proof that the user confirmed a destructive reset.
#[derive(Debug)]
pub struct ResetConfirmation(());

impl ResetConfirmation {
    pub fn confirmed_by_user() -> Self {
        Self(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    /// The wipe reached the remote. When false it stays pending locally and
    /// wins the next reconciliation.
    pub remote_confirmed: bool,
}

/// Everything the session needs from its host.
pub struct SessionContext {
    pub account: AccountId,
    pub kv: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

/// One signed-in account on one device.
///
/// Owns the authoritative in-memory document. Every mutation goes through
/// here: it is persisted to the local cache before listeners hear about it,
/// and marked dirty until a push succeeds.
pub struct SyncSession {
    id: SessionId,
    account: AccountId,
    path: DocumentPath,
    document: Document,
    cache: LocalCache,
    backup: BackupGuard,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    dirty: bool,
    epoch: u64,
    own_pushes: VecDeque<Value>,
    listeners: Vec<StateListener>,
}

impl SyncSession {
    /// Loads the cached document, falling back to a recent backup and then to
    /// defaults. Never touches the network.
    pub fn open(ctx: SessionContext) -> Self {
        let SessionContext {
            account,
            kv,
            remote,
            clock,
            config,
        } = ctx;

        let keys = CacheKeys::for_account(&config.app_id, account.as_str());
        let cache = LocalCache::new(kv.clone(), &keys);
        let backup = BackupGuard::new(kv, &keys).with_staleness(config.backup_staleness_ms);
        let path = DocumentPath::for_account(&config.app_id, &account);
        let now = clock.now_millis();

        let (mut document, persist) = match cache.load() {
            Some(document) => (document, false),
            None => {
                let fresh = Document::new_default(now).with_owner(account.as_str());
                match backup.load() {
                    Some(snapshot) if backup.should_restore(&fresh, &snapshot, now) => {
                        warn!(
                            "Local cache missing for {}; restoring {} events from backup",
                            account,
                            snapshot.document.events.len()
                        );
                        (backup.restore(snapshot), true)
                    }
                    _ => (fresh, true),
                }
            }
        };
        if persist {
            if let Err(e) = cache.save(&mut document, false, now) {
                warn!("Failed to persist initial document: {:#}", e);
            }
        }

        let id = SessionId::new();
        info!(
            "Opened session {} for {} ({} events)",
            id,
            account,
            document.events.len()
        );

        Self {
            id,
            account,
            path,
            document,
            cache,
            backup,
            remote,
            clock,
            config,
            dirty: false,
            epoch: 0,
            own_pushes: VecDeque::new(),
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn now(&self) -> EpochMillis {
        self.clock.now_millis()
    }

    pub fn current_state(&self) -> &Document {
        &self.document
    }

    /// Local changes not yet confirmed by the remote.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Epoch of the live subscription. Snapshots from older epochs are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn on_state_changed(&mut self, listener: impl Fn(&Document) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    pub fn derive_metrics(&self, now: EpochMillis) -> BioState {
        compute_state(
            &self.document.events,
            self.document.profile.profile_start_time,
            now,
            &self.config.biocore,
        )
    }

    pub fn daily_stats(&self, now: EpochMillis) -> DailyStats {
        daily_stats(&self.document, start_of_local_day(now), now)
    }

    /// Appends an event stamped with the current time. Returns `None` when an
    /// event already exists at that instant.
    pub fn log_event(&mut self, kind: EventKind) -> Option<LoggedEvent> {
        let now = self.now();
        let event = LoggedEvent::new(now, kind);
        if !self.document.events.append(event) {
            debug!("Dropped {} event colliding at {}", kind, now);
            return None;
        }
        self.commit(now);
        info!("Logged {} event at {}", kind, now);
        Some(event)
    }

    /// Removes the most recent event. A no-op on an empty log.
    pub fn undo_last(&mut self) -> Option<LoggedEvent> {
        let removed = self.document.events.remove_last()?;
        let now = self.now();
        self.commit(now);
        info!("Undid event at {}", removed.timestamp);
        Some(removed)
    }

    pub fn save_settings(&mut self, settings: Settings) {
        let now = self.now();
        let mut settings = settings.sanitized();
        settings.settings_revision_time = now;
        self.document.settings = settings;
        self.commit(now);
        info!("Saved settings at {}", now);
    }

    /// Parses `raw` and imports it. Undated legacy documents keep this
    /// profile's start.
    pub fn import_json(&mut self, raw: &str) -> Result<usize> {
        let start = self.document.profile.profile_start_time;
        let imported = Document::from_json_str_with_start(raw, start)?;
        Ok(self.import_document(imported))
    }

    /// Folds an exported or legacy document into this one: events are unioned,
    /// the imported settings are adopted and the earlier profile start is kept.
    /// Returns how many events were new.
    pub fn import_document(&mut self, imported: Document) -> usize {
        let now = self.now();
        let before = self.document.events.len();
        self.document.events = EventLog::union(&self.document.events, &imported.events);

        let mut settings = imported.settings.sanitized();
        settings.settings_revision_time = now;
        self.document.settings = settings;

        let profile = &mut self.document.profile;
        profile.profile_start_time = profile
            .profile_start_time
            .min(imported.profile.profile_start_time);
        profile.record_abstention(imported.profile.longest_abstention_hours);

        let added = self.document.events.len() - before;
        self.commit(now);
        info!("Imported document ({} new events)", added);
        added
    }

    /// Unions the Backup Guard snapshot back into the document as a new user
    /// mutation, so it beats the merge that discarded those events. Returns
    /// how many events came back.
    pub fn restore_from_backup(&mut self) -> usize {
        let Some(backup) = self.backup.load() else {
            return 0;
        };
        let restored = self.backup.restore(backup);
        let before = self.document.events.len();
        self.document.events = EventLog::union(&self.document.events, &restored.events);
        let added = self.document.events.len() - before;
        if added > 0 {
            let now = self.now();
            self.commit(now);
            warn!("Restored {} events from backup", added);
        }
        added
    }

    /// Replaces the document with a fresh one and overwrites the remote. The
    /// current subscription's epoch is retired, so snapshots it delivers
    /// afterwards are ignored until the caller resubscribes.
    pub async fn reset_all(&mut self, _confirmation: ResetConfirmation) -> ResetOutcome {
        let now = self.now();
        let owner = self.document.profile.owner_id.clone();
        let discarded = self.document.events.len();
        self.document = Document::reset_at(now, owner);
        self.epoch += 1;

        if let Err(e) = self.backup.clear() {
            warn!("Failed to clear backup during reset: {:#}", e);
        }
        if let Err(e) = self.cache.save(&mut self.document, false, now) {
            warn!("Failed to persist reset document: {:#}", e);
        }
        self.dirty = true;
        self.notify();
        warn!("Reset {} ({} events discarded)", self.account, discarded);

        match self.push().await {
            Ok(()) => ResetOutcome {
                remote_confirmed: true,
            },
            Err(e) => {
                warn!("Reset not yet confirmed by remote: {}", e);
                ResetOutcome {
                    remote_confirmed: false,
                }
            }
        }
    }

    /// Opens a fresh subscription under a new epoch.
    pub async fn subscribe(&mut self) -> Result<RemoteSubscription> {
        self.epoch += 1;
        let subscription = self.remote.subscribe(&self.path).await?;
        debug!("Subscribed to {} (epoch {})", self.path, self.epoch);
        Ok(subscription.tagged(self.epoch))
    }

    /// Reconciles a snapshot from the live subscription. Returns false when
    /// the snapshot was ignored: it came from a retired epoch or it is one of
    /// this session's own earlier pushes, which carries nothing new.
    pub async fn apply_remote(&mut self, snapshot: RemoteSnapshot) -> bool {
        if snapshot.epoch != self.epoch {
            debug!(
                "Ignoring snapshot from epoch {} (current {})",
                snapshot.epoch, self.epoch
            );
            return false;
        }
        if let Some(value) = &snapshot.value {
            if self.own_pushes.contains(value) {
                debug!("Ignoring echo of an earlier push");
                return false;
            }
        }
        let remote = decode_remote(snapshot.value);
        self.reconcile_with(remote).await;
        true
    }

    /// One-shot read of the remote followed by reconciliation.
    pub async fn pull(&mut self) -> Result<()> {
        let value = self.remote.read(&self.path).await?;
        self.reconcile_with(decode_remote(value)).await;
        Ok(())
    }

    /// Writes the document to the remote if it has unpushed changes. On
    /// failure the document stays dirty for the next attempt.
    pub async fn push(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let value = self.document.to_json_value()?;
        self.remote.write(&self.path, &value).await?;
        self.dirty = false;
        if self.own_pushes.len() == OWN_PUSH_HISTORY {
            self.own_pushes.pop_front();
        }
        self.own_pushes.push_back(value);
        debug!(
            "Pushed revision {} ({} events)",
            self.document.document_revision_time,
            self.document.events.len()
        );
        Ok(())
    }

    /// Marks the document dirty and pushes it.
    pub async fn force_push(&mut self) -> Result<()> {
        self.dirty = true;
        self.push().await
    }

    /// Periodic recompute. Raises the longest-abstention record when the
    /// replay exceeds it; that write is not user intent and does not bump the
    /// revision.
    pub fn tick(&mut self) -> BioState {
        let now = self.now();
        let state = self.derive_metrics(now);
        if self
            .document
            .profile
            .record_abstention(state.longest_abstention_hours())
        {
            if let Err(e) = self.cache.save(&mut self.document, false, now) {
                warn!("Failed to persist abstention record: {:#}", e);
            }
            self.dirty = true;
            self.notify();
        }
        state
    }

    async fn reconcile_with(&mut self, remote: Option<Document>) {
        let now = self.now();
        if let Err(e) = self.backup.snapshot(&self.document, now) {
            warn!("Failed to snapshot before reconcile: {:#}", e);
        }

        let outcome = reconcile(
            Some(&self.document),
            remote.as_ref(),
            now,
            &self.config.reconcile,
        );
        let mut merged = outcome.document;
        let mut push = outcome.push_remote;

        match outcome.reset {
            Some(ResetSource::Remote) => warn!(
                "Honoring remote reset of {}; discarding {} local events (backup kept)",
                self.account,
                self.document.events.len()
            ),
            Some(ResetSource::LocalPending) => info!("Local reset still pending; keeping the wipe"),
            None => {}
        }
        if self.guard_merge(&mut merged, now) {
            push = true;
        }

        if merged != self.document {
            self.document = merged;
            if let Err(e) = self.cache.save(&mut self.document, false, now) {
                warn!("Failed to persist merged document: {:#}", e);
            }
            self.notify();
        }

        if push {
            self.dirty = true;
            if let Err(e) = self.push().await {
                warn!("Push after reconcile failed: {}", e);
            }
        }
    }

    /// Backup Guard pass over a merge result. When the snapshot holds more
    /// events than `merged`, the missing ones stamped after the merged
    /// revision minus the skew tolerance are put back: whoever produced that
    /// revision cannot have seen them. Older ones stay in the snapshot for
    /// [`SyncSession::restore_from_backup`].
    fn guard_merge(&self, merged: &mut Document, now: EpochMillis) -> bool {
        let Some(backup) = self.backup.load() else {
            return false;
        };
        if !self.backup.should_restore(merged, &backup, now) {
            return false;
        }
        let cutoff = merged
            .document_revision_time
            .saturating_sub(self.config.reconcile.reset_skew_tolerance_ms);
        let restored = self.backup.restore(backup);
        let unseen = EventLog::from_events(
            restored
                .events
                .iter()
                .copied()
                .filter(|e| e.timestamp > cutoff && !merged.events.contains(e.timestamp)),
        );
        if unseen.is_empty() {
            debug!(
                "Backup holds {} events older than revision {}; kept for recovery",
                restored.events.len(),
                merged.document_revision_time
            );
            return false;
        }
        warn!(
            "Merge dropped {} events newer than revision {}; restoring them from backup",
            unseen.len(),
            merged.document_revision_time
        );
        merged.events = EventLog::union(&merged.events, &unseen);
        true
    }

    /// Persists a user mutation and refreshes the backup to match it.
    fn commit(&mut self, now: EpochMillis) {
        if let Err(e) = self.cache.save(&mut self.document, true, now) {
            warn!("Failed to persist document: {:#}", e);
        }
        self.dirty = true;

        let backup = if self.document.events.is_empty() {
            self.backup.clear()
        } else {
            self.backup.snapshot(&self.document, now).map(|_| ())
        };
        if let Err(e) = backup {
            warn!("Failed to refresh backup: {:#}", e);
        }

        self.notify();
    }

    fn notify(&self) {
        for listener in &self.listeners {
            listener(&self.document);
        }
    }
}

/// Malformed remote documents count as absent.
fn decode_remote(value: Option<Value>) -> Option<Document> {
    match Document::from_json_value(value?) {
        Ok(document) => Some(document),
        Err(e) => {
            warn!("Ignoring malformed remote document: {}", e);
            None
        }
    }
}
