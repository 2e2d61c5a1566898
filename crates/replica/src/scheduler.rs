use ledger::{Document, EventKind, Settings};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    RemoteSnapshot, RemoteSubscription, ResetConfirmation, ResetOutcome, Result, SyncError,
    SyncSession,
};

/// Host lifecycle signals that trigger an immediate sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Backgrounded,
    Foregrounded,
    ConnectivityLost,
    ConnectivityRestored,
}

#[derive(Debug)]
pub enum SessionCommand {
    LogEvent(EventKind),
    UndoLast,
    SaveSettings(Settings),
    ResetAll {
        confirmation: ResetConfirmation,
        reply: oneshot::Sender<ResetOutcome>,
    },
    Lifecycle(LifecycleEvent),
}

/// Drives a `SyncSession` on its own task: applies commands, feeds remote
/// snapshots into reconciliation, ticks the metrics and pushes dirty state.
pub struct SyncScheduler {
    session: SyncSession,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    last_push: Instant,
    last_subscribe_attempt: Instant,
}

/// Front end of a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<Document>,
    task: JoinHandle<SyncSession>,
}

impl SchedulerHandle {
    pub fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| SyncError::Stopped)
    }

    pub fn log_event(&self, kind: EventKind) -> Result<()> {
        self.send(SessionCommand::LogEvent(kind))
    }

    pub fn undo_last(&self) -> Result<()> {
        self.send(SessionCommand::UndoLast)
    }

    pub fn save_settings(&self, settings: Settings) -> Result<()> {
        self.send(SessionCommand::SaveSettings(settings))
    }

    pub fn lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        self.send(SessionCommand::Lifecycle(event))
    }

    pub async fn reset_all(&self, confirmation: ResetConfirmation) -> Result<ResetOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ResetAll {
            confirmation,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Latest document; `changed()` resolves after every state change.
    pub fn state(&self) -> watch::Receiver<Document> {
        self.state.clone()
    }

    pub fn current_state(&self) -> Document {
        self.state.borrow().clone()
    }

    /// Stops the loop after pending commands and hands the session back.
    pub async fn shutdown(self) -> Result<SyncSession> {
        drop(self.commands);
        self.task
            .await
            .map_err(|e| SyncError::Storage(format!("scheduler task failed: {}", e)))
    }
}

impl SyncScheduler {
    pub fn spawn(mut session: SyncSession) -> SchedulerHandle {
        let (state_tx, state_rx) = watch::channel(session.current_state().clone());
        session.on_state_changed(move |doc| {
            state_tx.send_replace(doc.clone());
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let scheduler = Self {
            session,
            commands: rx,
            last_push: now,
            last_subscribe_attempt: now,
        };
        let task = tokio::spawn(scheduler.run());

        SchedulerHandle {
            commands: tx,
            state: state_rx,
            task,
        }
    }

    async fn run(mut self) -> SyncSession {
        info!("Sync scheduler started for {}", self.session.account());
        let config = self.session.config().clone();
        let mut ticker = tokio::time::interval(config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut subscription = self.resubscribe().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    let restored = matches!(
                        command,
                        SessionCommand::Lifecycle(LifecycleEvent::ConnectivityRestored)
                    );
                    self.handle_command(command).await;
                    if restored && subscription.is_none() {
                        subscription = self.resubscribe().await;
                    }
                }
                snapshot = next_snapshot(&mut subscription) => match snapshot {
                    Some(snapshot) => {
                        self.session.apply_remote(snapshot).await;
                    }
                    None => {
                        warn!("Remote subscription closed");
                        subscription = None;
                    }
                },
                _ = ticker.tick() => {
                    self.session.tick();
                    if self.session.is_dirty() && self.last_push.elapsed() >= config.push_interval() {
                        self.push().await;
                    }
                    if subscription.is_none()
                        && self.last_subscribe_attempt.elapsed() >= config.resubscribe_interval()
                    {
                        subscription = self.resubscribe().await;
                    }
                }
            }

            let stale = subscription
                .as_ref()
                .is_some_and(|s| s.epoch() != self.session.epoch());
            if stale {
                // Tear down before re-creating so no late delivery interleaves.
                drop(subscription.take());
                subscription = self.resubscribe().await;
            }
        }

        drop(subscription);
        if self.session.is_dirty() {
            self.push().await;
        }
        self.session.clear_listeners();
        info!("Sync scheduler stopped for {}", self.session.account());
        self.session
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::LogEvent(kind) => {
                if self.session.log_event(kind).is_some() {
                    self.push().await;
                }
            }
            SessionCommand::UndoLast => {
                if self.session.undo_last().is_some() {
                    self.push().await;
                }
            }
            SessionCommand::SaveSettings(settings) => {
                self.session.save_settings(settings);
                self.push().await;
            }
            SessionCommand::ResetAll {
                confirmation,
                reply,
            } => {
                let outcome = self.session.reset_all(confirmation).await;
                self.last_push = Instant::now();
                let _ = reply.send(outcome);
            }
            SessionCommand::Lifecycle(event) => {
                debug!("Lifecycle event: {:?}", event);
                match event {
                    LifecycleEvent::Backgrounded => {
                        if let Err(e) = self.session.force_push().await {
                            warn!("Push on background failed: {}", e);
                        }
                        self.last_push = Instant::now();
                    }
                    LifecycleEvent::Foregrounded | LifecycleEvent::ConnectivityRestored => {
                        if let Err(e) = self.session.pull().await {
                            warn!("Pull after {:?} failed: {}", event, e);
                        }
                        self.push().await;
                    }
                    LifecycleEvent::ConnectivityLost => {}
                }
            }
        }
    }

    async fn push(&mut self) {
        self.last_push = Instant::now();
        if let Err(e) = self.session.push().await {
            if e.is_retryable() {
                debug!("Push deferred: {}", e);
            } else {
                warn!("Push failed: {}", e);
            }
        }
    }

    async fn resubscribe(&mut self) -> Option<RemoteSubscription> {
        self.last_subscribe_attempt = Instant::now();
        match self.session.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Subscribe failed, retrying later: {}", e);
                None
            }
        }
    }
}

async fn next_snapshot(
    subscription: &mut Option<RemoteSubscription>,
) -> Option<RemoteSnapshot> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
