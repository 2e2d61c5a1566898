use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::{DocumentPath, Result, SyncError};

/// Document store shared by every session of an account. Documents travel as
/// raw JSON so a malformed remote can be detected and treated as absent.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>>;

    /// Full-document overwrite.
    async fn write(&self, path: &DocumentPath, document: &Value) -> Result<()>;

    /// Delivers the current value once, then every later change, including
    /// changes written by the subscriber itself.
    async fn subscribe(&self, path: &DocumentPath) -> Result<RemoteSubscription>;
}

/// One remote value as observed by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    /// Epoch of the subscription that delivered this snapshot.
    pub epoch: u64,
    pub value: Option<Value>,
}

/// Live feed of remote snapshots. Dropping it tears the feed down.
pub struct RemoteSubscription {
    rx: mpsc::UnboundedReceiver<Option<Value>>,
    forwarder: Option<JoinHandle<()>>,
    epoch: u64,
}

impl RemoteSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Option<Value>>) -> Self {
        Self {
            rx,
            forwarder: None,
            epoch: 0,
        }
    }

    /// Ties the lifetime of a background task to the subscription.
    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub(crate) fn tagged(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Next snapshot, or `None` once the remote side closed the feed.
    pub async fn recv(&mut self) -> Option<RemoteSnapshot> {
        let value = self.rx.recv().await?;
        Some(RemoteSnapshot {
            epoch: self.epoch,
            value,
        })
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Process-local remote used by tests, demos and offline runs.
#[derive(Clone)]
pub struct InMemoryRemote {
    inner: Arc<InMemoryInner>,
}

struct InMemoryInner {
    documents: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
    online: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryInner {
                documents: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// A remote that rejects every request until brought online.
    pub fn offline() -> Self {
        let remote = Self::new();
        remote.set_online(false);
        remote
    }

    /// Simulates connectivity. Existing subscriptions stay open.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Current value at `path`, ignoring connectivity.
    pub fn document(&self, path: &DocumentPath) -> Option<Value> {
        self.inner
            .documents
            .lock()
            .get(path.as_str())
            .and_then(|tx| tx.borrow().clone())
    }

    /// Writes as another party would, ignoring connectivity.
    pub fn put_raw(&self, path: &DocumentPath, value: Option<Value>) {
        let mut documents = self.inner.documents.lock();
        let tx = documents
            .entry(path.as_str().to_string())
            .or_insert_with(|| watch::channel(None).0);
        tx.send_replace(value);
    }

    /// Number of accepted `write` calls.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::Unavailable("remote is offline".to_string()))
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>> {
        self.ensure_online()?;
        Ok(self.document(path))
    }

    async fn write(&self, path: &DocumentPath, document: &Value) -> Result<()> {
        self.ensure_online()?;
        self.put_raw(path, Some(document.clone()));
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, path: &DocumentPath) -> Result<RemoteSubscription> {
        self.ensure_online()?;
        let mut watcher = {
            let mut documents = self.inner.documents.lock();
            documents
                .entry(path.as_str().to_string())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let initial = watcher.borrow_and_update().clone();
        let _ = tx.send(initial);

        let forwarder = tokio::spawn(async move {
            while watcher.changed().await.is_ok() {
                let value = watcher.borrow_and_update().clone();
                if tx.send(value).is_err() {
                    break;
                }
            }
        });

        Ok(RemoteSubscription::new(rx).with_forwarder(forwarder))
    }
}
