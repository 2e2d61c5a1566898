use anyhow::{Context, Result};
use replica::ServerMessage;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};
use uuid::Uuid;

pub type Tx = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// One JSON document per path plus the connections watching each path.
pub struct DocumentTable {
    documents: BTreeMap<String, Value>,
    subscribers: HashMap<String, HashMap<ConnectionId, Tx>>,
    data_file: Option<PathBuf>,
}

impl DocumentTable {
    pub fn in_memory() -> Self {
        Self {
            documents: BTreeMap::new(),
            subscribers: HashMap::new(),
            data_file: None,
        }
    }

    /// Opens the table, reading `data_file` if it exists. Every accepted
    /// write is flushed back to it.
    pub fn load(data_file: Option<PathBuf>) -> Result<Self> {
        let mut table = Self::in_memory();
        if let Some(path) = &data_file {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                table.documents = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?;
                info!("Loaded {} documents from {:?}", table.documents.len(), path);
            }
        }
        table.data_file = data_file;
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.documents.get(path).cloned()
    }

    /// Replaces the whole document at `path`. The new value is persisted
    /// before it becomes visible.
    pub fn put(&mut self, path: &str, document: Value) -> Result<()> {
        if !document.is_object() {
            anyhow::bail!("document must be a JSON object");
        }
        if let Some(data_file) = &self.data_file {
            let mut next = self.documents.clone();
            next.insert(path.to_string(), document.clone());
            persist(data_file, &next)?;
        }
        self.documents.insert(path.to_string(), document);
        Ok(())
    }

    pub fn subscribe(&mut self, path: &str, conn: ConnectionId, tx: Tx) {
        self.subscribers
            .entry(path.to_string())
            .or_default()
            .insert(conn, tx);
    }

    pub fn unsubscribe(&mut self, path: &str, conn: ConnectionId) {
        if let Some(watchers) = self.subscribers.get_mut(path) {
            watchers.remove(&conn);
            if watchers.is_empty() {
                self.subscribers.remove(path);
            }
        }
    }

    pub fn drop_connection(&mut self, conn: ConnectionId) {
        self.subscribers.retain(|_, watchers| {
            watchers.remove(&conn);
            !watchers.is_empty()
        });
    }

    /// Sends the current value of `path` to every subscriber, the writer
    /// included.
    pub fn broadcast(&self, path: &str) {
        let Some(watchers) = self.subscribers.get(path) else {
            return;
        };
        let msg = ServerMessage::Snapshot {
            path: path.to_string(),
            document: self.get(path),
        };
        let json = match serde_json::to_string(&msg) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize snapshot: {}", e);
                return;
            }
        };
        for (conn, tx) in watchers {
            if tx.send(Message::Text(json.clone())).is_err() {
                debug!("Subscriber {} already gone", conn.0);
            }
        }
    }
}

fn persist(data_file: &Path, documents: &BTreeMap<String, Value>) -> Result<()> {
    if let Some(dir) = data_file.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = data_file.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(documents)?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, data_file)
        .with_context(|| format!("replacing {}", data_file.display()))?;
    Ok(())
}
