//! `RemoteStore` backed by the document server over a WebSocket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    ClientMessage, DocumentPath, RemoteStore, RemoteSubscription, RequestId, Result,
    ServerMessage, SyncError,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects lazily on first use and reconnects on the next request after the
/// socket drops. Subscriptions end when their connection does.
pub struct WsRemote {
    url: String,
    request_timeout: Duration,
    next_request: AtomicU64,
    link: tokio::sync::Mutex<Option<Link>>,
}

struct Link {
    conn: Arc<Connection>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Option<Value>>>>>,
    alive: AtomicBool,
}

impl Connection {
    fn send(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| SyncError::Network("connection closed".to_string()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Snapshot { path, document } => {
                // Unsubscribe is queued under the lock so it cannot overtake a
                // Subscribe for the same path.
                let mut subscribers = self.subscribers.lock();
                let Some(feeds) = subscribers.get_mut(&path) else {
                    return;
                };
                feeds.retain(|feed| feed.send(document.clone()).is_ok());
                if feeds.is_empty() {
                    subscribers.remove(&path);
                    debug!("No subscribers left for {}", path);
                    let _ = self.send(&ClientMessage::Unsubscribe { path });
                }
            }
            ServerMessage::Pong => debug!("Pong from document server"),
            other => match other.request_id() {
                Some(id) => {
                    if let Some(waiter) = self.pending.lock().remove(&id) {
                        let _ = waiter.send(other);
                    }
                }
                None => warn!("Document server error: {:?}", other),
            },
        }
    }

    fn add_subscriber(&self, path: &str, feed: mpsc::UnboundedSender<Option<Value>>) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        subscribers.entry(path.to_string()).or_default().push(feed);
        self.send(&ClientMessage::Subscribe {
            path: path.to_string(),
        })
    }

    /// Fails every waiter and closes every subscription.
    fn shut_down(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.pending.lock().clear();
        self.subscribers.lock().clear();
    }
}

impl WsRemote {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            next_request: AtomicU64::new(1),
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if existing.conn.is_alive() {
                return Ok(existing.conn.clone());
            }
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Unavailable(format!("connecting to {}: {}", self.url, e)))?;
        info!("Connected to document server {}", self.url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send to document server: {}", e);
                    break;
                }
            }
        });

        let reader_conn = conn.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => reader_conn.dispatch(msg),
                        Err(e) => warn!("Unreadable message from document server: {}", e),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = reader_conn.outbound.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Document server connection error: {}", e);
                        break;
                    }
                }
            }
            info!("Document server connection closed");
            reader_conn.shut_down();
        });

        *link = Some(Link {
            conn: conn.clone(),
            reader,
            writer,
        });
        Ok(conn)
    }

    async fn request(&self, build: impl FnOnce(RequestId) -> ClientMessage) -> Result<ServerMessage> {
        let conn = self.connection().await?;
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        conn.pending.lock().insert(id, tx);

        if let Err(e) = conn.send(&build(id)) {
            conn.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SyncError::Network(
                "connection closed before reply".to_string(),
            )),
            Err(_) => {
                conn.pending.lock().remove(&id);
                Err(SyncError::Network(format!("request {} timed out", id)))
            }
        }
    }
}

fn unexpected(reply: ServerMessage) -> SyncError {
    match reply {
        ServerMessage::Error { message, .. } => SyncError::Rejected(message),
        other => SyncError::Network(format!("unexpected reply: {:?}", other)),
    }
}

#[async_trait]
impl RemoteStore for WsRemote {
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>> {
        let path = path.as_str().to_string();
        match self
            .request(|request_id| ClientMessage::Read { request_id, path })
            .await?
        {
            ServerMessage::ReadResult { document, .. } => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, path: &DocumentPath, document: &Value) -> Result<()> {
        let path = path.as_str().to_string();
        let document = document.clone();
        match self
            .request(|request_id| ClientMessage::Write {
                request_id,
                path,
                document,
            })
            .await?
        {
            ServerMessage::WriteAck { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, path: &DocumentPath) -> Result<RemoteSubscription> {
        let conn = self.connection().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        conn.add_subscriber(path.as_str(), tx)?;
        debug!("Subscribed to {}", path);
        Ok(RemoteSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        let remote = WsRemote::new("ws://127.0.0.1:9").with_request_timeout(Duration::from_millis(200));
        let path = DocumentPath::from_raw("p");
        let err = remote.read(&path).await.unwrap_err();
        assert!(matches!(err, SyncError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    fn connection() -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            outbound,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        };
        (conn, rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn snapshot() -> ServerMessage {
        ServerMessage::Snapshot {
            path: "p".to_string(),
            document: None,
        }
    }

    #[test]
    fn unsubscribe_is_queued_before_a_later_subscribe() {
        let (conn, mut rx) = connection();
        let (gone, gone_rx) = mpsc::unbounded_channel();
        conn.add_subscriber("p", gone).unwrap();
        drop(gone_rx);

        conn.dispatch(snapshot());
        let (live, mut live_rx) = mpsc::unbounded_channel();
        conn.add_subscriber("p", live).unwrap();

        let path = "p".to_string();
        assert_eq!(
            sent(&mut rx),
            vec![
                ClientMessage::Subscribe { path: path.clone() },
                ClientMessage::Unsubscribe { path: path.clone() },
                ClientMessage::Subscribe { path },
            ]
        );

        conn.dispatch(snapshot());
        assert_eq!(live_rx.try_recv().unwrap(), None);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn error_replies_become_rejections() {
        let err = unexpected(ServerMessage::Error {
            request_id: Some(1),
            message: "denied".to_string(),
        });
        assert!(matches!(err, SyncError::Rejected(m) if m == "denied"));
    }
}
