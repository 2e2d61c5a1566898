//! Document server: one JSON document per path, full-document writes and push
//! subscriptions over WebSocket.

mod documents;

use documents::{ConnectionId, DocumentTable, Tx};
use futures_util::{SinkExt, StreamExt};
use replica::{ClientMessage, ServerMessage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type SharedTable = Arc<RwLock<DocumentTable>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("doc_server=info,replica=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = std::env::var("DOC_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let data_file = std::env::var_os("DOC_SERVER_DATA").map(PathBuf::from);
    let table: SharedTable = Arc::new(RwLock::new(DocumentTable::load(data_file)?));

    let listener = TcpListener::bind(&addr).await?;
    info!("Document server listening on: {}", addr);

    serve(listener, table).await;
    Ok(())
}

async fn serve(listener: TcpListener, table: SharedTable) {
    while let Ok((stream, addr)) = listener.accept().await {
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, table.clone()));
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, table: SharedTable) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let conn = ConnectionId::new();
    info!("Client {} connected from {}", conn.0, addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving message from {}: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_client_message(&text, &table, &tx, conn).await {
                    warn!("Bad message from {}: {}", addr, e);
                    reply(
                        &tx,
                        &ServerMessage::Error {
                            request_id: None,
                            message: e.to_string(),
                        },
                    );
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    table.write().await.drop_connection(conn);
    send_task.abort();
    info!("Client {} disconnected", conn.0);
}

async fn handle_client_message(
    text: &str,
    table: &SharedTable,
    tx: &Tx,
    conn: ConnectionId,
) -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(text)?;

    match msg {
        ClientMessage::Read { request_id, path } => {
            let document = table.read().await.get(&path);
            reply(
                tx,
                &ServerMessage::ReadResult {
                    request_id,
                    document,
                },
            );
        }

        ClientMessage::Write {
            request_id,
            path,
            document,
        } => {
            let mut table = table.write().await;
            match table.put(&path, document) {
                Ok(()) => {
                    debug!("Stored {}", path);
                    reply(tx, &ServerMessage::WriteAck { request_id });
                    table.broadcast(&path);
                }
                Err(e) => {
                    warn!("Rejected write to {}: {:#}", path, e);
                    reply(
                        tx,
                        &ServerMessage::Error {
                            request_id: Some(request_id),
                            message: format!("{:#}", e),
                        },
                    );
                }
            }
        }

        ClientMessage::Subscribe { path } => {
            let mut table = table.write().await;
            table.subscribe(&path, conn, tx.clone());
            let document = table.get(&path);
            reply(tx, &ServerMessage::Snapshot { path, document });
        }

        ClientMessage::Unsubscribe { path } => {
            table.write().await.unsubscribe(&path, conn);
        }

        ClientMessage::Ping => reply(tx, &ServerMessage::Pong),
    }

    Ok(())
}

fn reply(tx: &Tx, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!("Failed to serialize message: {}", e),
    }
}
