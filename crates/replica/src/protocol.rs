//! Wire protocol between `WsRemote` and the document server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RequestId = u64;

/// Messages sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "read")]
    Read { request_id: RequestId, path: String },

    #[serde(rename = "write")]
    Write {
        request_id: RequestId,
        path: String,
        document: Value,
    },

    /// The server answers with a `snapshot` of the current value, then one per
    /// later write.
    #[serde(rename = "subscribe")]
    Subscribe { path: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { path: String },

    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "read_result")]
    ReadResult {
        request_id: RequestId,
        document: Option<Value>,
    },

    #[serde(rename = "write_ack")]
    WriteAck { request_id: RequestId },

    #[serde(rename = "snapshot")]
    Snapshot {
        path: String,
        document: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        request_id: Option<RequestId>,
        message: String,
    },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    /// Request this message answers, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::ReadResult { request_id, .. } | Self::WriteAck { request_id } => {
                Some(*request_id)
            }
            Self::Error { request_id, .. } => *request_id,
            Self::Snapshot { .. } | Self::Pong => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_are_tagged_by_type() {
        let msg = ClientMessage::Write {
            request_id: 7,
            path: "a/b".to_string(),
            document: json!({"events": []}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "write");
        assert_eq!(value["request_id"], 7);

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);
    }

    #[test]
    fn error_without_request_id_parses() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"bad path"}"#).unwrap();
        assert_eq!(msg.request_id(), None);

        let absent: ServerMessage =
            serde_json::from_str(r#"{"type":"snapshot","path":"p","document":null}"#).unwrap();
        assert_eq!(
            absent,
            ServerMessage::Snapshot {
                path: "p".to_string(),
                document: None
            }
        );
    }
}
