//! Client/server wire message shapes, shared by the HTTP body and the
//! WebSocket frame encodings.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sirannon_core::value::Filter;

/// A request id, opaque to the server beyond echoing it back in replies.
pub type RequestId = String;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "query")]
    Query {
        id: RequestId,
        sql: String,
        #[serde(default)]
        params: Option<Json>,
    },
    #[serde(rename = "execute")]
    Execute {
        id: RequestId,
        sql: String,
        #[serde(default)]
        params: Option<Json>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        id: RequestId,
        table: String,
        #[serde(default)]
        filter: Option<Filter>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: RequestId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "result")]
    Result { id: RequestId, data: Json },
    #[serde(rename = "subscribed")]
    Subscribed { id: RequestId },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { id: RequestId },
    #[serde(rename = "change")]
    Change { id: RequestId, event: Json },
    #[serde(rename = "error")]
    Error { id: RequestId, error: ErrorBody },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ServerMessage {
    pub fn error_for(id: impl Into<RequestId>, err: &sirannon_core::Error) -> Self {
        ServerMessage::Error {
            id: id.into(),
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Builds an `error` frame for a frame that failed to decode into a
    /// [`ClientMessage`] at all, so no request id is known yet.
    pub fn error_for_protocol(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            id: RequestId::new(),
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// HTTP body for `POST /db/{id}/query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Option<Json>,
}

/// HTTP body for `POST /db/{id}/execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Option<Json>,
}

/// HTTP body for `POST /db/{id}/transaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRequest {
    pub statements: Vec<StatementRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatementRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Option<Json>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub databases: Vec<DatabaseStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    pub id: String,
    pub path: String,
    pub read_only: bool,
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_query_deserializes_by_tag() {
        let json = r#"{"type":"query","id":"1","sql":"SELECT 1"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Query { id, sql, params } => {
                assert_eq!(id, "1");
                assert_eq!(sql, "SELECT 1");
                assert!(params.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn client_message_subscribe_carries_optional_filter() {
        let json = r#"{"type":"subscribe","id":"2","table":"users","filter":{"name":"Alice"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { table, filter, .. } => {
                assert_eq!(table, "users");
                assert!(filter.is_some());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn server_message_error_serializes_with_tag() {
        let msg = ServerMessage::Error {
            id: "1".to_string(),
            error: ErrorBody {
                code: "QUERY_ERROR".to_string(),
                message: "boom".to_string(),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["code"], "QUERY_ERROR");
    }
}
