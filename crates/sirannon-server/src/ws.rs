//! Per-connection WebSocket session state machine.
//!
//! A session is bound to one database on upgrade. `subs` maps the client's
//! own subscription request id to the server-side [`SubscriptionId`]; on
//! close every entry is unsubscribed. Requests are handled one at a time as
//! they arrive on the socket, but replies and CDC `change` pushes share one
//! outbound channel, so delivery order between them is whatever the channel
//! happens to interleave. No ordering guarantee is made between them.

use crate::error::Result;
use crate::registry::DatabaseRegistry;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use sirannon_core::value::{normalize_params, row_to_json};
use sirannon_core::{Callback, Database, SubscriptionId};
use sirannon_protocol::{
    to_change_event_json, to_execute_response, ClientMessage, ErrorBody, ProtocolError, RequestId,
    ServerMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type AppState = Arc<DatabaseRegistry>;

#[tracing::instrument(skip(ws, state), fields(database = %id))]
pub async fn upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let db = state.get(&id)?;
    Ok(ws.on_upgrade(move |socket| run_session(socket, db)))
}

/// Per-session subscription bookkeeping: client request id -> server
/// subscription handle.
#[derive(Default)]
struct Session {
    subs: Mutex<HashMap<RequestId, SubscriptionId>>,
}

#[tracing::instrument(skip_all, fields(database = %db.id()))]
async fn run_session(socket: WebSocket, db: Arc<Database>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let session = Arc::new(Session::default());

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => handle_message(&text, &db, &session, &tx).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "websocket receive error, closing session");
                break;
            }
        }
    }

    let sub_ids: Vec<SubscriptionId> = session.subs.lock().unwrap().values().copied().collect();
    for sub_id in sub_ids {
        db.unsubscribe(sub_id);
    }
    drop(tx);
    let _ = send_task.await;
    debug!("session closed");
}

async fn handle_message(
    text: &str,
    db: &Arc<Database>,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            send_protocol_error(tx, e.to_string());
            return;
        }
    };

    // `transaction` is an HTTP-only operation; it has no `ClientMessage`
    // variant at all, so it must be intercepted here to report
    // TRANSPORT_ERROR rather than a generic parse failure.
    if raw.get("type").and_then(|v| v.as_str()) == Some("transaction") {
        let id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let err: sirannon_core::Error = sirannon_core::error::TransportError::Unsupported {
            op: "transaction".to_string(),
        }
        .into();
        let _ = tx.send(ServerMessage::error_for(id, &err));
        return;
    }

    let message: ClientMessage = match serde_json::from_value(raw) {
        Ok(m) => m,
        Err(e) => {
            send_protocol_error(tx, e.to_string());
            return;
        }
    };

    match message {
        ClientMessage::Query { id, sql, params } => {
            let params = normalize_params(params);
            match db.query(&sql, &params).await {
                Ok(rows) => {
                    let rows_json: Vec<_> = rows.iter().map(row_to_json).collect();
                    let _ = tx.send(ServerMessage::Result {
                        id,
                        data: json!({ "rows": rows_json }),
                    });
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error_for(id, &e));
                }
            }
        }
        ClientMessage::Execute { id, sql, params } => {
            let params = normalize_params(params);
            match db.execute(&sql, &params).await {
                Ok(result) => {
                    let _ = tx.send(ServerMessage::Result {
                        id,
                        data: to_execute_response(&result),
                    });
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error_for(id, &e));
                }
            }
        }
        ClientMessage::Subscribe { id, table, filter } => {
            // The subscription is registered before the `subscribed` ack is
            // sent, so a `change` event racing the ack is still delivered.
            let tx_for_events = tx.clone();
            let id_for_events = id.clone();
            let callback: Callback = Arc::new(move |event| {
                tx_for_events
                    .send(ServerMessage::Change {
                        id: id_for_events.clone(),
                        event: to_change_event_json(event),
                    })
                    .map_err(|e| e.to_string())
            });

            match db.subscribe(&table, filter, callback).await {
                Ok(sub_id) => {
                    session.subs.lock().unwrap().insert(id.clone(), sub_id);
                    let _ = tx.send(ServerMessage::Subscribed { id });
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error_for(id, &e));
                }
            }
        }
        ClientMessage::Unsubscribe { id } => {
            let removed = session.subs.lock().unwrap().remove(&id);
            match removed {
                Some(sub_id) => {
                    db.unsubscribe(sub_id);
                    let _ = tx.send(ServerMessage::Unsubscribed { id });
                }
                None => {
                    let _ = tx.send(ServerMessage::Error {
                        id: id.clone(),
                        error: ErrorBody {
                            code: "UNKNOWN_SUBSCRIPTION".to_string(),
                            message: format!("no subscription with id {id}"),
                        },
                    });
                }
            }
        }
    }
}

fn send_protocol_error(tx: &mpsc::UnboundedSender<ServerMessage>, reason: String) {
    warn!(reason, "malformed client message");
    let err = ProtocolError::Malformed { reason };
    let _ = tx.send(ServerMessage::error_for_protocol(&err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use sirannon_core::{DatabaseDescriptor, HookRegistry, TrackerOptions};
    use tempfile::tempdir;

    async fn open_db(dir: &tempfile::TempDir, name: &str) -> Arc<Database> {
        let path = dir.path().join(format!("{name}.db")).to_string_lossy().into_owned();
        let descriptor = DatabaseDescriptor {
            id: name.to_string(),
            path,
            read_only: false,
            wal_mode: true,
            read_pool_size: 2,
        };
        Arc::new(
            Database::open(&descriptor, TrackerOptions::default(), HookRegistry::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn subscribe_then_insert_then_manual_poll_delivers_change() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir, "ws_sub").await;
        db.execute("CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let session = Arc::new(Session::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_message(
            r#"{"type":"subscribe","id":"sub-1","table":"users","filter":{"name":"Alice"}}"#,
            &db,
            &session,
            &tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerMessage::Subscribed { id } => assert_eq!(id, "sub-1"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(session.subs.lock().unwrap().len(), 1);

        handle_message(
            r#"{"type":"execute","id":"exec-1","sql":"INSERT INTO users(name) VALUES ('Alice'),('Bob')"}"#,
            &db,
            &session,
            &tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerMessage::Result { id, .. } => assert_eq!(id, "exec-1"),
            other => panic!("unexpected message: {other:?}"),
        }

        db.poll_changes().await.unwrap();
        match rx.recv().await.unwrap() {
            ServerMessage::Change { id, event } => {
                assert_eq!(id, "sub-1");
                assert_eq!(event["kind"], "insert");
                assert_eq!(event["row"]["name"], "Alice");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_removes_session_entry() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir, "ws_unsub").await;
        db.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)", &[]).await.unwrap();

        let session = Arc::new(Session::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_message(r#"{"type":"subscribe","id":"s1","table":"t"}"#, &db, &session, &tx).await;
        rx.recv().await.unwrap();

        handle_message(r#"{"type":"unsubscribe","id":"s1"}"#, &db, &session, &tx).await;
        match rx.recv().await.unwrap() {
            ServerMessage::Unsubscribed { id } => assert_eq!(id, "s1"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(session.subs.lock().unwrap().is_empty());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn transaction_over_websocket_is_rejected_as_transport_error() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir, "ws_txn").await;
        let session = Arc::new(Session::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_message(
            r#"{"type":"transaction","id":"t1","statements":[]}"#,
            &db,
            &session,
            &tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerMessage::Error { id, error } => {
                assert_eq!(id, "t1");
                assert_eq!(error.code, "TRANSPORT_ERROR");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        db.close().await.unwrap();
    }
}
