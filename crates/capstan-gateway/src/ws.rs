//! WebSocket push — status changes flow to connected clients.
//!
//! Connections authorize on upgrade with a JWT in the query string
//! (browsers cannot set headers on the WS handshake). Each connection
//! is keyed by its owner; snapshots are routed server-side so one tenant
//! never sees another's progress. Client actions: `ping`, `subscribe`,
//! `unsubscribe`; anything else gets an error frame.

use crate::auth::ResolvedAuth;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use capstan_driver::{ProgressSink, ProgressSnapshot};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Owner id embedded in the execution ARN
/// (`arn:capstan:execution:{owner}:{uuid}`).
pub fn owner_of_arn(execution_arn: &str) -> Option<&str> {
    execution_arn.split(':').nth(3)
}

pub struct WsRegistry {
    /// connection id -> owner.
    connections: DashMap<String, String>,
    snapshots: broadcast::Sender<ProgressSnapshot>,
}

impl Default for WsRegistry {
    fn default() -> Self {
        let (snapshots, _) = broadcast::channel(1024);
        Self {
            connections: DashMap::new(),
            snapshots,
        }
    }
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn publish(&self, snapshot: ProgressSnapshot) {
        let _ = self.snapshots.send(snapshot);
    }
}

/// Bridges the driver's progress notifier into the WS fan-out.
pub struct WsProgressSink(pub Arc<WsRegistry>);

impl ProgressSink for WsProgressSink {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        self.0.publish(snapshot.clone());
    }
}

#[derive(Deserialize)]
struct ClientMessage {
    action: String,
    #[serde(default)]
    execution_arn: Option<String>,
}

/// Query parameters on the upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<WsRegistry>,
    auth: ResolvedAuth,
    query: WsQuery,
) {
    // $connect-time authorization from the query string.
    let owner = match auth.verify(query.token.as_deref()) {
        Ok(owner) => owner,
        Err(e) => {
            warn!("ws connection rejected: {e}");
            let (mut tx, _) = socket.split();
            let _ = tx
                .send(WsMessage::Text(
                    serde_json::json!({"type": "error", "message": "unauthorized"}).to_string(),
                ))
                .await;
            return;
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    registry
        .connections
        .insert(connection_id.clone(), owner.clone());
    info!(owner = %owner, connection = %connection_id, "ws connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut snapshots = registry.subscribe();
    // Explicit subscriptions narrow the owner-wide default feed.
    let mut filters: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                let Ok(snapshot) = snapshot else { break };
                if owner_of_arn(&snapshot.execution_arn) != Some(owner.as_str()) {
                    continue;
                }
                if !filters.is_empty() && !filters.contains(&snapshot.execution_arn) {
                    continue;
                }
                let frame = serde_json::json!({"type": "status", "payload": snapshot});
                if ws_tx.send(WsMessage::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = handle_client_message(&text, &mut filters);
                        if ws_tx.send(WsMessage::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("ws receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    registry.connections.remove(&connection_id);
    info!(owner = %owner, connection = %connection_id, "ws disconnected");
}

fn handle_client_message(text: &str, filters: &mut HashSet<String>) -> String {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(message) => match message.action.as_str() {
            "ping" => serde_json::json!({"type": "pong"}).to_string(),
            "subscribe" => {
                if let Some(arn) = message.execution_arn {
                    filters.insert(arn);
                }
                serde_json::json!({"type": "subscribed", "count": filters.len()}).to_string()
            }
            "unsubscribe" => {
                if let Some(arn) = message.execution_arn {
                    filters.remove(&arn);
                }
                serde_json::json!({"type": "unsubscribed", "count": filters.len()}).to_string()
            }
            other => serde_json::json!({
                "type": "error",
                "message": format!("unknown action '{other}'")
            })
            .to_string(),
        },
        Err(_) => serde_json::json!({"type": "error", "message": "invalid JSON"}).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_parses_out_of_arn() {
        assert_eq!(
            owner_of_arn("arn:capstan:execution:owner-7:abc"),
            Some("owner-7")
        );
        assert_eq!(owner_of_arn("garbage"), None);
    }

    #[test]
    fn ping_gets_pong() {
        let mut filters = HashSet::new();
        let reply = handle_client_message(r#"{"action": "ping"}"#, &mut filters);
        assert!(reply.contains("pong"));
    }

    #[test]
    fn subscribe_and_unsubscribe_manage_filters() {
        let mut filters = HashSet::new();
        handle_client_message(
            r#"{"action": "subscribe", "execution_arn": "arn:x"}"#,
            &mut filters,
        );
        assert!(filters.contains("arn:x"));
        handle_client_message(
            r#"{"action": "unsubscribe", "execution_arn": "arn:x"}"#,
            &mut filters,
        );
        assert!(filters.is_empty());
    }

    #[test]
    fn unknown_action_is_an_error_frame() {
        let mut filters = HashSet::new();
        let reply = handle_client_message(r#"{"action": "mystery"}"#, &mut filters);
        assert!(reply.contains("error"));
        assert!(reply.contains("mystery"));
    }
}
