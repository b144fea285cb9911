// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! WebSocket sessions over the address space

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::address_space::{AddressSpace, BrowseSnapshot, Change};
use crate::model::SampleValue;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Browse(BrowseSnapshot),
    Change(Change),
    WriteResult {
        node_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Browse,
    Write { node_id: String, value: serde_json::Value },
    Ping,
}

/// Apply one client request, returning the reply for that client
pub fn handle_request(
    text: &str,
    space: &RwLock<AddressSpace>,
    changes: &broadcast::Sender<Change>,
) -> ServerMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Browse) => ServerMessage::Browse(space.read().browse()),
        Ok(ClientMessage::Ping) => ServerMessage::Pong,
        Ok(ClientMessage::Write { node_id, value }) => {
            let result = space.write().write(&node_id, SampleValue::from_json(&value));
            match result {
                Ok(change) => {
                    let _ = changes.send(change);
                    ServerMessage::WriteResult { node_id, ok: true, error: None }
                }
                Err(e) => ServerMessage::WriteResult {
                    node_id,
                    ok: false,
                    error: Some(e.to_string()),
                },
            }
        }
        Err(e) => ServerMessage::Error {
            message: format!("bad request: {}", e),
        },
    }
}

/// Accept loop; runs until the owning runtime shuts down
pub async fn serve(listener: TcpListener, space: Arc<RwLock<AddressSpace>>, changes: broadcast::Sender<Change>) {
    match listener.local_addr() {
        Ok(addr) => info!("Node-graph sessions on ws://{}", addr),
        Err(e) => warn!("Node-graph listener has no local address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(stream, addr, space.clone(), changes.clone()));
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
}

async fn send(ws: &mut (impl SinkExt<Message> + Unpin), message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => ws.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode session message: {}", e);
            true
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    space: Arc<RwLock<AddressSpace>>,
    changes: broadcast::Sender<Change>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    info!("Node-graph session opened from {}", addr);

    let mut change_rx = changes.subscribe();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let snapshot = ServerMessage::Browse(space.read().browse());
    if !send(&mut ws_sender, &snapshot).await {
        return;
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from {}: {}", addr, text);
                        let reply = handle_request(&text, &space, &changes);
                        if !send(&mut ws_sender, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }

            change = change_rx.recv() => {
                match change {
                    Ok(change) => {
                        if !send(&mut ws_sender, &ServerMessage::Change(change)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Session {} skipped {} change(s)", addr, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("Node-graph session {} closed", addr);
}
