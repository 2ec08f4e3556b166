//! One hub subscriber per WebSocket connection.
//!
//! The outbound task drains the subscription into text frames; the inbound
//! task only logs what clients send. Whichever ends first takes the other
//! down, and dropping the subscription unregisters it from the hub.

use crate::core::events::ProgressEvent;
use crate::core::hub::Subscription;
use crate::core::model::SubscriberId;
use crate::plugins::api::routes::ApiState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

pub const MAX_INBOUND_BYTES: usize = 512;
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.max_message_size(MAX_INBOUND_BYTES)
        .max_frame_size(MAX_INBOUND_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state.orchestrator.subscribe()))
}

async fn handle_socket(socket: WebSocket, sub: Subscription) {
    let id = sub.id();
    info!(subscriber = %id, "status client connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_events(sink, sub));
    let mut reader = tokio::spawn(read_inbound(stream, id));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    info!(subscriber = %id, "status client disconnected");
}

async fn write_events(mut sink: SplitSink<WebSocket, Message>, mut sub: Subscription) {
    let id = sub.id();
    while let Some(evt) = sub.recv().await {
        let text = match encode(&evt) {
            Some(t) => t,
            None => continue,
        };
        match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(subscriber = %id, "websocket write failed: {}", e);
                return;
            }
            Err(_) => {
                warn!(subscriber = %id, "websocket write timed out");
                return;
            }
        }
    }

    // the hub closed our channel: evicted or shutting down
    debug!(subscriber = %id, "subscription closed, sending close frame");
    let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
}

async fn read_inbound(mut stream: SplitStream<WebSocket>, id: SubscriberId) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(t)) => debug!(subscriber = %id, "client says: {}", t),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscriber = %id, "websocket read failed: {}", e);
                break;
            }
        }
    }
}

fn encode(evt: &ProgressEvent) -> Option<String> {
    serde_json::to_string(evt)
        .map_err(|e| warn!("could not encode progress event: {}", e))
        .ok()
}
