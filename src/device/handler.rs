//! Device WebSocket handler
//!
//! Handles the WebSocket upgrade, connection lifecycle, and per-frame
//! dispatch. The dispatcher is purely a router: registration frames mutate
//! the registry, telemetry frames go to the coordinator, everything else is
//! logged and discarded. No frame shape ever drops the connection.

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::frames::{DeviceFrame, ErrorFrame, OutboundFrame, RegisterAck};
use super::registry::{ConnectionId, DeviceRegistry, RegisterError};
use crate::gateway::state::AppState;
use crate::transfer::coordinator::TransferCoordinator;

/// WebSocket upgrade handler
///
/// Endpoint: GET /ws
pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let registry = state.registry.clone();
    let coordinator = state.coordinator.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, registry, coordinator))
}

/// Handle one device connection lifecycle
async fn handle_socket(
    socket: WebSocket,
    registry: Arc<DeviceRegistry>,
    coordinator: Arc<TransferCoordinator>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // Which device this connection registered, if any; shared with the
    // cleanup below so a close always unregisters
    let registration: Arc<Mutex<Option<(String, ConnectionId)>>> = Arc::new(Mutex::new(None));

    // Forward outbound frames (commands, acks) to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let tx_for_recv = tx.clone();
    let registry_for_recv = registry.clone();
    let registration_for_recv = registration.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    dispatch_frame(
                        &text,
                        &tx_for_recv,
                        &registry_for_recv,
                        &coordinator,
                        &registration_for_recv,
                    )
                    .await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    // Only removes the mapping if this connection owns it; an active
    // transfer keeps running on the timeout path until reconnect
    if let Some((device_id, conn_id)) = registration.lock().unwrap().take() {
        registry.unregister(&device_id, conn_id);
    }
}

/// Route one inbound frame
async fn dispatch_frame(
    text: &str,
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    registry: &Arc<DeviceRegistry>,
    coordinator: &Arc<TransferCoordinator>,
    registration: &Arc<Mutex<Option<(String, ConnectionId)>>>,
) {
    let frame: DeviceFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Malformed device frame discarded");
            return;
        }
    };

    if let Some(warning) = &frame.warning {
        warn!(device_id = %frame.device_id, warning = %warning, "Device warning");
        return;
    }

    if frame.is_register() {
        // One device ID per connection; a second REGISTER would orphan the
        // first mapping at close time
        if let Some((registered_id, _)) = registration.lock().unwrap().as_ref() {
            warn!(
                device_id = %frame.device_id,
                registered_id = %registered_id,
                "REGISTER on a connection that already registered a device"
            );
            let _ = tx.send(OutboundFrame::Error(ErrorFrame::new(
                "Connection already registered a device",
            )));
            return;
        }
        match registry.register(&frame.device_id, tx.clone()) {
            Ok(conn_id) => {
                *registration.lock().unwrap() = Some((frame.device_id.clone(), conn_id));
                let _ = tx.send(OutboundFrame::Ack(RegisterAck::new(frame.device_id)));
            }
            Err(RegisterError::AlreadyRegistered) => {
                let _ = tx.send(OutboundFrame::Error(ErrorFrame::new(
                    "Device already registered",
                )));
            }
        }
        return;
    }

    if let Some(energy) = frame.energy {
        coordinator.report_telemetry(&frame.device_id, energy).await;
        return;
    }

    debug!(device_id = %frame.device_id, frame = %text, "Unhandled device frame");
}
