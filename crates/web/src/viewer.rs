//! Viewer WebSocket bridge
//!
//! Forwards a subscription's messages to a WebSocket as text frames, pings
//! the client periodically and closes connections that went silent.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use runcast_common::StreamMessage;

use crate::config::SocketConfig;
use crate::sink::SinkReceiver;
use crate::stream::StreamManager;

/// Why a viewer connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// End-of-stream sentinel delivered
    Ended,
    /// Sink closed by the server without a sentinel
    SinkClosed,
    ClientGone,
    IdleTimeout,
    SendFailed,
}

/// Subscribe a WebSocket to a run and pump messages until either side stops.
pub async fn serve_viewer(
    socket: WebSocket,
    streams: Arc<StreamManager>,
    run_id: String,
    config: SocketConfig,
) {
    let (sink, receiver) = streams.open_sink();
    let sink_id = sink.id();

    if let Err(e) = streams.subscribe(&run_id, sink).await {
        warn!("Failed to subscribe viewer to run {}: {}", run_id, e);
        return;
    }
    debug!("Viewer {} attached to run {}", sink_id, run_id);

    let reason = bridge(socket, receiver, &config).await;
    streams.unsubscribe(&run_id, sink_id);
    debug!("Viewer {} left run {}: {:?}", sink_id, run_id, reason);
}

/// Pump sink messages into the socket
pub async fn bridge(socket: WebSocket, mut receiver: SinkReceiver, config: &SocketConfig) -> Closed {
    let (mut ws_write, mut ws_read) = socket.split();

    let mut ping = tokio::time::interval_at(Instant::now() + config.keepalive, config.keepalive);
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else {
                    break Closed::SinkClosed;
                };
                let is_end = matches!(message, StreamMessage::End { .. });
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode stream message: {}", e);
                        continue;
                    }
                };
                trace!("WS <- {} bytes", text.len());
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    debug!("Failed to send to WebSocket: {}", e);
                    break Closed::SendFailed;
                }
                if is_end {
                    break Closed::Ended;
                }
            }
            frame = ws_read.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break Closed::ClientGone,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    break Closed::ClientGone;
                }
            },
            _ = ping.tick() => {
                if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                    break Closed::SendFailed;
                }
            }
            _ = tokio::time::sleep_until(last_seen + config.idle_timeout) => {
                info!("Closing viewer connection idle for {:?}", config.idle_timeout);
                break Closed::IdleTimeout;
            }
        }
    };

    receiver.close();
    let _ = ws_write.close().await;
    reason
}
