//! Phoenix-channel push feed.
//!
//! One WebSocket per subscription. The broadcast subscription joins
//! `realtime:scan_progress:{id}`; the snapshot subscription joins a
//! postgres-changes channel on `scan_progress` filtered by scan id.
//! Frames are reduced to wake messages; a dropped socket is reported as a
//! subscription error and reopened with backoff until the receiver is
//! dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::observer::signals::{PushMessage, SignalError};
use crate::observer::source::{PushFeed, PushStream};
use crate::resilience::backoff::ReconnectBackoff;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const SUBSCRIPTION_BUFFER: usize = 64;
const PROTOCOL_VERSION: &str = "1.0.0";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire frame of the Phoenix protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    fn encode(&self) -> Result<Message, SignalError> {
        serde_json::to_string(self)
            .map(Message::text)
            .map_err(|e| SignalError::Decode(e.to_string()))
    }

    fn heartbeat(reference: u64) -> Self {
        Self {
            topic: "phoenix".into(),
            event: "heartbeat".into(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Broadcast,
    SnapshotChanges,
}

#[derive(Debug, Clone)]
struct Channel {
    kind: ChannelKind,
    topic: String,
    join_payload: Value,
}

impl Channel {
    fn broadcast(scan_id: &str) -> Self {
        Self {
            kind: ChannelKind::Broadcast,
            topic: format!("realtime:scan_progress:{scan_id}"),
            join_payload: json!({ "config": { "broadcast": { "self": false } } }),
        }
    }

    fn snapshot_changes(scan_id: &str) -> Self {
        Self {
            kind: ChannelKind::SnapshotChanges,
            topic: format!("realtime:scan_progress_changes:{scan_id}"),
            join_payload: json!({
                "config": {
                    "postgres_changes": [{
                        "event": "*",
                        "schema": "public",
                        "table": "scan_progress",
                        "filter": format!("scan_id=eq.{scan_id}"),
                    }]
                }
            }),
        }
    }

    fn join_frame(&self) -> PhoenixFrame {
        PhoenixFrame {
            topic: self.topic.clone(),
            event: "phx_join".into(),
            payload: self.join_payload.clone(),
            reference: Some("1".into()),
        }
    }

    /// What an incoming frame means for this channel.
    fn interpret(&self, frame: &PhoenixFrame) -> Result<Option<PushMessage>, SignalError> {
        if frame.topic != self.topic {
            return Ok(None);
        }
        match frame.event.as_str() {
            "phx_reply" => {
                if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                    return Err(SignalError::Subscription(format!(
                        "join of {} rejected: {}",
                        self.topic, frame.payload["response"]
                    )));
                }
                Ok(None)
            }
            "phx_error" | "phx_close" => Err(SignalError::Subscription(format!(
                "{} on {}",
                frame.event, self.topic
            ))),
            "broadcast" if self.kind == ChannelKind::Broadcast => Ok(frame
                .payload
                .get("event")
                .and_then(Value::as_str)
                .and_then(PushMessage::from_broadcast_event)),
            "postgres_changes" if self.kind == ChannelKind::SnapshotChanges => {
                Ok(Some(PushMessage::SnapshotChanged))
            }
            _ => Ok(None),
        }
    }
}

/// Realtime WebSocket client.
#[derive(Debug, Clone)]
pub struct RealtimeFeed {
    endpoint: Url,
}

impl RealtimeFeed {
    pub fn new(realtime_url: &str, api_key: &str) -> Result<Self, SignalError> {
        let mut endpoint = Url::parse(realtime_url)
            .map_err(|e| SignalError::Subscription(format!("invalid realtime url {realtime_url}: {e}")))?;
        {
            let mut query = endpoint.query_pairs_mut();
            if !api_key.is_empty() {
                query.append_pair("apikey", api_key);
            }
            query.append_pair("vsn", PROTOCOL_VERSION);
        }
        Ok(Self { endpoint })
    }

    async fn open(&self, channel: &Channel) -> Result<Socket, SignalError> {
        let (mut socket, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| SignalError::Subscription(format!("connect failed: {e}")))?;
        socket
            .send(channel.join_frame().encode()?)
            .await
            .map_err(|e| SignalError::Subscription(format!("join failed: {e}")))?;
        tracing::debug!(topic = %channel.topic, "Joined realtime channel");
        Ok(socket)
    }

    async fn subscribe(&self, channel: Channel) -> Result<PushStream, SignalError> {
        let socket = self.open(&channel).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(self.clone().pump(channel, socket, tx));
        Ok(rx)
    }

    /// Forward frames until the receiver goes away, reconnecting as needed.
    async fn pump(
        self,
        channel: Channel,
        mut socket: Socket,
        tx: mpsc::Sender<Result<PushMessage, SignalError>>,
    ) {
        let mut backoff = ReconnectBackoff::new(RECONNECT_BASE, RECONNECT_MAX);
        loop {
            let error = match read_socket(&channel, socket, &tx).await {
                Ok(()) => return,
                Err(e) => e,
            };
            tracing::warn!(topic = %channel.topic, error = %error, "Realtime channel dropped");
            if tx.send(Err(error)).await.is_err() {
                return;
            }

            backoff.reset();
            socket = loop {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = time::sleep(delay) => {}
                }
                match self.open(&channel).await {
                    Ok(socket) => break socket,
                    Err(e) => {
                        tracing::warn!(topic = %channel.topic, attempt = backoff.attempt(), error = %e, "Realtime reconnect failed");
                    }
                }
            };
            tracing::info!(topic = %channel.topic, attempts = backoff.attempt(), "Realtime channel reconnected");
        }
    }
}

/// Read one socket. `Ok` once the receiver is gone, `Err` when the socket
/// fails.
async fn read_socket(
    channel: &Channel,
    socket: Socket,
    tx: &mpsc::Sender<Result<PushMessage, SignalError>>,
) -> Result<(), SignalError> {
    let (mut sink, mut frames) = socket.split();
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                let _ = sink.close().await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                sink.send(PhoenixFrame::heartbeat(next_ref).encode()?)
                    .await
                    .map_err(|e| SignalError::Subscription(format!("heartbeat failed: {e}")))?;
                next_ref += 1;
            }
            incoming = frames.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(SignalError::Subscription("socket closed".into()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SignalError::Subscription(e.to_string())),
                };
                let frame: PhoenixFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring undecodable realtime frame");
                        continue;
                    }
                };
                if let Some(message) = channel.interpret(&frame)? {
                    if tx.send(Ok(message)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PushFeed for RealtimeFeed {
    async fn subscribe_snapshot(&self, scan_id: &str) -> Result<PushStream, SignalError> {
        self.subscribe(Channel::snapshot_changes(scan_id)).await
    }

    async fn subscribe_broadcast(&self, scan_id: &str) -> Result<PushStream, SignalError> {
        self.subscribe(Channel::broadcast(scan_id)).await
    }
}
