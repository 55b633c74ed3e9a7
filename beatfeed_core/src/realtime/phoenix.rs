use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::{ChangeChannel, ChangeEvent, FeedTable, Subscription};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};

const CHANNEL_TOPIC: &str = "realtime:realtime-feed";
const JOIN_REF: &str = "1";
const EVENT_BUFFER: usize = 64;

/// Wire frame of the Phoenix channel protocol (`vsn=1.0.0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Change(ChangeEvent),
    Closed(String),
    Ignored,
}

/// Realtime websocket transport. Each `subscribe` opens its own socket,
/// joins one channel for the requested tables and keeps it alive with
/// heartbeats until the returned [`Subscription`] is dropped.
#[derive(Clone)]
pub struct RealtimeChannel {
    config: FeedConfig,
}

impl RealtimeChannel {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChangeChannel for RealtimeChannel {
    async fn subscribe(
        &self,
        tables: &[FeedTable],
        access_token: Option<String>,
    ) -> FeedResult<Subscription> {
        let url = self.config.realtime_url()?;
        let (socket, _) = timeout(self.config.request_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Network("realtime connect timed out".into()))??;
        let (mut sink, mut stream) = socket.split();

        let join = join_message(tables, access_token.as_deref());
        sink.send(Message::Text(serde_json::to_string(&join)?)).await?;
        timeout(self.config.request_timeout, await_join_reply(&mut stream))
            .await
            .map_err(|_| FeedError::Network("realtime join timed out".into()))??;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let closer = CancellationToken::new();
        let worker_closer = closer.clone();
        let heartbeat = self.config.heartbeat_interval;
        tokio::spawn(async move {
            run_socket(sink, stream, tx, worker_closer, heartbeat).await;
        });

        tracing::info!(tables = ?tables, "joined realtime channel");
        Ok(Subscription::new(rx, closer))
    }
}

async fn await_join_reply<R>(stream: &mut R) -> FeedResult<()>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
            continue;
        };
        if message.event != "phx_reply" || message.reference.as_deref() != Some(JOIN_REF) {
            continue;
        }
        return match message.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            _ => Err(FeedError::Network(format!(
                "realtime join rejected: {}",
                message.payload.get("response").unwrap_or(&Value::Null)
            ))),
        };
    }
    Err(FeedError::Network("realtime socket closed during join".into()))
}

async fn run_socket<W, R>(
    mut sink: W,
    mut stream: R,
    events: mpsc::Sender<ChangeEvent>,
    closer: CancellationToken,
    heartbeat: Duration,
) where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = closer.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                tracing::debug!("realtime subscription released");
                break;
            }
            _ = ticker.tick() => {
                let beat = heartbeat_message(next_ref);
                next_ref += 1;
                let frame = match serde_json::to_string(&beat) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode heartbeat");
                        break;
                    }
                };
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    tracing::warn!(error = %err, "realtime heartbeat failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<PhoenixMessage>(&text) {
                    Ok(message) => match classify(&message) {
                        Inbound::Change(event) => {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Inbound::Closed(reason) => {
                            tracing::warn!(reason = %reason, "realtime channel closed by server");
                            break;
                        }
                        Inbound::Ignored => {}
                    },
                    Err(err) => tracing::debug!(error = %err, "ignoring undecodable realtime frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("realtime socket closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "realtime socket error");
                    break;
                }
            }
        }
    }
}

fn join_message(tables: &[FeedTable], access_token: Option<&str>) -> PhoenixMessage {
    let changes: Vec<Value> = tables
        .iter()
        .map(|table| json!({ "event": "*", "schema": "public", "table": table.as_str() }))
        .collect();
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }
    PhoenixMessage {
        topic: CHANNEL_TOPIC.to_string(),
        event: "phx_join".to_string(),
        payload,
        reference: Some(JOIN_REF.to_string()),
    }
}

fn heartbeat_message(reference: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

fn classify(message: &PhoenixMessage) -> Inbound {
    match message.event.as_str() {
        "postgres_changes" => parse_change(&message.payload)
            .map(Inbound::Change)
            .unwrap_or(Inbound::Ignored),
        "phx_error" | "phx_close" if message.topic == CHANNEL_TOPIC => {
            Inbound::Closed(message.event.clone())
        }
        "system"
            if message.payload.get("status").and_then(Value::as_str) == Some("error") =>
        {
            let reason = message
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("system error");
            Inbound::Closed(reason.to_string())
        }
        _ => Inbound::Ignored,
    }
}

fn parse_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let table = FeedTable::from_name(data.get("table")?.as_str()?)?;
    let kind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    Some(ChangeEvent { table, kind })
}
