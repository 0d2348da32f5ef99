/// Push subscription over the Realtime WebSocket (Phoenix channel protocol).
///
/// One socket per subscription: join `realtime:project:<id>` with a
/// `postgres_changes` filter on the board, heartbeat every 25 s, and forward
/// decoded row changes through an mpsc channel exposed as a `ChangeStream`.
/// The stream ends when the socket closes; a frame that cannot be decoded is
/// forwarded as an error so the controller reloads.
use std::time::Duration;

use boardsync_core::backend::{ChangeStream, TransportError};
use boardsync_core::types::{Card, ChangeEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 256;
const JOIN_REF: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketSource = SplitStream<Socket>;

#[derive(Debug, Clone)]
pub struct RealtimeEndpoint {
    pub socket_url: String,
    pub access_token: String,
}

impl RealtimeEndpoint {
    /// Derive the socket URL from the project's HTTP base URL.
    pub fn new(base_url: &str, api_key: &str, access_token: Option<&str>) -> Self {
        let ws_base = base_url
            .trim_end_matches('/')
            .replace("http://", "ws://")
            .replace("https://", "wss://");
        Self {
            socket_url: format!(
                "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
                ws_base,
                utf8_percent_encode(api_key, NON_ALPHANUMERIC)
            ),
            access_token: access_token.unwrap_or(api_key).to_string(),
        }
    }
}

/// A Phoenix channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

#[derive(Deserialize)]
struct ChangeEnvelope {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

pub fn topic(board_id: &str) -> String {
    format!("realtime:project:{}", board_id)
}

pub fn join_message(board_id: &str, access_token: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic(board_id),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": "cards",
                    "filter": format!("project_id=eq.{}", board_id),
                }],
            },
            "access_token": access_token,
        }),
        reference: Some(JOIN_REF.to_string()),
        join_ref: Some(JOIN_REF.to_string()),
    }
}

fn heartbeat_message(seq: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(seq.to_string()),
        join_ref: None,
    }
}

/// Check the server's reply to our join.
pub fn join_status(reply: &PhoenixMessage) -> Result<(), TransportError> {
    match reply.payload.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        _ => Err(TransportError::Network(format!(
            "Channel join refused for {}: {}",
            reply.topic,
            reply.payload.get("response").unwrap_or(&Value::Null)
        ))),
    }
}

/// Decode a `postgres_changes` frame. Other frames yield `Ok(None)`.
pub fn decode_change(message: &PhoenixMessage) -> Result<Option<ChangeEvent>, TransportError> {
    if message.event != "postgres_changes" {
        return Ok(None);
    }
    let envelope: ChangeEnvelope = serde_json::from_value(message.payload.clone())
        .map_err(|e| TransportError::Decode(format!("change payload: {}", e)))?;
    let data = envelope.data;
    let row = |value: Value| {
        serde_json::from_value::<Card>(value)
            .map_err(|e| TransportError::Decode(format!("{} record: {}", data.kind, e)))
    };
    match data.kind.as_str() {
        "INSERT" => Ok(Some(ChangeEvent::Insert(row(data.record)?))),
        "UPDATE" => Ok(Some(ChangeEvent::Update(row(data.record)?))),
        "DELETE" => {
            let id = data
                .old_record
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::Decode("DELETE without old_record.id".to_string()))?;
            Ok(Some(ChangeEvent::Delete { id: id.to_string() }))
        }
        other => {
            log::debug!(target: "boardsync.realtime", "Ignoring change type {}", other);
            Ok(None)
        }
    }
}

/// Connect, join the board's channel and return its change stream.
pub async fn subscribe(
    endpoint: &RealtimeEndpoint,
    board_id: &str,
) -> Result<ChangeStream, TransportError> {
    let (socket, _) = tokio_tungstenite::connect_async(endpoint.socket_url.as_str())
        .await
        .map_err(|e| TransportError::Network(format!("WS connect failed: {}", e)))?;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let join = join_message(board_id, &endpoint.access_token);
    send(&mut ws_tx, &join).await?;
    tokio::time::timeout(JOIN_TIMEOUT, await_join_reply(&mut ws_rx, &join.topic))
        .await
        .map_err(|_| TransportError::Timeout)??;
    log::info!(target: "boardsync.realtime", "Joined {}", join.topic);

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_channel(ws_tx, ws_rx, join.topic, tx));
    Ok(Box::pin(ReceiverStream::new(rx)))
}

async fn send(ws_tx: &mut SocketSink, message: &PhoenixMessage) -> Result<(), TransportError> {
    let text = serde_json::to_string(message).map_err(|e| TransportError::Decode(e.to_string()))?;
    ws_tx
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Network(format!("WS send failed: {}", e)))
}

fn parse_frame(frame: Message) -> Result<Option<PhoenixMessage>, TransportError> {
    match frame {
        Message::Text(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| TransportError::Decode(format!("frame: {}", e))),
        Message::Close(_) => Err(TransportError::Closed),
        _ => Ok(None),
    }
}

async fn await_join_reply(ws_rx: &mut SocketSource, topic: &str) -> Result<(), TransportError> {
    while let Some(frame) = ws_rx.next().await {
        let frame = frame.map_err(|e| TransportError::Network(format!("WS read error: {}", e)))?;
        let Some(message) = parse_frame(frame)? else {
            continue;
        };
        if message.topic == topic
            && message.event == "phx_reply"
            && message.reference.as_deref() == Some(JOIN_REF)
        {
            return join_status(&message);
        }
    }
    Err(TransportError::Closed)
}

async fn run_channel(
    mut ws_tx: SocketSink,
    mut ws_rx: SocketSource,
    topic: String,
    tx: mpsc::Sender<Result<ChangeEvent, TransportError>>,
) {
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut seq: u64 = 1;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                log::debug!(target: "boardsync.realtime", "Subscriber for {} dropped", topic);
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            _ = heartbeat.tick() => {
                seq += 1;
                if let Err(e) = send(&mut ws_tx, &heartbeat_message(seq)).await {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        let error = TransportError::Network(format!("WS read error: {}", e));
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                    None => break,
                };
                if let Message::Ping(data) = frame {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                    continue;
                }
                let message = match parse_frame(frame) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        log::warn!(
                            target: "boardsync.realtime",
                            "Skipping frame on {}: {}",
                            topic,
                            e
                        );
                        continue;
                    }
                };
                let ended = message.event == "phx_error" || message.event == "phx_close";
                if message.topic == topic && ended {
                    log::warn!(
                        target: "boardsync.realtime",
                        "Channel {} ended: {}",
                        topic,
                        message.event
                    );
                    break;
                }
                match decode_change(&message) {
                    Ok(Some(event)) => {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // A lost change: let the controller reload.
                        log::warn!(
                            target: "boardsync.realtime",
                            "Undecodable change on {}: {}",
                            topic,
                            e
                        );
                        if tx.send(Err(e)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    log::info!(target: "boardsync.realtime", "Left {}", topic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardsync_core::types::Column;

    fn frame(text: &str) -> PhoenixMessage {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_endpoint_from_https_url() {
        let endpoint = RealtimeEndpoint::new("https://demo.example.co/", "key.with-dots", None);
        assert_eq!(
            endpoint.socket_url,
            "wss://demo.example.co/realtime/v1/websocket?apikey=key%2Ewith%2Ddots&vsn=1.0.0"
        );
        assert_eq!(endpoint.access_token, "key.with-dots");

        let local = RealtimeEndpoint::new("http://localhost:54321", "k", Some("jwt"));
        assert!(local.socket_url.starts_with("ws://localhost:54321/realtime/v1/websocket"));
        assert_eq!(local.access_token, "jwt");
    }

    #[test]
    fn test_join_message_filters_on_board() {
        let join = join_message("p1", "token");
        assert_eq!(join.topic, "realtime:project:p1");
        assert_eq!(join.event, "phx_join");
        let change = &join.payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "cards");
        assert_eq!(change["filter"], "project_id=eq.p1");
        assert_eq!(join.payload["access_token"], "token");

        let wire = serde_json::to_value(&join).unwrap();
        assert_eq!(wire["ref"], "1");
        assert_eq!(wire["join_ref"], "1");
    }

    #[test]
    fn test_heartbeat_has_no_join_ref() {
        let wire = serde_json::to_value(heartbeat_message(7)).unwrap();
        assert_eq!(wire["topic"], "phoenix");
        assert_eq!(wire["ref"], "7");
        assert!(wire.get("join_ref").is_none());
    }

    #[test]
    fn test_join_status() {
        let ok = frame(r#"{"topic":"realtime:project:p1","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#);
        assert!(join_status(&ok).is_ok());
        let refused = frame(r#"{"topic":"realtime:project:p1","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#);
        assert!(matches!(join_status(&refused), Err(TransportError::Network(_))));
    }

    #[test]
    fn test_decode_update() {
        let message = frame(
            r#"{"topic":"realtime:project:p1","event":"postgres_changes","ref":null,
            "payload":{"ids":[1],"data":{"schema":"public","table":"cards","type":"UPDATE",
            "commit_timestamp":"2024-05-01T12:00:00.5Z",
            "record":{"id":"c1","project_id":"p1","column_type":"done","content":"Ship it",
                "order_index":2.5,"created_by":"u1",
                "created_at":"2024-05-01T10:00:00+00:00","updated_at":"2024-05-01T12:00:00.123456+00:00"},
            "old_record":{"id":"c1"}}}}"#,
        );
        match decode_change(&message).unwrap() {
            Some(ChangeEvent::Update(card)) => {
                assert_eq!(card.id, "c1");
                assert_eq!(card.column_type, Column::Done);
                assert_eq!(card.order_index, 2.5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete_uses_old_record() {
        let message = frame(
            r#"{"topic":"realtime:project:p1","event":"postgres_changes",
            "payload":{"data":{"type":"DELETE","record":null,"old_record":{"id":"c9"}}}}"#,
        );
        assert_eq!(
            decode_change(&message).unwrap(),
            Some(ChangeEvent::Delete { id: "c9".to_string() })
        );
    }

    #[test]
    fn test_decode_skips_other_events_and_reports_bad_rows() {
        let presence = frame(r#"{"topic":"realtime:project:p1","event":"presence_state","payload":{}}"#);
        assert_eq!(decode_change(&presence).unwrap(), None);

        let broken = frame(
            r#"{"topic":"realtime:project:p1","event":"postgres_changes",
            "payload":{"data":{"type":"INSERT","record":{"id":"c1"}}}}"#,
        );
        assert!(matches!(decode_change(&broken), Err(TransportError::Decode(_))));
    }
}
