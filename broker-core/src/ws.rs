//! The WebSocket edge (C9): one [`WsSession`] per upgraded socket, talking
//! the frame protocol described in the external interfaces — `token`,
//! `request`, `publish`, `monitor`, answered with `response`/`error`
//! frames, plus server-initiated `publish` frames for active monitors.
//!
//! Writes are serialized through a single mpsc-fed writer task so that a
//! monitor relay running on a bus task never races the session's own
//! replies on the socket.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{Authenticator, Authorizer};
use crate::envelope::{Call, ReplyChannel};
use crate::error::BrokerError;
use crate::provider::{CallHandler, Provider, Unsubscribe};
use crate::rid::{Method, Pattern, Verb};

/// Errors surfaced while pumping a raw WebSocket.
#[derive(Debug)]
pub enum WsError {
    Send(axum::Error),
    Recv(axum::Error),
    Json(serde_json::Error),
    Closed,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsError::Send(e) => write!(f, "ws send: {e}"),
            WsError::Recv(e) => write!(f, "ws recv: {e}"),
            WsError::Json(e) => write!(f, "ws json: {e}"),
            WsError::Closed => write!(f, "ws closed"),
        }
    }
}

impl std::error::Error for WsError {}

/// Wire shape of a session frame in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Matches an observed `endpoint`/`method` against the declared patterns,
/// binding `$` segments to the observed values positionally.
fn resolve(patterns: &[Pattern], endpoint: &str, verb_str: &str) -> Option<Pattern> {
    let observed: Vec<&str> = endpoint.split('.').collect();
    patterns.iter().find_map(|p| {
        if !p.verb().as_str().eq_ignore_ascii_case(verb_str) {
            return None;
        }
        // Full dotted shape is `service.<generic segments>.VERB`, matching
        // what `Pattern::endpoint_name`/`endpoint_specific` render.
        let verb_str = p.verb().as_str();
        let generic: Vec<&str> = std::iter::once(p.method.service.as_str())
            .chain(p.method.generic_endpoint.split('.'))
            .chain(std::iter::once(verb_str))
            .collect();
        if generic.len() != observed.len() {
            return None;
        }
        let mut bindings: Vec<(String, String)> = Vec::new();
        for (g, o) in generic.iter().zip(observed.iter()) {
            match g.strip_prefix('$') {
                Some(name) => bindings.push((name.to_string(), (*o).to_string())),
                None if g == o => {}
                None => return None,
            }
        }
        let borrowed: Vec<(&str, &str)> = bindings.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        Some(p.bind(&borrowed))
    })
}

/// Relays a monitor's delivered calls back onto the socket as
/// server-initiated `publish` frames, keyed by the `monitor` request's
/// original correlation id.
struct WsMonitorRelay {
    write_tx: mpsc::Sender<Message>,
    correlation_id: String,
}

#[async_trait]
impl CallHandler for WsMonitorRelay {
    async fn handle(&self, call: Call) {
        let data: serde_json::Value = serde_json::from_slice(call.raw_data()).unwrap_or(serde_json::Value::Null);
        let frame = WsFrame {
            id: self.correlation_id.clone(),
            kind: "publish".into(),
            endpoint: call.endpoint().endpoint_specific(),
            method: call.endpoint().verb().to_string(),
            token: None,
            query: None,
            data,
        };
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = self.write_tx.send(Message::Text(text.into())).await;
        }
        let _ = call.ok().await;
    }
}

/// Owns the patterns a socket may call or monitor, and upgrades incoming
/// connections into [`WsSession`]s.
pub struct WsEdge {
    provider: Arc<dyn Provider>,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    handler_patterns: Vec<Pattern>,
    event_patterns: Vec<Pattern>,
}

impl WsEdge {
    pub fn new(
        provider: Arc<dyn Provider>,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
        patterns: Vec<Pattern>,
    ) -> Arc<Self> {
        let (event_patterns, handler_patterns) =
            patterns.into_iter().partition(|p| p.verb() == Verb::Event);
        Arc::new(Self { provider, authenticator, authorizer, handler_patterns, event_patterns })
    }

    fn connected_pattern(&self) -> Pattern {
        Method::new("route", "", "socket.connected", "socket.connected", Verb::Event).pattern()
    }

    fn disconnected_pattern(&self, id: Uuid) -> Pattern {
        let id_str = id.to_string();
        Method::new("route", "", "socket.disconnected.$ID", "socket.disconnected.$ID", Verb::Event)
            .pattern()
            .bind(&[("ID", id_str.as_str())])
    }

    /// Axum handler entry point: `.route("/ws", get(move |ws| edge.clone().handle_upgrade(ws)))`.
    pub async fn handle_upgrade(self: Arc<Self>, ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(move |socket| async move { self.serve(socket).await })
    }

    async fn serve(self: Arc<Self>, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let (write_tx, write_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(run_writer(sink, write_rx));

        let session = Arc::new(WsSession {
            id: Uuid::new_v4(),
            edge: self.clone(),
            token: Mutex::new(None),
            write_tx,
            monitors: Mutex::new(Vec::new()),
        });

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<WsFrame>(&text) {
                    Ok(frame) => session.clone().dispatch(frame).await,
                    Err(_) => {
                        session
                            .send_error("", BrokerError::InvalidParams("malformed frame".into()))
                            .await
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        let pending: Vec<Unsubscribe> = session.monitors.lock().unwrap().drain(..).collect();
        for unsub in pending {
            unsub().await;
        }
        let disconnect = self.disconnected_pattern(session.id);
        let _ = self.provider.publish(&disconnect, Vec::new(), None).await;
        writer.abort();
    }
}

async fn run_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

/// A single upgraded connection's session state: processed token, active
/// monitor unsubscribe handles, and the serialized write path.
pub struct WsSession {
    id: Uuid,
    edge: Arc<WsEdge>,
    token: Mutex<Option<Vec<u8>>>,
    write_tx: mpsc::Sender<Message>,
    monitors: Mutex<Vec<Unsubscribe>>,
}

impl WsSession {
    async fn dispatch(self: Arc<Self>, frame: WsFrame) {
        match frame.kind.as_str() {
            "token" => self.handle_token(frame).await,
            "request" => self.handle_request(frame).await,
            "publish" => self.handle_publish(frame).await,
            "monitor" => self.handle_monitor(frame).await,
            other => {
                self.send_error(&frame.id, BrokerError::InvalidParams(format!("unsupported frame type {other:?}")))
                    .await
            }
        }
    }

    async fn handle_token(self: Arc<Self>, frame: WsFrame) {
        let raw = frame.token.clone().unwrap_or_default().into_bytes();
        match self.edge.authenticator.validate_token(&raw).await {
            Ok(processed) => {
                let first_handshake = {
                    let mut guard = self.token.lock().unwrap();
                    let was_empty = guard.is_none();
                    *guard = Some(processed.clone());
                    was_empty
                };
                if first_handshake {
                    let pattern = self.edge.connected_pattern();
                    let payload = serde_json::to_vec(&serde_json::json!({ "id": self.id })).unwrap_or_default();
                    let _ = self.edge.provider.publish(&pattern, payload, Some(processed.clone())).await;
                }
                self.send_ack(&frame.id, serde_json::json!({ "token": String::from_utf8_lossy(&processed) }))
                    .await;
            }
            Err(e) => self.send_error(&frame.id, e).await,
        }
    }

    async fn handle_request(self: Arc<Self>, frame: WsFrame) {
        let Some(bound) = resolve(&self.edge.handler_patterns, &frame.endpoint, &frame.method) else {
            self.send_error(&frame.id, BrokerError::NotFound("no matching endpoint".into())).await;
            return;
        };
        let token = match self.authorize(&bound).await {
            Ok(token) => token,
            Err(e) => {
                self.send_error(&frame.id, e).await;
                return;
            }
        };
        let payload = serde_json::to_vec(&frame.data).unwrap_or_default();
        match self.edge.provider.request_bytes(&bound, payload, token).await {
            Ok(bytes) => self.send_response(&frame.id, bytes).await,
            Err(e) => self.send_error(&frame.id, e).await,
        }
    }

    async fn handle_publish(self: Arc<Self>, frame: WsFrame) {
        let Some(bound) = resolve(&self.edge.handler_patterns, &frame.endpoint, &frame.method) else {
            self.send_error(&frame.id, BrokerError::NotFound("no matching endpoint".into())).await;
            return;
        };
        let token = match self.authorize(&bound).await {
            Ok(token) => token,
            Err(e) => {
                self.send_error(&frame.id, e).await;
                return;
            }
        };
        let payload = serde_json::to_vec(&frame.data).unwrap_or_default();
        match self.edge.provider.publish(&bound, payload, token).await {
            Ok(()) => self.send_ack(&frame.id, serde_json::Value::Null).await,
            Err(e) => self.send_error(&frame.id, e).await,
        }
    }

    async fn handle_monitor(self: Arc<Self>, frame: WsFrame) {
        let Some(bound) = resolve(&self.edge.event_patterns, &frame.endpoint, &frame.method) else {
            self.send_error(&frame.id, BrokerError::NotFound("no matching event".into())).await;
            return;
        };
        let token = self.token.lock().unwrap().clone();
        let relay: Arc<dyn CallHandler> =
            Arc::new(WsMonitorRelay { write_tx: self.write_tx.clone(), correlation_id: frame.id.clone() });
        let group = format!("ws-{}", self.id);
        match self.edge.provider.clone().monitor(&group, bound, relay, token).await {
            Ok(unsub) => {
                self.monitors.lock().unwrap().push(unsub);
                self.send_ack(&frame.id, serde_json::Value::Null).await;
            }
            Err(e) => self.send_error(&frame.id, e).await,
        }
    }

    /// Light authorization check before issuing the bus call: rejects a
    /// non-public pattern with no processed token, then consults the
    /// authorizer. The destination service still re-validates through its
    /// own pipeline — this only avoids spending a round trip on calls that
    /// are unauthorized at the edge.
    async fn authorize(&self, pattern: &Pattern) -> Result<Option<Vec<u8>>, BrokerError> {
        let token = self.token.lock().unwrap().clone();
        if pattern.is_public() {
            return Ok(token);
        }
        let raw = token.clone().unwrap_or_default();
        if raw.is_empty() {
            return Err(BrokerError::Unauthorized("missing token".into()));
        }
        let reply = ReplyChannel { subject: String::new(), provider: self.edge.provider.clone() };
        let probe = Call::new(pattern.clone(), Vec::new(), reply);
        if !self.edge.authorizer.has_permission(&probe).await {
            return Err(BrokerError::Forbidden("insufficient permission".into()));
        }
        Ok(token)
    }

    async fn send_ack(&self, id: &str, data: serde_json::Value) {
        self.send_frame(WsFrame {
            id: id.to_string(),
            kind: "response".into(),
            endpoint: String::new(),
            method: String::new(),
            token: None,
            query: None,
            data,
        })
        .await;
    }

    async fn send_response(&self, id: &str, bytes: Vec<u8>) {
        let data = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        self.send_ack(id, data).await;
    }

    async fn send_error(&self, id: &str, err: BrokerError) {
        self.send_frame(WsFrame {
            id: id.to_string(),
            kind: "error".into(),
            endpoint: String::new(),
            method: String::new(),
            token: None,
            query: None,
            data: err.to_json(),
        })
        .await;
    }

    async fn send_frame(&self, frame: WsFrame) {
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = self.write_tx.send(Message::Text(text.into())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rid::Resource;

    struct Sample;

    impl Resource for Sample {
        fn service(&self) -> &str {
            "sample"
        }
        fn http_prefix(&self) -> &str {
            "api"
        }
        fn ws_prefix(&self) -> &str {
            "ws"
        }
        fn patterns(&self) -> Vec<Pattern> {
            vec![Method::new("sample", "api", "get", "get.$ID", Verb::Get).pattern()]
        }
    }

    #[test]
    fn resolve_binds_observed_segments() {
        let patterns = Sample.patterns();
        let bound = resolve(&patterns, "sample.get.42.GET", "GET").unwrap();
        assert_eq!(bound.path_param("ID"), Some("42"));
    }

    #[test]
    fn resolve_rejects_verb_mismatch() {
        let patterns = Sample.patterns();
        assert!(resolve(&patterns, "sample.get.42.GET", "POST").is_none());
    }

    #[test]
    fn resolve_rejects_segment_count_mismatch() {
        let patterns = Sample.patterns();
        assert!(resolve(&patterns, "sample.get.42.extra.GET", "GET").is_none());
    }
}
