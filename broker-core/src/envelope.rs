//! The call/reply envelope: [`Call`], [`Message`], [`Access`], and the file
//! payload shape used by [`Call::file`].
//!
//! A `Call` does not own its `Provider` — it holds a [`ReplyChannel`]
//! (inbox subject + a handle back to the provider) so that decoding a call
//! never creates a `Call <-> Provider` reference cycle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::provider::Provider;
use crate::rid::Pattern;

/// One hop recorded in a [`Message`]'s trace chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceFrame {
    pub file: String,
    pub line: u32,
}

/// The reply envelope published on an inbox subject.
///
/// `code == 200` is success; `code >= 300` is an error and `message` must
/// be set. `data` absent means "no body". `traces` accumulates one frame
/// per hop a forwarded call passes through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<TraceFrame>,
}

impl Message {
    pub fn ok() -> Self {
        Message { code: 200, data: None, message: None, traces: Vec::new() }
    }

    pub fn ok_with(data: serde_json::Value) -> Self {
        Message { code: 200, data: Some(data), message: None, traces: Vec::new() }
    }

    pub fn from_error(err: &BrokerError) -> Self {
        Message { code: err.code(), data: None, message: Some(err.message()), traces: Vec::new() }
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }

    /// Append a frame to the trace chain. Idempotent in the sense the
    /// taxonomy requires: forwarding an already-traced message appends a
    /// new frame rather than discarding the existing chain.
    pub fn trace(mut self, file: impl Into<String>, line: u32) -> Self {
        self.traces.push(TraceFrame { file: file.into(), line });
        self
    }
}

/// The sentinel reply body that asks the caller to extend its deadline
/// instead of treating the frame as a reply (§4.3).
pub fn timeout_sentinel(extend_by: Duration) -> Vec<u8> {
    let nanos = extend_by.as_nanos().max(Duration::from_millis(100).as_nanos());
    format!("timeout:{nanos}").into_bytes()
}

/// Parses a `timeout:<nanoseconds>` sentinel, clamped to a 100ms minimum.
pub fn parse_timeout_sentinel(body: &[u8]) -> Option<Duration> {
    let text = std::str::from_utf8(body).ok()?;
    let nanos: u64 = text.strip_prefix("timeout:")?.parse().ok()?;
    Some(Duration::from_nanos(nanos).max(Duration::from_millis(100)))
}

/// A file payload, as produced by [`Call::file`] and rendered by the HTTP
/// edge with an `ETag`/`Content-Disposition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// base64-encoded bytes.
    pub data: String,
}

impl FilePayload {
    pub fn new(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            filename: None,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn bytes(&self) -> Result<Vec<u8>, BrokerError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| BrokerError::InvalidParams(e.to_string()))
    }
}

/// Wire shape of the call envelope, v1/v2 dual-encoded (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "Data")]
    pub data: serde_json::Value,
    pub reply: String,
    #[serde(rename = "endpointPattern")]
    pub endpoint_pattern: Pattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "apiVersion")]
    pub api_version: u8,
    // v1 compatibility shims — always emitted so v1 peers can decode.
    #[serde(rename = "Params", default, skip_serializing_if = "Option::is_none")]
    pub params_v1: Option<BTreeMap<String, String>>,
    #[serde(rename = "Token", default, skip_serializing_if = "Option::is_none")]
    pub token_v1: Option<String>,
    #[serde(rename = "Query", default, skip_serializing_if = "Option::is_none")]
    pub query_v1: Option<String>,
}

/// Reply inbox subject plus a handle to the provider that can publish on
/// it. Kept separate from `Call` itself so a `Call` never owns its
/// `Provider` (breaks the cyclic reference the original data model has).
#[derive(Clone)]
pub struct ReplyChannel {
    pub subject: String,
    pub provider: Arc<dyn Provider>,
}

impl ReplyChannel {
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), BrokerError> {
        self.provider.reply(&self.subject, bytes).await
    }
}

/// A single in-flight call: payload, endpoint, token, and a reply channel.
pub struct Call {
    data: Vec<u8>,
    endpoint: Pattern,
    token: Option<Vec<u8>>,
    api_version: u8,
    reply: ReplyChannel,
}

impl Call {
    pub fn new(endpoint: Pattern, data: Vec<u8>, reply: ReplyChannel) -> Self {
        Self { data, endpoint, token: None, api_version: 2, reply }
    }

    /// Reconstruct a `Call` from a decoded wire envelope. `reply` is
    /// supplied by the transport rather than trusted from `envelope.reply`
    /// — the subject the transport actually delivered on is authoritative.
    pub fn from_envelope(envelope: CallEnvelope, reply: ReplyChannel) -> Result<Self, BrokerError> {
        let data = match &envelope.data {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::String(s) => s.clone().into_bytes(),
            other => serde_json::to_vec(other)?,
        };
        let token = envelope
            .token
            .or(envelope.token_v1)
            .map(|t| t.into_bytes());
        Ok(Self {
            data,
            endpoint: envelope.endpoint_pattern,
            token,
            api_version: envelope.api_version,
            reply,
        })
    }

    pub fn to_envelope(&self) -> CallEnvelope {
        let data_value = serde_json::from_slice(&self.data).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.data).into_owned())
        });
        let token_str = self.token.as_ref().map(|t| String::from_utf8_lossy(t).into_owned());
        CallEnvelope {
            data: data_value,
            reply: self.reply.subject.clone(),
            endpoint_pattern: self.endpoint.clone(),
            token: token_str.clone(),
            api_version: self.api_version,
            params_v1: None,
            token_v1: token_str,
            query_v1: self.endpoint.query().map(|q| q.to_string()),
        }
    }

    pub fn endpoint(&self) -> &Pattern {
        &self.endpoint
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_token(&self) -> &[u8] {
        self.token.as_deref().unwrap_or(&[])
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = Some(token);
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.endpoint.path_param(name)
    }

    pub fn query_params(&self) -> BTreeMap<String, String> {
        self.endpoint
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }

    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_slice(&self.data).map_err(BrokerError::from)
    }

    pub fn reply_channel(&self) -> &ReplyChannel {
        &self.reply
    }

    pub async fn ok(&self) -> Result<(), BrokerError> {
        self.reply_message(Message::ok()).await
    }

    pub async fn ok_with<T: Serialize>(&self, value: &T) -> Result<(), BrokerError> {
        let data = serde_json::to_value(value)?;
        self.reply_message(Message::ok_with(data)).await
    }

    pub async fn file(&self, payload: FilePayload) -> Result<(), BrokerError> {
        self.ok_with(&payload).await
    }

    pub async fn not_found(&self) -> Result<(), BrokerError> {
        self.error(BrokerError::NotFound("not found".into())).await
    }

    pub async fn error(&self, err: BrokerError) -> Result<(), BrokerError> {
        self.reply_message(Message::from_error(&err)).await
    }

    /// Ask the caller to extend its wait deadline instead of replying yet.
    pub async fn extend_timeout(&self, by: Duration) -> Result<(), BrokerError> {
        self.reply.send(timeout_sentinel(by)).await
    }

    async fn reply_message(&self, msg: Message) -> Result<(), BrokerError> {
        let bytes = serde_json::to_vec(&msg)?;
        self.reply.send(bytes).await
    }
}

/// Verdict produced by an [`Access`] validator.
#[derive(Clone)]
pub enum Verdict {
    Pending,
    Granted,
    Denied(BrokerError),
}

/// A restricted view of a `Call` used by validators: the only replies it
/// can produce are `access_granted`/`access_denied`.
pub struct Access<'a> {
    call: &'a Call,
    verdict: Mutex<Verdict>,
}

impl<'a> Access<'a> {
    pub fn new(call: &'a Call) -> Self {
        Self { call, verdict: Mutex::new(Verdict::Pending) }
    }

    pub fn raw_token(&self) -> &[u8] {
        self.call.raw_token()
    }

    pub fn endpoint(&self) -> &Pattern {
        self.call.endpoint()
    }

    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        self.call.parse_data()
    }

    pub fn access_granted(&self) {
        *self.verdict.lock().unwrap() = Verdict::Granted;
    }

    pub fn access_denied(&self, err: Option<BrokerError>) {
        *self.verdict.lock().unwrap() =
            Verdict::Denied(err.unwrap_or_else(|| BrokerError::Forbidden("access denied".into())));
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_sentinel_round_trips() {
        let bytes = timeout_sentinel(Duration::from_secs(2));
        assert_eq!(parse_timeout_sentinel(&bytes), Some(Duration::from_secs(2)));
    }

    #[test]
    fn timeout_sentinel_clamps_to_minimum() {
        let bytes = timeout_sentinel(Duration::from_millis(1));
        assert_eq!(parse_timeout_sentinel(&bytes), Some(Duration::from_millis(100)));
    }

    #[test]
    fn non_sentinel_body_is_not_a_timeout() {
        assert!(parse_timeout_sentinel(br#"{"code":200}"#).is_none());
    }

    #[test]
    fn trace_appends_rather_than_replaces() {
        let msg = Message::ok().trace("a.rs", 1).trace("b.rs", 2);
        assert_eq!(msg.traces, vec![
            TraceFrame { file: "a.rs".into(), line: 1 },
            TraceFrame { file: "b.rs".into(), line: 2 },
        ]);
    }

    #[test]
    fn file_payload_round_trips_bytes() {
        let payload = FilePayload::new("image/webp", b"abc").with_filename("linux.webp");
        assert_eq!(payload.bytes().unwrap(), b"abc");
        assert_eq!(payload.filename.as_deref(), Some("linux.webp"));
    }
}
