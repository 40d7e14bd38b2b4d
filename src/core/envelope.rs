//! Wire envelopes exchanged over the socket and the fallback channel.
//!
//! Outbound requests follow JSON-RPC 2.0 (`{jsonrpc, method, params, id}`); inbound traffic is
//! either a push (`{type, data}`), a pong (`{type: "pong", timestamp}`) or a response
//! (`{id, result}` / `{id, error}`). Decoding produces the closed [`Inbound`] variant; tags this
//! crate does not know about surface as [`Inbound::Unknown`] so callers can log and drop them.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::types::{FeedError, FeedResult};

pub const SUBSCRIBE_METHOD: &str = "state_stream.subscribe";
pub const UNSUBSCRIBE_METHOD: &str = "state_stream.unsubscribe";

/// Push message kinds understood by the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PushKind {
    BlockUpdate,
    Metrics,
    Network,
    Trading,
    Receipt,
    Gate,
    ComputeJob,
    Ledger,
}

impl PushKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "block_update" => Some(PushKind::BlockUpdate),
            "metrics" => Some(PushKind::Metrics),
            "network" => Some(PushKind::Network),
            "trading" => Some(PushKind::Trading),
            "receipt" => Some(PushKind::Receipt),
            "gate" => Some(PushKind::Gate),
            "compute_job" => Some(PushKind::ComputeJob),
            "ledger" => Some(PushKind::Ledger),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PushKind::BlockUpdate => "block_update",
            PushKind::Metrics => "metrics",
            PushKind::Network => "network",
            PushKind::Trading => "trading",
            PushKind::Receipt => "receipt",
            PushKind::Gate => "gate",
            PushKind::ComputeJob => "compute_job",
            PushKind::Ledger => "ledger",
        }
    }
}

impl fmt::Display for PushKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic-tagged update pushed by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct PushMessage {
    pub kind: PushKind,
    pub data: Value,
    pub timestamp: Option<u64>,
}

/// JSON-RPC error object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A correlated response to a request carrying `id`.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub outcome: Result<Value, RemoteError>,
}

/// Decoded inbound socket message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Pong { timestamp: u64 },
    Response(RpcResponse),
    Push(PushMessage),
    Unknown { tag: String },
}

#[derive(Serialize)]
struct OutboundRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Serialize)]
struct OutboundPing {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: u64,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

/// Keeps `"result": null` distinguishable from a missing `result`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RawEnvelope {
    fn into_response(self) -> Option<RpcResponse> {
        let id = self.id?;
        if let Some(error) = self.error {
            return Some(RpcResponse {
                id,
                outcome: Err(error),
            });
        }
        self.result.map(|result| RpcResponse {
            id,
            outcome: Ok(result),
        })
    }
}

/// Milliseconds since the Unix epoch, saturating on clock errors.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

fn encode<T: Serialize>(value: &T) -> FeedResult<Bytes> {
    sonic_rs::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| FeedError::ProtocolError(format!("encode failed: {err}")))
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> FeedResult<Bytes> {
    encode(&OutboundRequest {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })
}

pub fn encode_subscribe(id: u64, topic: &str) -> FeedResult<Bytes> {
    encode_request(id, SUBSCRIBE_METHOD, &Value::from(vec![topic]))
}

pub fn encode_unsubscribe(id: u64, topic: &str) -> FeedResult<Bytes> {
    encode_request(id, UNSUBSCRIBE_METHOD, &Value::from(vec![topic]))
}

pub fn encode_ping(timestamp: u64) -> FeedResult<Bytes> {
    encode(&OutboundPing {
        kind: "ping",
        timestamp,
    })
}

/// Encode a JSON-RPC batch (array of requests).
pub fn encode_batch<'a, I>(requests: I) -> FeedResult<Bytes>
where
    I: IntoIterator<Item = (u64, &'a str, &'a Value)>,
{
    let batch: Vec<OutboundRequest<'a>> = requests
        .into_iter()
        .map(|(id, method, params)| OutboundRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .collect();
    encode(&batch)
}

/// Decode one inbound socket payload.
pub fn decode_inbound(bytes: &[u8]) -> FeedResult<Inbound> {
    let raw: RawEnvelope = sonic_rs::from_slice(bytes)
        .map_err(|err| FeedError::ProtocolError(format!("malformed envelope: {err}")))?;

    if raw.id.is_some() && (raw.result.is_some() || raw.error.is_some()) {
        if let Some(response) = raw.into_response() {
            return Ok(Inbound::Response(response));
        }
        return Err(FeedError::ProtocolError(
            "response without result".to_string(),
        ));
    }

    let Some(tag) = raw.kind else {
        return Err(FeedError::ProtocolError(
            "envelope has neither type nor id".to_string(),
        ));
    };

    if tag == "pong" {
        let timestamp = raw
            .timestamp
            .ok_or_else(|| FeedError::ProtocolError("pong without timestamp".to_string()))?;
        return Ok(Inbound::Pong { timestamp });
    }

    match PushKind::from_tag(&tag) {
        Some(kind) => Ok(Inbound::Push(PushMessage {
            kind,
            data: raw.data.unwrap_or(Value::Null),
            timestamp: raw.timestamp,
        })),
        None => Ok(Inbound::Unknown { tag }),
    }
}

/// Decode a single response body from the fallback channel.
pub fn decode_response(bytes: &[u8]) -> FeedResult<RpcResponse> {
    let raw: RawEnvelope = sonic_rs::from_slice(bytes)
        .map_err(|err| FeedError::ProtocolError(format!("malformed response: {err}")))?;
    if raw.id.is_none() {
        // Some gateways omit the id on single-call responses.
        let raw = RawEnvelope { id: Some(0), ..raw };
        return raw
            .into_response()
            .ok_or_else(|| FeedError::ProtocolError("response missing result".to_string()));
    }
    raw.into_response()
        .ok_or_else(|| FeedError::ProtocolError("response missing result".to_string()))
}

/// Decode a batch response body; entries without a result or error are reported individually.
pub fn decode_batch(bytes: &[u8]) -> FeedResult<Vec<FeedResult<RpcResponse>>> {
    let raw: Vec<RawEnvelope> = sonic_rs::from_slice(bytes)
        .map_err(|err| FeedError::ProtocolError(format!("malformed batch: {err}")))?;
    Ok(raw
        .into_iter()
        .map(|item| {
            item.into_response().ok_or_else(|| {
                FeedError::ProtocolError("invalid batch response item".to_string())
            })
        })
        .collect())
}
