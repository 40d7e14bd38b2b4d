//! Unary JSON-RPC calls with deduplication, retry and per-attempt timeouts.

pub mod client;
pub mod http;
pub mod pending;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

pub use client::*;
pub use http::*;
pub use pending::*;

/// Convenience result alias for call-level operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Why a single transport attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("socket not connected")]
    NotConnected,

    #[error("non-success status {0}")]
    Status(u16),

    #[error("unauthorized (status {0})")]
    Unauthorized(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("offline mode")]
    Offline,
}

impl AttemptError {
    /// Deterministic failures are not worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AttemptError::Unauthorized(_) | AttemptError::Remote { .. } | AttemptError::Offline
        )
    }
}

/// Final outcome of a call as seen by every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("call to {method} timed out after {attempts} attempt(s)")]
    Timeout { method: String, attempts: u32 },

    #[error("call to {method} failed after {attempts} attempt(s): {last}")]
    CallFailed {
        method: String,
        attempts: u32,
        last: AttemptError,
    },

    #[error("call cancelled")]
    Cancelled,
}

/// 64-bit digest of a call: FNV-1a over `method`, a NUL separator and the canonical JSON of
/// `params`.
pub type Fingerprint = u64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(state: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(state, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Serialize `value` with object keys sorted, so equal params always hash equally.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn fingerprint(method: &str, params: &Value) -> Fingerprint {
    RequestKey::new(method, params).fingerprint()
}

/// Identity of a unary call: the method plus its params in canonical form.
///
/// Calls are deduplicated on the full key; the [`Fingerprint`] digest is only a short label for
/// logs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    method: String,
    params: String,
}

impl RequestKey {
    pub fn new(method: &str, params: &Value) -> Self {
        Self {
            method: method.to_string(),
            params: canonical_json(params),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn canonical_params(&self) -> &str {
        &self.params
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let hash = fnv1a64(FNV_OFFSET, self.method.as_bytes());
        let hash = fnv1a64(hash, &[0]);
        fnv1a64(hash, self.params.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a64(FNV_OFFSET, b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(FNV_OFFSET, b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
        assert_eq!(fingerprint("m", &a), fingerprint("m", &b));
    }

    #[test]
    fn method_and_params_are_separated() {
        assert_ne!(
            fingerprint("ab", &json!("c")),
            fingerprint("a", &json!("bc"))
        );
        assert_ne!(
            fingerprint("governor.status", &json!({})),
            fingerprint("consensus.tps", &json!({}))
        );
    }

    #[test]
    fn request_keys_compare_the_full_call() {
        let a = RequestKey::new("m", &json!({"b": 1, "a": 2}));
        let b = RequestKey::new("m", &json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
        assert_eq!(a.canonical_params(), r#"{"a":2,"b":1}"#);
        assert_ne!(a, RequestKey::new("m", &json!({"a": 2, "b": 2})));
        assert_ne!(a, RequestKey::new("n", &json!({"a": 2, "b": 1})));
        assert_eq!(a.method(), "m");
    }

    #[test]
    fn deterministic_failures_are_not_retryable() {
        assert!(!AttemptError::Unauthorized(401).is_retryable());
        assert!(
            !AttemptError::Remote {
                code: -32601,
                message: "nope".into()
            }
            .is_retryable()
        );
        assert!(AttemptError::Status(503).is_retryable());
        assert!(AttemptError::TimedOut(Duration::from_secs(1)).is_retryable());
    }
}
