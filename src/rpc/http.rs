//! Request-per-call fallback channel: JSON-RPC 2.0 over HTTP POST.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use super::AttemptError;
use crate::core::{FeedError, decode_batch, decode_response, encode_batch, encode_request};

pub type FallbackFuture<T> = Pin<Box<dyn Future<Output = Result<T, AttemptError>> + Send>>;

/// One request in a batch; `id` is assigned by the caller and used to match responses.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchItem {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Transport used when the socket is not open.
///
/// Implementations own their inputs (the returned future is `'static`) so the RPC client can
/// bound them with a timeout and abort them freely.
pub trait FallbackChannel: Send + Sync + 'static {
    fn call(&self, id: u64, method: &str, params: &Value) -> FallbackFuture<Value>;

    /// Send every item in one round-trip. The outer error is a transport failure; inner results
    /// are per item, in the order of `items`.
    fn call_batch(&self, items: Vec<BatchItem>) -> FallbackFuture<Vec<Result<Value, AttemptError>>>;
}

fn classify_status(status: StatusCode) -> Result<(), AttemptError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AttemptError::Unauthorized(status.as_u16()));
    }
    if !status.is_success() {
        return Err(AttemptError::Status(status.as_u16()));
    }
    Ok(())
}

fn malformed(err: FeedError) -> AttemptError {
    AttemptError::Malformed(err.to_string())
}

/// reqwest-backed [`FallbackChannel`].
#[derive(Clone, Debug)]
pub struct HttpFallback {
    client: reqwest::Client,
    url: String,
}

impl HttpFallback {
    pub fn new(url: impl Into<String>) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| FeedError::Transport {
                context: "http client",
                error: err.to_string(),
            })?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(client: reqwest::Client, url: String, body: Bytes) -> Result<Bytes, AttemptError> {
        let response = client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| AttemptError::Connection(err.to_string()))?;

        classify_status(response.status())?;

        response
            .bytes()
            .await
            .map_err(|err| AttemptError::Connection(err.to_string()))
    }
}

impl FallbackChannel for HttpFallback {
    fn call(&self, id: u64, method: &str, params: &Value) -> FallbackFuture<Value> {
        let client = self.client.clone();
        let url = self.url.clone();
        let body = encode_request(id, method, params);
        Box::pin(async move {
            let body = body.map_err(malformed)?;
            let bytes = Self::post(client, url, body).await?;
            let response = decode_response(&bytes).map_err(malformed)?;
            response.outcome.map_err(|err| AttemptError::Remote {
                code: err.code,
                message: err.message,
            })
        })
    }

    fn call_batch(&self, items: Vec<BatchItem>) -> FallbackFuture<Vec<Result<Value, AttemptError>>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let body = encode_batch(
            items
                .iter()
                .map(|item| (item.id, item.method.as_str(), &item.params)),
        );
        Box::pin(async move {
            let body = body.map_err(malformed)?;
            let bytes = Self::post(client, url, body).await?;
            let responses = decode_batch(&bytes).map_err(malformed)?;
            Ok(match_batch(&items, responses))
        })
    }
}

/// Order per-item outcomes by request id; servers may answer a batch in any order.
pub fn match_batch(
    items: &[BatchItem],
    responses: Vec<Result<crate::core::RpcResponse, FeedError>>,
) -> Vec<Result<Value, AttemptError>> {
    let mut by_id = std::collections::HashMap::with_capacity(responses.len());
    for response in responses.into_iter().flatten() {
        by_id.insert(response.id, response.outcome);
    }
    items
        .iter()
        .map(|item| match by_id.remove(&item.id) {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(AttemptError::Remote {
                code: err.code,
                message: err.message,
            }),
            None => Err(AttemptError::Malformed(format!(
                "no response for batch item {}",
                item.id
            ))),
        })
        .collect()
}
