//! Remote agent delegation.
//!
//! Agents are reached through an [`AgentTransport`]. The dispatcher builds a
//! [`DelegationRequest`] and sends it through the recovery layer's circuit
//! breaker for that target; the transport only moves bytes and maps
//! transport failures into the error taxonomy.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use relay_types::{BackendRef, DispatchError};

/// A unit of work handed to a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub target: BackendRef,
    pub payload: Value,
    /// Fingerprint of the dispatch, so a remote side can deduplicate replays.
    pub idempotency_key: String,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Delegation depth of the remote work, one more than the caller's.
    pub depth: u32,
}

/// What a remote agent answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cost: f64,
}

impl DelegationResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            latency_ms: 0,
            cost: 0.0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            latency_ms: 0,
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Moves a delegation to a remote agent and back.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn delegate(&self, request: DelegationRequest) -> Result<DelegationResponse, DispatchError>;
}

// ── HTTP transport ──────────────────────────────────────────────────

/// JSON-over-HTTP transport posting each delegation to one endpoint.
#[derive(Debug, Clone)]
pub struct HttpAgentTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAgentTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DispatchError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn delegate(&self, request: DelegationRequest) -> Result<DelegationResponse, DispatchError> {
        let started = Instant::now();
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .header("Idempotency-Key", &request.idempotency_key)
            .header("X-Relay-Depth", request.depth.to_string())
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| map_transport_error(&e, request.timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(&e, request.timeout))?;
        debug!(
            endpoint = %self.endpoint,
            status,
            latency_ms = started.elapsed().as_millis() as u64,
            "Agent responded"
        );

        if let Some(error) = map_status(status, &body) {
            return Err(error);
        }

        let mut parsed: DelegationResponse = serde_json::from_str(&body)
            .map_err(|e| DispatchError::Validation(format!("malformed agent response: {e}")))?;
        if parsed.latency_ms == 0 {
            parsed.latency_ms = started.elapsed().as_millis() as u64;
        }
        Ok(parsed)
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn map_status(status: u16, body: &str) -> Option<DispatchError> {
    let detail = || {
        let mut text: String = body.chars().take(200).collect();
        if text.is_empty() {
            text = format!("HTTP {status}");
        }
        text
    };
    match status {
        200..=299 => None,
        401 | 403 => Some(DispatchError::Unauthorized(detail())),
        408 | 429 => Some(DispatchError::Connection(format!("HTTP {status}: {}", detail()))),
        500..=599 => Some(DispatchError::Connection(format!("HTTP {status}: {}", detail()))),
        _ => Some(DispatchError::Validation(format!("HTTP {status}: {}", detail()))),
    }
}

fn map_transport_error(error: &reqwest::Error, timeout: Duration) -> DispatchError {
    if error.is_timeout() {
        DispatchError::timeout(timeout)
    } else if error.is_connect() || error.is_request() || error.is_body() {
        DispatchError::Connection(error.to_string())
    } else {
        DispatchError::Internal(error.to_string())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
