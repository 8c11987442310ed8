//! Transports: the uniform `{ok, result | error}` boundary in front of the
//! bridge.
//!
//! [`LocalTransport`] calls the in-process bridge. [`UnifiedTransport`]
//! routes by command prefix and optionally forwards `host.*` commands to a
//! separate host transport.

use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{CommandMeta, KernelBridge};
use crate::kernel::error::KernelError;

/// Envelope or meta is malformed.
pub const INVALID_ENVELOPE: &str = "INVALID_ENVELOPE";
/// Command prefix is missing or not routable.
pub const UNKNOWN_COMMAND_PREFIX: &str = "UNKNOWN_COMMAND_PREFIX";
/// A `host.*` command has nowhere to go.
pub const HOST_UNAVAILABLE: &str = "HOST_UNAVAILABLE";

/// Prefixes served by the local bridge.
const LOCAL_PREFIXES: [&str; 5] = ["kernel", "event", "module", "cache", "schema"];

/// Host command the local bridge can serve itself.
const LOCAL_HOST_COMMAND: &str = "host.modules.scan";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Error half of a [`TransportResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Uniform transport result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Command result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransportError>,
}

impl TransportResponse {
    /// Successful response carrying `result`.
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response with an explicit code.
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(TransportError {
                code: code.to_owned(),
                message: message.into(),
            }),
        }
    }

    /// Failed response carrying the code and message of `err`.
    pub fn from_error(err: &KernelError) -> Self {
        Self::failure(err.code(), err.to_string())
    }

    /// Error code, when failed.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Serializable request shape for out-of-process callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRequestEnvelope {
    /// Correlation id echoed in the response.
    pub id: String,
    /// Command name.
    pub cmd: String,
    /// Command payload.
    #[serde(default)]
    pub payload: Value,
    /// Caller identity.
    pub meta: CommandMeta,
}

/// Response to a [`KernelRequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelResponseEnvelope {
    /// Id of the request this answers.
    pub id: String,
    /// The transport response.
    #[serde(flatten)]
    pub response: TransportResponse,
}

impl KernelResponseEnvelope {
    /// Pair `response` with request `id`.
    pub fn new(id: impl Into<String>, response: TransportResponse) -> Self {
        Self {
            id: id.into(),
            response,
        }
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Anything that can carry a command to a kernel and bring back a response.
#[async_trait(?Send)]
pub trait KernelTransport {
    /// Issue `name` with `payload` on behalf of `meta.source`. Never fails;
    /// errors are encoded in the response.
    async fn request(&self, name: &str, payload: Value, meta: &CommandMeta) -> TransportResponse;

    /// Issue a whole envelope and echo its id.
    async fn request_envelope(&self, envelope: KernelRequestEnvelope) -> KernelResponseEnvelope {
        let response = self
            .request(&envelope.cmd, envelope.payload, &envelope.meta)
            .await;
        KernelResponseEnvelope::new(envelope.id, response)
    }
}

/// In-process transport over a [`KernelBridge`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    bridge: Rc<KernelBridge>,
}

impl LocalTransport {
    /// Wrap `bridge`.
    pub fn new(bridge: Rc<KernelBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait(?Send)]
impl KernelTransport for LocalTransport {
    async fn request(&self, name: &str, payload: Value, meta: &CommandMeta) -> TransportResponse {
        match self.bridge.dispatch(name, payload, meta).await {
            Ok(result) => TransportResponse::success(result),
            Err(err) => {
                warn!(command = name, source = %meta.source, code = err.code(), error = %err, "command failed");
                TransportResponse::from_error(&err)
            }
        }
    }
}

/// Where `host.*` commands go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRouting {
    /// Only `host.modules.scan`, served by the local bridge.
    Local,
    /// Always the host transport.
    Remote,
    /// The host transport when one is attached, otherwise local.
    #[default]
    Auto,
}

/// Prefix router in front of a local transport and an optional host
/// transport.
pub struct UnifiedTransport {
    local: Rc<dyn KernelTransport>,
    host: Option<Rc<dyn KernelTransport>>,
    routing: HostRouting,
}

impl UnifiedTransport {
    /// Route everything to `local`; `host.*` follows `routing`.
    pub fn new(local: Rc<dyn KernelTransport>, routing: HostRouting) -> Self {
        Self {
            local,
            host: None,
            routing,
        }
    }

    /// Attach a transport for `host.*` commands.
    #[must_use]
    pub fn with_host(mut self, host: Rc<dyn KernelTransport>) -> Self {
        self.host = Some(host);
        self
    }

    async fn route_host(&self, name: &str, payload: Value, meta: &CommandMeta) -> TransportResponse {
        let remote = match self.routing {
            HostRouting::Remote => match &self.host {
                Some(host) => Some(host),
                None => {
                    return TransportResponse::failure(HOST_UNAVAILABLE, "host transport unavailable")
                }
            },
            HostRouting::Local => None,
            HostRouting::Auto => self.host.as_ref(),
        };
        if let Some(host) = remote {
            return host.request(name, payload, meta).await;
        }
        if name == LOCAL_HOST_COMMAND {
            return self.local.request(name, payload, meta).await;
        }
        TransportResponse::failure(HOST_UNAVAILABLE, "host commands unavailable")
    }
}

impl std::fmt::Debug for UnifiedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedTransport")
            .field("routing", &self.routing)
            .field("host", &self.host.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait(?Send)]
impl KernelTransport for UnifiedTransport {
    async fn request(&self, name: &str, payload: Value, meta: &CommandMeta) -> TransportResponse {
        if name.is_empty() {
            return TransportResponse::failure(INVALID_ENVELOPE, "command must be a non-empty string");
        }
        if meta.source.is_empty() {
            return TransportResponse::failure(INVALID_ENVELOPE, "missing meta.source");
        }
        let prefix = name.split('.').next().unwrap_or_default();
        if prefix.is_empty() {
            return TransportResponse::failure(UNKNOWN_COMMAND_PREFIX, "missing command prefix");
        }
        if prefix == "host" {
            return self.route_host(name, payload, meta).await;
        }
        if LOCAL_PREFIXES.contains(&prefix) {
            return self.local.request(name, payload, meta).await;
        }
        TransportResponse::failure(UNKNOWN_COMMAND_PREFIX, format!("unknown prefix \"{prefix}\""))
    }
}
