//! Transport seam between schemas and the wire.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::ProviderResult;
use crate::graph::NodeId;

/// Kind of provider operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create a resource.
    Create,
    /// Read a resource.
    Read,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Maps a node attribute to a JSON pointer in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputField {
    /// Attribute name stored in observed state.
    pub attribute: &'static str,
    /// JSON pointer into the response body.
    pub pointer: &'static str,
}

impl OutputField {
    /// Creates an output mapping.
    #[must_use]
    pub const fn new(attribute: &'static str, pointer: &'static str) -> Self {
        Self { attribute, pointer }
    }
}

/// A single cloud API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Node this request acts on.
    pub node: NodeId,
    /// Operation performed.
    pub operation: Operation,
    /// HTTP method.
    pub method: Method,
    /// Path relative to the provider endpoint, query string included.
    pub path: String,
    /// Canonical path of the resource, used by reads after a conflict.
    pub resource: String,
    /// JSON body, if any.
    pub body: Option<Value>,
    /// Idempotency token for creates.
    pub client_token: Option<String>,
    /// Key under which the API wraps the resource in responses.
    pub envelope: Option<&'static str>,
    /// Attributes the provider populates.
    pub outputs: &'static [OutputField],
}

/// A successful cloud API response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body; `Null` for empty bodies.
    pub body: Value,
}

/// Sends requests to a cloud API.
///
/// Implementations classify every failure into a
/// [`ProviderError`](crate::error::ProviderError) variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request.
    async fn send(&self, request: ApiRequest) -> ProviderResult<ApiResponse>;
}
