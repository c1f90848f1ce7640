//! Cloud provider adapters.
//!
//! A [`CloudProvider`] performs create/read/update/delete for every resource
//! kind. The generic [`ProviderAdapter`] implements it on top of a per-cloud
//! [`CloudSchema`] (request paths, methods and payload shapes) and a
//! [`Transport`] (real HTTP or the in-memory [`SimulatedCloud`]).

mod adapter;
mod aws;
mod azure;
mod gcp;
mod http;
mod schema;
mod simulated;
mod transport;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use adapter::ProviderAdapter;
pub use aws::AwsSchema;
pub use azure::AzureSchema;
pub use gcp::GcpSchema;
pub use http::HttpTransport;
pub use schema::CloudSchema;
pub use simulated::{CallRecord, SimulatedCloud};
pub use transport::{ApiRequest, ApiResponse, Operation, OutputField, Transport};

use crate::config::{CloudTarget, ProviderConfig};
use crate::error::{ConfigError, ProviderResult, ReconcilerError, Result};
use crate::graph::{Attributes, NodeId, ResourceNode};
use crate::state::ObservedState;

/// Stored attributes of already-applied dependencies, keyed by node id.
pub type DependencyOutputs = BTreeMap<NodeId, Attributes>;

/// What a provider reports about a resource after an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResource {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Provider-populated attributes (outputs on writes, observed fields on reads).
    pub attributes: Attributes,
}

/// Performs resource operations against one cloud.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The cloud this provider talks to.
    fn cloud(&self) -> CloudTarget;

    /// Creates the resource. Repeating a create with the same desired
    /// attributes returns the existing resource.
    async fn create(
        &self,
        node: &ResourceNode,
        deps: &DependencyOutputs,
    ) -> ProviderResult<ProviderResource>;

    /// Reads the live resource.
    async fn read(&self, observed: &ObservedState) -> ProviderResult<ProviderResource>;

    /// Updates the resource in place.
    async fn update(
        &self,
        node: &ResourceNode,
        current: &ObservedState,
        deps: &DependencyOutputs,
    ) -> ProviderResult<ProviderResource>;

    /// Deletes the resource.
    async fn delete(&self, observed: &ObservedState) -> ProviderResult<()>;
}

/// Builds the provider for `cloud` on top of a transport.
///
/// # Errors
///
/// Returns an error if an identity field the cloud needs is missing.
pub fn provider_for(
    cloud: CloudTarget,
    config: &ProviderConfig,
    transport: Arc<dyn Transport>,
) -> Result<Arc<dyn CloudProvider>> {
    let require = |value: &Option<String>, field: &str| {
        value.clone().ok_or_else(|| {
            ReconcilerError::Config(ConfigError::validation(
                format!("{field} is required for cloud '{cloud}'"),
                field,
            ))
        })
    };

    let provider: Arc<dyn CloudProvider> = match cloud {
        CloudTarget::Azure => Arc::new(ProviderAdapter::new(
            AzureSchema::new(
                require(&config.subscription_id, "provider.subscription_id")?,
                require(&config.resource_group, "provider.resource_group")?,
            ),
            transport,
        )),
        CloudTarget::Aws => Arc::new(ProviderAdapter::new(
            AwsSchema::new(require(&config.account_id, "provider.account_id")?),
            transport,
        )),
        CloudTarget::Gcp => Arc::new(ProviderAdapter::new(
            GcpSchema::new(require(&config.project_id, "provider.project_id")?),
            transport,
        )),
    };

    Ok(provider)
}
