//! Generic [`CloudProvider`] built from a schema and a transport.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::schema::{CloudSchema, ID_ATTRIBUTE};
use super::transport::{ApiRequest, Operation, OutputField, Transport};
use super::{CloudProvider, DependencyOutputs, ProviderResource};
use crate::config::{CloudTarget, SpecHasher};
use crate::error::{ProviderError, ProviderResult};
use crate::graph::{Attributes, NodeId, ResourceKind, ResourceNode};
use crate::state::ObservedState;

/// Status a create returns when the resource already exists.
const CONFLICT: u16 = 409;

/// Provider adapter for one cloud.
pub struct ProviderAdapter<S> {
    schema: S,
    transport: Arc<dyn Transport>,
    hasher: SpecHasher,
}

impl<S: CloudSchema> ProviderAdapter<S> {
    /// Creates an adapter.
    pub fn new(schema: S, transport: Arc<dyn Transport>) -> Self {
        Self {
            schema,
            transport,
            hasher: SpecHasher::new(),
        }
    }

    fn request(
        &self,
        id: &NodeId,
        operation: Operation,
        (method, path): (Method, String),
        resource: String,
        body: Option<Value>,
    ) -> ApiRequest {
        ApiRequest {
            node: id.clone(),
            operation,
            method,
            path,
            resource,
            body,
            client_token: None,
            envelope: self.schema.envelope(id.kind()),
            outputs: self.schema.outputs(id.kind()),
        }
    }

    /// Projects a response body onto node attributes.
    fn extract(&self, kind: ResourceKind, body: &Value, fields: &[&[OutputField]]) -> Attributes {
        let resource = self
            .schema
            .envelope(kind)
            .and_then(|key| body.get(key))
            .unwrap_or(body);

        fields
            .iter()
            .flat_map(|set| set.iter())
            .filter_map(|field| {
                resource
                    .pointer(field.pointer)
                    .filter(|v| !v.is_null())
                    .map(|v| (field.attribute.to_string(), v.clone()))
            })
            .collect()
    }

    fn provider_resource(attributes: Attributes, resource_path: &str) -> ProviderResource {
        let provider_id = attributes
            .get(ID_ATTRIBUTE)
            .and_then(Value::as_str)
            .map_or_else(|| resource_path.to_string(), str::to_string);
        ProviderResource {
            provider_id,
            attributes,
        }
    }

    async fn get(
        &self,
        id: &NodeId,
        attrs: &Attributes,
        with_observed: bool,
    ) -> ProviderResult<ProviderResource> {
        let resource = self.schema.item_path(id, attrs);
        let request = self.request(
            id,
            Operation::Read,
            (Method::GET, resource.clone()),
            resource.clone(),
            None,
        );
        let response = self.transport.send(request).await?;

        let kind = id.kind();
        let observed: &[OutputField] = if with_observed { self.schema.observed(kind) } else { &[] };
        let attributes = self.extract(kind, &response.body, &[self.schema.outputs(kind), observed]);
        Ok(Self::provider_resource(attributes, &resource))
    }
}

#[async_trait]
impl<S: CloudSchema> CloudProvider for ProviderAdapter<S> {
    fn cloud(&self) -> CloudTarget {
        self.schema.cloud()
    }

    async fn create(
        &self,
        node: &ResourceNode,
        deps: &DependencyOutputs,
    ) -> ProviderResult<ProviderResource> {
        let kind = node.kind();
        let route = self.schema.create_route(&node.id, &node.attributes);
        let resource = self.schema.item_path(&node.id, &node.attributes);

        let fingerprint = self.hasher.hash_attributes(&node.attributes);
        let token = self.hasher.client_token(&node.id.to_string(), &fingerprint);

        let mut body = self.schema.payload(node, deps)?;
        if let (Some(field), Value::Object(map)) = (self.schema.client_token_field(kind), &mut body) {
            map.insert(field.to_string(), Value::String(token.clone()));
        }

        let mut request = self.request(&node.id, Operation::Create, route, resource.clone(), Some(body));
        request.client_token = Some(token);

        match self.transport.send(request).await {
            Ok(response) => {
                let attributes = self.extract(kind, &response.body, &[self.schema.outputs(kind)]);
                info!("Created {}", node.id);
                Ok(Self::provider_resource(attributes, &resource))
            }
            Err(ProviderError::Permanent { status: CONFLICT, .. }) => {
                // Outputs only, as for a fresh create.
                debug!("{} already exists, reading it back", node.id);
                self.get(&node.id, &node.attributes, false).await
            }
            Err(e) => Err(e),
        }
    }

    async fn read(&self, observed: &ObservedState) -> ProviderResult<ProviderResource> {
        self.get(&observed.id, &observed.attributes, true).await
    }

    async fn update(
        &self,
        node: &ResourceNode,
        current: &ObservedState,
        deps: &DependencyOutputs,
    ) -> ProviderResult<ProviderResource> {
        let kind = node.kind();

        // Stored outputs stay addressable while desired values win.
        let mut route_attrs = current.attributes.clone();
        route_attrs.extend(node.attributes.clone());

        let route = self.schema.update_route(&node.id, &route_attrs);
        let resource = self.schema.item_path(&node.id, &route_attrs);
        let body = self.schema.payload(node, deps)?;

        let request = self.request(&node.id, Operation::Update, route, resource.clone(), Some(body));
        let response = self.transport.send(request).await?;

        let attributes = self.extract(kind, &response.body, &[self.schema.outputs(kind)]);
        info!("Updated {}", node.id);

        let mut resource_out = Self::provider_resource(attributes, &resource);
        if resource_out.attributes.get(ID_ATTRIBUTE).is_none() && !current.provider_id.is_empty() {
            resource_out.provider_id.clone_from(&current.provider_id);
        }
        Ok(resource_out)
    }

    async fn delete(&self, observed: &ObservedState) -> ProviderResult<()> {
        let resource = self.schema.item_path(&observed.id, &observed.attributes);
        let request = self.request(
            &observed.id,
            Operation::Delete,
            (Method::DELETE, resource.clone()),
            resource,
            None,
        );
        self.transport.send(request).await?;
        info!("Deleted {}", observed.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AwsSchema, HttpTransport};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool() -> ResourceNode {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), json!("default"));
        attrs.insert(String::from("cluster"), json!("prod"));
        attrs.insert(String::from("instance_class"), json!("m6i.large"));
        attrs.insert(String::from("min_count"), json!(1));
        attrs.insert(String::from("max_count"), json!(3));
        attrs.insert(String::from("desired_count"), json!(1));
        ResourceNode::new(NodeId::new(ResourceKind::NodePool, "default"), attrs)
    }

    async fn adapter(server: &MockServer) -> ProviderAdapter<AwsSchema> {
        let transport = HttpTransport::new(&server.uri(), "secret").unwrap();
        ProviderAdapter::new(AwsSchema::new("123456789012"), Arc::new(transport))
    }

    #[tokio::test]
    async fn test_create_extracts_outputs_from_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/clusters/prod/node-groups"))
            .and(body_partial_json(json!({"nodegroupName": "default"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodegroup": {
                    "nodegroupArn": "arn:aws:eks:eu-west-1:1:nodegroup/prod/default/x",
                    "status": "CREATING",
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let created = adapter.create(&pool(), &DependencyOutputs::new()).await.unwrap();

        assert_eq!(created.provider_id, "arn:aws:eks:eu-west-1:1:nodegroup/prod/default/x");
        assert_eq!(created.attributes["status"], json!("CREATING"));
    }

    #[tokio::test]
    async fn test_conflict_on_create_reads_existing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/clusters/prod/node-groups"))
            .respond_with(ResponseTemplate::new(409).set_body_string("ResourceInUseException"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clusters/prod/node-groups/default"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodegroup": {
                    "nodegroupArn": "arn:existing",
                    "scalingConfig": {"minSize": 1, "maxSize": 3, "desiredSize": 1},
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let existing = adapter.create(&pool(), &DependencyOutputs::new()).await.unwrap();

        assert_eq!(existing.provider_id, "arn:existing");
        assert!(!existing.attributes.contains_key("max_count"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/clusters/prod/node-groups/default"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let node = pool();
        let observed = ObservedState::new(node.id.clone(), "arn:x", node.attributes, vec![]);

        let err = adapter.delete(&observed).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }
}
