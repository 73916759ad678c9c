//! Versioned resource templates
//!
//! A template is a JSON Schema describing the properties a resource of a
//! given kind accepts. Templates are looked up by (type, name, version); a
//! lookup without a version resolves the template's current version.

use crate::error::{OrchestratorError, Result};
use crate::resource::{Properties, ResourceType};
use crate::store::{query_stream, Container, DocumentQuery, DocumentStore};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub version: String,
    pub resource_type: ResourceType,
    /// The version new resources get when none is requested
    pub current: bool,
    pub schema: Value,
}

impl Template {
    pub fn document_id(resource_type: ResourceType, name: &str, version: &str) -> String {
        format!("{}:{}:{}", resource_type, name, version)
    }

    /// Fill in schema defaults for absent properties, then check the result
    /// against the schema. Returns the resolved properties.
    pub fn resolve_properties(&self, properties: &Properties) -> Result<Properties> {
        let mut resolved = properties.clone();

        if let Some(declared) = self.schema.get("properties").and_then(Value::as_object) {
            for (key, definition) in declared {
                if let Some(default) = definition.get("default") {
                    resolved
                        .entry(key.clone())
                        .or_insert_with(|| default.clone());
                }
            }
        }

        self.validate(&resolved)?;
        Ok(resolved)
    }

    pub fn validate(&self, properties: &Properties) -> Result<()> {
        let validator = jsonschema::validator_for(&self.schema).map_err(|e| {
            OrchestratorError::Validation(format!(
                "template {} {} has an invalid schema: {}",
                self.name, self.version, e
            ))
        })?;

        let instance = Value::Object(properties.clone());
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(errors.join("; ")))
        }
    }
}

#[async_trait]
pub trait TemplateProvider: Send + Sync {
    /// Fails with `TemplateNotFound` if no such template exists.
    async fn get_template(
        &self,
        name: &str,
        version: Option<&str>,
        resource_type: ResourceType,
    ) -> Result<Arc<Template>>;
}

fn template_not_found(
    name: &str,
    version: Option<&str>,
    resource_type: ResourceType,
) -> OrchestratorError {
    OrchestratorError::TemplateNotFound {
        name: name.to_string(),
        version: version.unwrap_or("current").to_string(),
        resource_type: resource_type.to_string(),
    }
}

/// Templates stored in the `templates` document container
#[derive(Clone)]
pub struct TemplateRepository {
    store: Arc<dyn DocumentStore>,
}

impl TemplateRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Store a new template version. Registering a `current` version demotes
    /// the previously current one.
    #[instrument(skip(self, template), fields(name = %template.name, version = %template.version))]
    pub async fn register(&self, template: Template) -> Result<Template> {
        // Rejects unusable schemas up front
        jsonschema::validator_for(&template.schema).map_err(|e| {
            OrchestratorError::Validation(format!("invalid template schema: {}", e))
        })?;

        let id = Template::document_id(template.resource_type, &template.name, &template.version);
        match self.store.read_item(Container::Templates, &id).await {
            Ok(_) => {
                return Err(OrchestratorError::Conflict(format!(
                    "template {} is already registered",
                    id
                )))
            }
            Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if template.current {
            for previous in self.current_versions(&template.name, template.resource_type).await? {
                let (mut demoted, etag) = previous;
                demoted.current = false;
                let id =
                    Template::document_id(demoted.resource_type, &demoted.name, &demoted.version);
                self.store
                    .conditional_replace(
                        Container::Templates,
                        &id,
                        &serde_json::to_value(&demoted)?,
                        &etag,
                    )
                    .await?;
                debug!(previous = %demoted.version, "Demoted previous current template");
            }
        }

        self.store
            .create_item(Container::Templates, &id, &serde_json::to_value(&template)?)
            .await?;
        info!(resource_type = %template.resource_type, "Template registered");

        Ok(template)
    }

    async fn current_versions(
        &self,
        name: &str,
        resource_type: ResourceType,
    ) -> Result<Vec<(Template, String)>> {
        let query = DocumentQuery::new(Container::Templates)
            .field_eq("name", name)
            .field_eq("resourceType", resource_type.as_str())
            .field_eq("current", true);

        let documents: Vec<_> = query_stream(self.store.clone(), query, 20)
            .try_collect()
            .await?;

        documents
            .into_iter()
            .map(|d| -> Result<(Template, String)> {
                Ok((serde_json::from_value(d.body)?, d.etag))
            })
            .collect()
    }
}

#[async_trait]
impl TemplateProvider for TemplateRepository {
    async fn get_template(
        &self,
        name: &str,
        version: Option<&str>,
        resource_type: ResourceType,
    ) -> Result<Arc<Template>> {
        match version {
            Some(version) => {
                let id = Template::document_id(resource_type, name, version);
                match self.store.read_item(Container::Templates, &id).await {
                    Ok(document) => Ok(Arc::new(serde_json::from_value(document.body)?)),
                    Err(OrchestratorError::NotFound(_)) => {
                        Err(template_not_found(name, Some(version), resource_type))
                    }
                    Err(e) => Err(e),
                }
            }
            None => self
                .current_versions(name, resource_type)
                .await?
                .into_iter()
                .next()
                .map(|(template, _)| Arc::new(template))
                .ok_or_else(|| template_not_found(name, None, resource_type)),
        }
    }
}

type CacheKey = (ResourceType, String, Option<String>);

/// Time-bounded cache in front of another [`TemplateProvider`]
///
/// Owned and injected by whoever builds the repositories; entries expire
/// after `ttl` or on [`invalidate`](Self::invalidate).
pub struct CachedTemplateProvider<P> {
    inner: P,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, (Instant, Arc<Template>)>>,
}

impl<P: TemplateProvider> CachedTemplateProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<P: TemplateProvider> TemplateProvider for CachedTemplateProvider<P> {
    async fn get_template(
        &self,
        name: &str,
        version: Option<&str>,
        resource_type: ResourceType,
    ) -> Result<Arc<Template>> {
        let key = (resource_type, name.to_string(), version.map(str::to_string));

        {
            let entries = self.entries.read().await;
            if let Some((cached_at, template)) = entries.get(&key) {
                if cached_at.elapsed() < self.ttl {
                    debug!(name, ?version, "Template found in cache");
                    return Ok(template.clone());
                }
            }
        }

        let template = self.inner.get_template(name, version, resource_type).await?;
        self.entries
            .write()
            .await
            .insert(key, (Instant::now(), template.clone()));

        Ok(template)
    }
}
