//! Resource persistence
//!
//! [`ResourceRepository`] maps workspaces, workspace services and shared
//! services onto documents in the `resources` container. Every write is
//! conditional on the etag the caller read, so concurrent writers never
//! overwrite each other silently.

use crate::error::{OrchestratorError, Result};
use crate::resource::{
    KindPolicy, NewResource, Properties, Resource, ResourceHistoryItem, ResourcePatch,
    ResourceStatus, ResourceType,
};
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::store::{query_stream, Container, DocumentQuery, DocumentStore};
use crate::template::TemplateProvider;
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub type ResourceStream = BoxStream<'static, Result<Resource>>;

/// How much patch history a resource document keeps inline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryPolicy {
    #[default]
    Unbounded,
    /// Keep the newest `keep` entries in the document and move older ones to
    /// the history archive.
    ///
    /// Entries are archived before the document is replaced. A patch that then
    /// loses on its etag leaves its archived rows behind, so the archive can
    /// hold an entry the stored document still carries inline. Both copies
    /// describe the same `resourceVersion`; `archivedHistoryCount` only counts
    /// entries a successful patch removed.
    Capped { keep: usize },
}

#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub history: HistoryPolicy,
    pub page_size: u32,
    /// Properties the platform sets on every resource. They win over
    /// anything a caller supplies.
    pub system_properties: Properties,
    pub retry: RetryPolicy,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            history: HistoryPolicy::Unbounded,
            page_size: 100,
            system_properties: Properties::new(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Equality filters for [`ResourceRepository::query_active`]
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub parent_workspace_id: Option<Uuid>,
    pub template_name: Option<String>,
    pub status: Option<ResourceStatus>,
    pub properties: Vec<(String, Value)>,
}

impl ResourceFilter {
    pub fn in_workspace(workspace_id: Uuid) -> Self {
        Self {
            parent_workspace_id: Some(workspace_id),
            ..Default::default()
        }
    }

    pub fn template(mut self, name: &str) -> Self {
        self.template_name = Some(name.to_string());
        self
    }

    pub fn status(mut self, status: ResourceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.push((key.to_string(), value.into()));
        self
    }

    fn apply(&self, mut query: DocumentQuery) -> DocumentQuery {
        if let Some(parent) = self.parent_workspace_id {
            query = query.field_eq("parentWorkspaceId", parent.to_string());
        }
        if let Some(name) = &self.template_name {
            query = query.field_eq("templateName", name.as_str());
        }
        if let Some(status) = self.status {
            query = query.field_eq("status", status.as_str());
        }
        for (key, value) in &self.properties {
            query = query.field_eq(format!("properties.{}", key), value.clone());
        }
        query
    }
}

#[derive(Clone)]
pub struct ResourceRepository {
    store: Arc<dyn DocumentStore>,
    templates: Arc<dyn TemplateProvider>,
    options: RepositoryOptions,
}

impl ResourceRepository {
    pub fn new(store: Arc<dyn DocumentStore>, templates: Arc<dyn TemplateProvider>) -> Self {
        Self::with_options(store, templates, RepositoryOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn DocumentStore>,
        templates: Arc<dyn TemplateProvider>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            store,
            templates,
            options,
        }
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    /// Validate and persist a new resource in `not_deployed` state.
    #[instrument(
        skip(self, new),
        fields(resource_type = %new.resource_type, template = %new.template_name)
    )]
    pub async fn create(&self, new: NewResource) -> Result<Resource> {
        let policy = new.resource_type.policy();
        let template = self
            .templates
            .get_template(
                &new.template_name,
                new.template_version.as_deref(),
                new.resource_type,
            )
            .await?;

        let parent = self.check_parent(&new, policy).await?;
        let mut properties = template.resolve_properties(&new.properties)?;
        self.apply_system_properties(&mut properties, policy, parent.as_ref());

        let resource_type = new.resource_type;
        let template_name = template.name.clone();
        let template_version = template.version.clone();

        let created = retry_on_conflict(&self.options.retry, "create_resource", |attempt| {
            let id = Uuid::new_v4();
            if attempt > 1 {
                debug!(%id, attempt, "Resource id collided, retrying with a fresh id");
            }
            let resource = Resource {
                id,
                resource_type,
                template_name: template_name.clone(),
                template_version: template_version.clone(),
                parent_workspace_id: parent,
                resource_path: (policy.resource_path)(&id, parent.as_ref()),
                properties: properties.clone(),
                is_enabled: true,
                status: ResourceStatus::NotDeployed,
                status_message: None,
                operation_id: None,
                status_operation_id: None,
                resource_version: 0,
                history: Vec::new(),
                archived_history_count: 0,
                deleted: false,
                updated_at: Utc::now(),
                etag: String::new(),
            };
            let store = self.store.clone();

            async move {
                let document = store
                    .create_item(Container::Resources, &id.to_string(), &resource.to_body()?)
                    .await?;
                Resource::from_document(document)
            }
        })
        .await?;

        info!(resource_id = %created.id, version = %created.template_version, "Resource created");
        Ok(created)
    }

    /// Fetch an active resource by id
    pub async fn get(&self, id: Uuid) -> Result<Resource> {
        let document = self.store.read_item(Container::Resources, &id.to_string()).await?;
        let resource = Resource::from_document(document)?;

        if resource.deleted {
            return Err(OrchestratorError::NotFound(format!("resource {} is deleted", id)));
        }
        Ok(resource)
    }

    /// Like [`get`](Self::get), but also fails with `NotFound` when the
    /// resource is of another type.
    pub async fn get_typed(&self, id: Uuid, resource_type: ResourceType) -> Result<Resource> {
        let resource = self.get(id).await?;
        if resource.resource_type != resource_type {
            return Err(OrchestratorError::NotFound(format!(
                "{} {} (found a {})",
                resource_type, id, resource.resource_type
            )));
        }
        Ok(resource)
    }

    /// Lazily stream the non-deleted resources of a type matching `filter`.
    pub fn query_active(
        &self,
        resource_type: ResourceType,
        filter: &ResourceFilter,
    ) -> ResourceStream {
        let query = filter.apply(
            DocumentQuery::new(Container::Resources)
                .field_eq("resourceType", resource_type.as_str())
                .field_eq("deleted", false),
        );

        query_stream(self.store.clone(), query, self.options.page_size)
            .map(|document| document.and_then(Resource::from_document))
            .boxed()
    }

    /// Apply a client patch, recording the replaced state in the history.
    #[instrument(skip(self, resource, patch, etag), fields(resource_id = %resource.id))]
    pub async fn patch(
        &self,
        resource: &Resource,
        patch: ResourcePatch,
        etag: &str,
    ) -> Result<Resource> {
        if patch.is_empty() {
            return Err(OrchestratorError::Validation("patch changes nothing".to_string()));
        }

        let mut updated = resource.clone();
        let now = Utc::now();

        if let Some(changes) = patch.properties {
            let template = self
                .templates
                .get_template(
                    &resource.template_name,
                    Some(&resource.template_version),
                    resource.resource_type,
                )
                .await?;

            updated.properties.extend(changes);
            self.apply_system_properties(
                &mut updated.properties,
                resource.resource_type.policy(),
                resource.parent_workspace_id.as_ref(),
            );
            template.validate(&updated.properties)?;
        }
        if let Some(is_enabled) = patch.is_enabled {
            updated.is_enabled = is_enabled;
        }

        updated.history.push(ResourceHistoryItem {
            properties: resource.properties.clone(),
            is_enabled: resource.is_enabled,
            resource_version: resource.resource_version,
            superseded_at: now,
        });
        updated.resource_version += 1;
        updated.updated_at = now;

        self.apply_retention(&mut updated).await?;

        let document = self
            .store
            .conditional_replace(
                Container::Resources,
                &resource.id.to_string(),
                &updated.to_body()?,
                etag,
            )
            .await?;

        let patched = Resource::from_document(document)?;
        info!(resource_version = patched.resource_version, "Resource patched");
        Ok(patched)
    }

    /// Conditionally record a status report. Leaves the version and history
    /// alone; `outputs` are merged into the properties.
    #[instrument(
        skip(self, resource, message, outputs, etag),
        fields(resource_id = %resource.id, status = %status)
    )]
    pub async fn update_status(
        &self,
        resource: &Resource,
        status: ResourceStatus,
        message: Option<String>,
        outputs: Option<&Properties>,
        etag: &str,
    ) -> Result<Resource> {
        let mut updated = resource.clone();
        updated.status = status;
        updated.status_message = message;
        if let Some(outputs) = outputs {
            updated
                .properties
                .extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if status == ResourceStatus::Deleted {
            updated.deleted = true;
        }
        self.replace(updated, etag).await
    }

    /// Conditionally note the operation about to be requested for a
    /// resource. Status reports from earlier operations stop applying.
    #[instrument(skip(self, resource, etag), fields(resource_id = %resource.id))]
    pub async fn record_operation(
        &self,
        resource: &Resource,
        operation_id: Uuid,
        etag: &str,
    ) -> Result<Resource> {
        let mut updated = resource.clone();
        updated.operation_id = Some(operation_id);
        self.replace(updated, etag).await
    }

    async fn replace(&self, mut updated: Resource, etag: &str) -> Result<Resource> {
        updated.updated_at = Utc::now();
        let document = self
            .store
            .conditional_replace(
                Container::Resources,
                &updated.id.to_string(),
                &updated.to_body()?,
                etag,
            )
            .await?;

        Resource::from_document(document)
    }

    async fn check_parent(&self, new: &NewResource, policy: &KindPolicy) -> Result<Option<Uuid>> {
        match (policy.requires_parent_workspace, new.parent_workspace_id) {
            (true, Some(workspace_id)) => {
                match self.get_typed(workspace_id, ResourceType::Workspace).await {
                    Ok(_) => Ok(Some(workspace_id)),
                    Err(OrchestratorError::NotFound(_)) => {
                        Err(OrchestratorError::Validation(format!(
                            "parent workspace {} does not exist or is deleted",
                            workspace_id
                        )))
                    }
                    Err(e) => Err(e),
                }
            }
            (true, None) => Err(OrchestratorError::Validation(format!(
                "a {} requires a parent workspace",
                new.resource_type
            ))),
            (false, Some(_)) => Err(OrchestratorError::Validation(format!(
                "a {} cannot belong to a workspace",
                new.resource_type
            ))),
            (false, None) => Ok(None),
        }
    }

    fn apply_system_properties(
        &self,
        properties: &mut Properties,
        policy: &KindPolicy,
        parent: Option<&Uuid>,
    ) {
        for (key, value) in &self.options.system_properties {
            properties.insert(key.clone(), value.clone());
        }
        if let (Some(key), Some(parent)) = (policy.parent_property, parent) {
            properties.insert(key.to_string(), Value::String(parent.to_string()));
        }
    }

    /// Move history entries beyond the retention cap to the archive. Archive
    /// rows are keyed by version, so archiving the same entry again is a
    /// no-op.
    async fn apply_retention(&self, resource: &mut Resource) -> Result<()> {
        let HistoryPolicy::Capped { keep } = self.options.history else {
            return Ok(());
        };
        if resource.history.len() <= keep {
            return Ok(());
        }

        let overflow = resource.history.len() - keep;
        let pruned: Vec<ResourceHistoryItem> = resource.history.drain(..overflow).collect();
        let entries = pruned
            .iter()
            .map(|item| Ok((item.resource_version, serde_json::to_value(item)?)))
            .collect::<Result<Vec<_>>>()?;

        self.store
            .archive_history(&resource.id.to_string(), &entries)
            .await?;
        resource.archived_history_count += overflow as u64;

        debug!(archived = overflow, kept = keep, "Archived resource history");
        Ok(())
    }
}
