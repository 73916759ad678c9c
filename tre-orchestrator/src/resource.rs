//! Resource domain model
//!
//! Workspaces, workspace services and shared services are one [`Resource`]
//! entity distinguished by a [`ResourceType`] tag. The few places where the
//! kinds behave differently are described by a static [`KindPolicy`] table.

use crate::error::Result;
use crate::store::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Workspace,
    WorkspaceService,
    SharedService,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Workspace => "workspace",
            ResourceType::WorkspaceService => "workspace-service",
            ResourceType::SharedService => "shared-service",
        }
    }

    pub fn policy(self) -> &'static KindPolicy {
        match self {
            ResourceType::Workspace => &WORKSPACE_POLICY,
            ResourceType::WorkspaceService => &WORKSPACE_SERVICE_POLICY,
            ResourceType::SharedService => &SHARED_SERVICE_POLICY,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind behaviour of the shared resource repository
#[derive(Debug)]
pub struct KindPolicy {
    /// Whether the resource lives inside a workspace
    pub requires_parent_workspace: bool,
    /// Property that records the owning workspace id, if any
    pub parent_property: Option<&'static str>,
    pub resource_path: fn(&Uuid, Option<&Uuid>) -> String,
}

static WORKSPACE_POLICY: KindPolicy = KindPolicy {
    requires_parent_workspace: false,
    parent_property: None,
    resource_path: workspace_path,
};

static WORKSPACE_SERVICE_POLICY: KindPolicy = KindPolicy {
    requires_parent_workspace: true,
    parent_property: Some("workspace_id"),
    resource_path: workspace_service_path,
};

static SHARED_SERVICE_POLICY: KindPolicy = KindPolicy {
    requires_parent_workspace: false,
    parent_property: None,
    resource_path: shared_service_path,
};

fn workspace_path(id: &Uuid, _parent: Option<&Uuid>) -> String {
    format!("/workspaces/{}", id)
}

fn workspace_service_path(id: &Uuid, parent: Option<&Uuid>) -> String {
    format!(
        "/workspaces/{}/workspace-services/{}",
        parent.map(Uuid::to_string).unwrap_or_default(),
        id
    )
}

fn shared_service_path(id: &Uuid, _parent: Option<&Uuid>) -> String {
    format!("/shared-services/{}", id)
}

/// Deployment state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    NotDeployed,
    Deploying,
    Deployed,
    Deleting,
    Deleted,
    Failed,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::NotDeployed => "not_deployed",
            ResourceStatus::Deploying => "deploying",
            ResourceStatus::Deployed => "deployed",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::Deleted => "deleted",
            ResourceStatus::Failed => "failed",
        }
    }

    /// Whether a status report may move a resource from `self` to `next`
    /// without naming a new operation. Only forward moves qualify.
    /// Re-reporting the current status is always allowed.
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;

        if self == next {
            return true;
        }

        match self {
            NotDeployed => matches!(next, Deploying | Deployed | Deleting | Failed),
            Deploying => matches!(next, Deployed | Failed),
            Deployed => matches!(next, Deleting | Failed),
            Failed => matches!(next, Deleting),
            Deleting => matches!(next, Deleted | Failed),
            Deleted => false,
        }
    }

    /// Moves that start a new deployment over a settled one. They need a
    /// report from the operation the resource is waiting on.
    pub fn is_redeploy(self, next: ResourceStatus) -> bool {
        matches!(
            (self, next),
            (ResourceStatus::Deployed, ResourceStatus::Deploying)
                | (ResourceStatus::Failed, ResourceStatus::Deploying)
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the user-controlled state a patch replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHistoryItem {
    pub properties: Properties,
    pub is_enabled: bool,
    pub resource_version: u64,
    pub superseded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub template_name: String,
    pub template_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workspace_id: Option<Uuid>,
    pub resource_path: String,
    pub properties: Properties,
    pub is_enabled: bool,
    pub status: ResourceStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    /// Latest operation requested from the deployment system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    /// Operation whose report set the current status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_operation_id: Option<Uuid>,
    pub resource_version: u64,
    #[serde(default)]
    pub history: Vec<ResourceHistoryItem>,
    #[serde(default)]
    pub archived_history_count: u64,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,

    /// Concurrency token of the stored document this value was read from
    #[serde(skip)]
    pub etag: String,
}

impl Resource {
    pub fn from_document(document: Document) -> Result<Self> {
        let mut resource: Resource = serde_json::from_value(document.body)?;
        resource.etag = document.etag;
        Ok(resource)
    }

    pub fn to_body(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Total number of patches applied, counting archived history
    pub fn history_len(&self) -> u64 {
        self.history.len() as u64 + self.archived_history_count
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Why a status report does not apply to this resource, or `None` when
    /// it does. Reports from an operation other than the latest one are
    /// stale, and a redeploy must come from the latest operation before it
    /// has reported anything.
    pub fn reject_report(
        &self,
        next: ResourceStatus,
        operation_id: Option<Uuid>,
    ) -> Option<String> {
        if let (Some(reported), Some(latest)) = (operation_id, self.operation_id) {
            if reported != latest {
                return Some(format!("operation {} was superseded by {}", reported, latest));
            }
        }

        if self.status.can_transition_to(next) {
            return None;
        }

        let fresh_operation = operation_id.is_some()
            && operation_id == self.operation_id
            && operation_id != self.status_operation_id;
        if self.status.is_redeploy(next) && fresh_operation {
            return None;
        }

        Some(format!("cannot move from {} to {}", self.status, next))
    }
}

/// Input for creating a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResource {
    pub resource_type: ResourceType,
    pub template_name: String,
    /// `None` selects the template's current version
    #[serde(default)]
    pub template_version: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub parent_workspace_id: Option<Uuid>,
}

impl NewResource {
    pub fn new(resource_type: ResourceType, template_name: &str, properties: Properties) -> Self {
        Self {
            resource_type,
            template_name: template_name.to_string(),
            template_version: None,
            properties,
            parent_workspace_id: None,
        }
    }

    pub fn workspace(template_name: &str, properties: Properties) -> Self {
        Self::new(ResourceType::Workspace, template_name, properties)
    }

    pub fn workspace_service(
        workspace_id: Uuid,
        template_name: &str,
        properties: Properties,
    ) -> Self {
        Self {
            parent_workspace_id: Some(workspace_id),
            ..Self::new(ResourceType::WorkspaceService, template_name, properties)
        }
    }

    pub fn shared_service(template_name: &str, properties: Properties) -> Self {
        Self::new(ResourceType::SharedService, template_name, properties)
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.template_version = Some(version.to_string());
        self
    }
}

/// Client-controlled fields of a resource. Status is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourcePatch {
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub properties: Option<Properties>,
}

impl ResourcePatch {
    pub fn enabled(is_enabled: bool) -> Self {
        Self {
            is_enabled: Some(is_enabled),
            properties: None,
        }
    }

    pub fn properties(properties: Properties) -> Self {
        Self {
            is_enabled: None,
            properties: Some(properties),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_enabled.is_none() && self.properties.as_ref().map_or(true, Map::is_empty)
    }
}
