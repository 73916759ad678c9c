//! Airlock requests
//!
//! An airlock request asks to move data into (`import`) or out of
//! (`export`) a workspace. It starts `submitted` and is settled by the
//! airlock processor, which reports a terminal stage on the
//! `airlock-status` queue.

use crate::error::{OrchestratorError, Result};
use crate::repository::ResourceRepository;
use crate::resource::ResourceType;
use crate::store::{query_stream, Container, Document, DocumentQuery, DocumentStore};
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AirlockRequestType {
    Import,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AirlockStage {
    Submitted,
    Approved,
    Rejected,
    Blocked,
}

impl AirlockStage {
    pub fn as_str(self) -> &'static str {
        match self {
            AirlockStage::Submitted => "submitted",
            AirlockStage::Approved => "approved",
            AirlockStage::Rejected => "rejected",
            AirlockStage::Blocked => "blocked",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != AirlockStage::Submitted
    }

    pub fn can_transition_to(self, next: AirlockStage) -> bool {
        self == next || !self.is_terminal()
    }
}

impl fmt::Display for AirlockStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirlockRequest {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub request_type: AirlockRequestType,
    pub business_justification: String,
    pub created_by: String,
    pub status: AirlockStage,
    #[serde(default)]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,

    #[serde(skip)]
    pub etag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAirlockRequest {
    pub workspace_id: Uuid,
    pub request_type: AirlockRequestType,
    pub business_justification: String,
    pub created_by: String,
}

/// Stage report from the airlock processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AirlockStatusEvent {
    pub request_id: Uuid,
    pub new_status: AirlockStage,
    #[serde(default)]
    pub message: Option<String>,
}

pub type AirlockStream = BoxStream<'static, Result<AirlockRequest>>;

fn from_document(document: Document) -> Result<AirlockRequest> {
    let mut request: AirlockRequest = serde_json::from_value(document.body)?;
    request.etag = document.etag;
    Ok(request)
}

#[derive(Clone)]
pub struct AirlockRepository {
    store: Arc<dyn DocumentStore>,
    resources: ResourceRepository,
}

impl AirlockRepository {
    pub fn new(store: Arc<dyn DocumentStore>, resources: ResourceRepository) -> Self {
        Self { store, resources }
    }

    /// Record a new request against an active workspace
    #[instrument(skip(self, new), fields(workspace_id = %new.workspace_id))]
    pub async fn create(&self, new: NewAirlockRequest) -> Result<AirlockRequest> {
        if new.business_justification.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "an airlock request needs a business justification".to_string(),
            ));
        }

        match self
            .resources
            .get_typed(new.workspace_id, ResourceType::Workspace)
            .await
        {
            Ok(_) => {}
            Err(OrchestratorError::NotFound(_)) => {
                return Err(OrchestratorError::Validation(format!(
                    "workspace {} does not exist or is deleted",
                    new.workspace_id
                )))
            }
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        let request = AirlockRequest {
            id: Uuid::new_v4(),
            workspace_id: new.workspace_id,
            request_type: new.request_type,
            business_justification: new.business_justification,
            created_by: new.created_by,
            status: AirlockStage::Submitted,
            status_message: None,
            created_at: now,
            updated_at: now,
            deleted: false,
            etag: String::new(),
        };

        let document = self
            .store
            .create_item(
                Container::AirlockRequests,
                &request.id.to_string(),
                &serde_json::to_value(&request)?,
            )
            .await?;

        info!(request_id = %request.id, "Airlock request submitted");
        from_document(document)
    }

    pub async fn get(&self, id: Uuid) -> Result<AirlockRequest> {
        let document = self
            .store
            .read_item(Container::AirlockRequests, &id.to_string())
            .await?;
        let request = from_document(document)?;

        if request.deleted {
            return Err(OrchestratorError::NotFound(format!("airlock request {} is deleted", id)));
        }
        Ok(request)
    }

    /// Non-deleted requests of a workspace, oldest first
    pub fn query_for_workspace(&self, workspace_id: Uuid, page_size: u32) -> AirlockStream {
        let query = DocumentQuery::new(Container::AirlockRequests)
            .field_eq("workspaceId", workspace_id.to_string())
            .field_eq("deleted", false);

        query_stream(self.store.clone(), query, page_size)
            .map(|document| document.and_then(from_document))
            .boxed()
    }

    /// Conditionally move a request to another stage
    pub async fn update_stage(
        &self,
        request: &AirlockRequest,
        stage: AirlockStage,
        message: Option<String>,
        etag: &str,
    ) -> Result<AirlockRequest> {
        let mut updated = request.clone();
        updated.status = stage;
        updated.status_message = message;
        updated.updated_at = Utc::now();

        let document = self
            .store
            .conditional_replace(
                Container::AirlockRequests,
                &request.id.to_string(),
                &serde_json::to_value(&updated)?,
                etag,
            )
            .await?;

        from_document(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NewResource;
    use crate::store::SqliteDocumentStore;
    use crate::template::TemplateRepository;
    use crate::test_utils::{create_test_db, register_test_templates};
    use futures_util::TryStreamExt;
    use serde_json::json;

    async fn setup() -> (AirlockRepository, Uuid) {
        let store = SqliteDocumentStore::new(create_test_db().await);
        register_test_templates(&store).await;
        let templates = Arc::new(TemplateRepository::new(Arc::new(store.clone())));
        let resources = ResourceRepository::new(Arc::new(store.clone()), templates);

        let workspace = resources
            .create(NewResource::workspace(
                "t1",
                json!({"display_name": "ws"}).as_object().cloned().unwrap(),
            ))
            .await
            .unwrap();

        (AirlockRepository::new(Arc::new(store), resources), workspace.id)
    }

    fn new_request(workspace_id: Uuid) -> NewAirlockRequest {
        NewAirlockRequest {
            workspace_id,
            request_type: AirlockRequestType::Import,
            business_justification: "dataset for study".to_string(),
            created_by: "researcher@example.com".to_string(),
        }
    }

    #[test]
    fn test_stage_transitions() {
        use AirlockStage::*;
        assert!(Submitted.can_transition_to(Approved));
        assert!(Submitted.can_transition_to(Blocked));
        assert!(Approved.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Submitted));
    }

    #[test]
    fn test_status_event_rejects_unknown_fields() {
        let body = json!({"requestId": Uuid::new_v4(), "newStatus": "approved", "reviewer": "x"});
        assert!(serde_json::from_value::<AirlockStatusEvent>(body).is_err());
    }

    #[tokio::test]
    async fn test_create_and_query() {
        let (repo, workspace_id) = setup().await;

        let first = repo.create(new_request(workspace_id)).await.unwrap();
        let second = repo.create(new_request(workspace_id)).await.unwrap();
        assert_eq!(first.status, AirlockStage::Submitted);

        let listed: Vec<AirlockRequest> = repo
            .query_for_workspace(workspace_id, 1)
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_create_requires_workspace_and_justification() {
        let (repo, workspace_id) = setup().await;

        let err = repo.create(new_request(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        let mut blank = new_request(workspace_id);
        blank.business_justification = "  ".to_string();
        let err = repo.create(blank).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_stage_checks_etag() {
        let (repo, workspace_id) = setup().await;
        let request = repo.create(new_request(workspace_id)).await.unwrap();

        let approved = repo
            .update_stage(&request, AirlockStage::Approved, None, &request.etag)
            .await
            .unwrap();
        assert_eq!(approved.status, AirlockStage::Approved);

        let err = repo
            .update_stage(&request, AirlockStage::Rejected, None, &request.etag)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }
}
