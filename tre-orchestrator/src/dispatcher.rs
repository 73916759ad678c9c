//! Request dispatch
//!
//! The dispatcher persists a resource change first and only then asks the
//! deployment system to act on it by enqueueing an [`OperationMessage`]. If
//! the queue is unreachable the resource is marked `failed` so it never sits
//! in `not_deployed` without explanation. When even that write fails the
//! caller gets [`OrchestratorError::Orphaned`].

use crate::channel::{MessageChannel, RESOURCE_REQUEST_QUEUE};
use crate::error::{OrchestratorError, Result};
use crate::operation::{OperationAction, OperationMessage};
use crate::repository::{ResourceFilter, ResourceRepository};
use crate::resource::{NewResource, Resource, ResourcePatch, ResourceStatus, ResourceType};
use crate::retry::{retry_on_conflict, RetryPolicy};
use futures_util::TryStreamExt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of a dispatched request
#[derive(Debug, Clone)]
pub struct Submission {
    pub resource: Resource,
    /// Whether an operation message reached the queue
    pub enqueued: bool,
    /// Operation that was (or should have been) requested
    pub action: Option<OperationAction>,
}

impl Submission {
    /// Accepted and persisted, but the deployment system was never told.
    /// The resource is marked `failed`.
    pub fn is_degraded(&self) -> bool {
        self.action.is_some() && !self.enqueued
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    repository: ResourceRepository,
    channel: Arc<dyn MessageChannel>,
    queue: String,
    retry: RetryPolicy,
}

impl RequestDispatcher {
    pub fn new(repository: ResourceRepository, channel: Arc<dyn MessageChannel>) -> Self {
        let retry = repository.options().retry;
        Self {
            repository,
            channel,
            queue: RESOURCE_REQUEST_QUEUE.to_string(),
            retry,
        }
    }

    /// Send operation requests to another queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn repository(&self) -> &ResourceRepository {
        &self.repository
    }

    /// Create a resource and request its installation.
    #[instrument(skip(self, new), fields(resource_type = %new.resource_type))]
    pub async fn submit(&self, new: NewResource) -> Result<Submission> {
        let resource = self.repository.create(new).await?;
        self.dispatch(resource, OperationAction::Install).await
    }

    /// Patch a resource with the caller's etag. Property changes are followed
    /// by an upgrade request; toggling `isEnabled` alone is not.
    #[instrument(skip(self, patch, etag))]
    pub async fn request_update(
        &self,
        id: Uuid,
        patch: ResourcePatch,
        etag: &str,
    ) -> Result<Submission> {
        let resource = self.repository.get(id).await?;
        let properties_changed = patch.properties.as_ref().is_some_and(|p| !p.is_empty());

        let patched = self.repository.patch(&resource, patch, etag).await?;
        if !properties_changed {
            return Ok(Submission {
                resource: patched,
                enqueued: false,
                action: None,
            });
        }

        self.dispatch(patched, OperationAction::Upgrade).await
    }

    /// Request removal of a disabled resource.
    #[instrument(skip(self, etag))]
    pub async fn request_uninstall(&self, id: Uuid, etag: &str) -> Result<Submission> {
        let resource = self.repository.get(id).await?;

        if resource.etag != etag {
            return Err(OrchestratorError::Conflict(format!(
                "resource {} has changed since it was read",
                id
            )));
        }
        if resource.is_enabled {
            return Err(OrchestratorError::Validation(format!(
                "{} {} must be disabled before it can be deleted",
                resource.resource_type, id
            )));
        }
        if resource.resource_type == ResourceType::Workspace {
            let mut services = self
                .repository
                .query_active(ResourceType::WorkspaceService, &ResourceFilter::in_workspace(id));
            if services.try_next().await?.is_some() {
                return Err(OrchestratorError::Validation(format!(
                    "workspace {} still has active workspace services",
                    id
                )));
            }
        }

        self.dispatch(resource, OperationAction::Uninstall).await
    }

    async fn dispatch(&self, resource: Resource, action: OperationAction) -> Result<Submission> {
        let message = OperationMessage::for_resource(&resource, action);
        let body = message.to_json()?;

        // Recorded before sending so the first report already matches
        let recorded = self.record_operation(&resource, message.operation_id).await;
        let (resource, sent) = match recorded {
            Ok(recorded) => {
                let sent = self.channel.send(&self.queue, &body).await;
                (recorded, sent)
            }
            Err(e) => (resource, Err(e)),
        };

        match sent {
            Ok(()) => {
                info!(
                    resource_id = %resource.id,
                    operation_id = %message.operation_id,
                    %action,
                    "Operation requested"
                );
                Ok(Submission {
                    resource,
                    enqueued: true,
                    action: Some(action),
                })
            }
            Err(send_error) => {
                let cause = send_error.to_string();
                warn!(
                    resource_id = %resource.id,
                    %action,
                    error = %cause,
                    "Failed to enqueue operation"
                );

                match self.mark_failed(&resource, action, &cause).await {
                    Ok(failed) => Ok(Submission {
                        resource: failed,
                        enqueued: false,
                        action: Some(action),
                    }),
                    Err(mark_error) => {
                        error!(
                            resource_id = %resource.id,
                            error = %mark_error,
                            "Resource could not be dispatched or marked failed"
                        );
                        Err(OrchestratorError::Orphaned {
                            resource_id: resource.id.to_string(),
                            cause,
                            mark_error: mark_error.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Note the operation on the resource, re-reading it if a status report
    /// or another writer got there first.
    async fn record_operation(&self, resource: &Resource, operation_id: Uuid) -> Result<Resource> {
        let repository = &self.repository;

        retry_on_conflict(&self.retry, "record_operation", |attempt| async move {
            let current = if attempt == 1 {
                resource.clone()
            } else {
                repository.get(resource.id).await?
            };
            repository
                .record_operation(&current, operation_id, &current.etag)
                .await
        })
        .await
    }

    /// Record the enqueue failure on the resource, re-reading it once if the
    /// etag moved underneath us.
    async fn mark_failed(
        &self,
        resource: &Resource,
        action: OperationAction,
        cause: &str,
    ) -> Result<Resource> {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..self.retry
        };
        let repository = &self.repository;
        let diagnostic = format!("{} request could not be queued: {}", action, cause);

        retry_on_conflict(&policy, "mark_failed", |attempt| {
            let diagnostic = diagnostic.clone();
            async move {
                let current = if attempt == 1 {
                    resource.clone()
                } else {
                    repository.get(resource.id).await?
                };
                repository
                    .update_status(
                        &current,
                        ResourceStatus::Failed,
                        Some(diagnostic),
                        None,
                        &current.etag,
                    )
                    .await
            }
        })
        .await
    }
}
