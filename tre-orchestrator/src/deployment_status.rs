use crate::error::Result;
use crate::operation::DeploymentStatusEvent;
use crate::repository::ResourceRepository;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::status_updater::{Outcome, StatusHandler};
use async_trait::async_trait;
use tracing::info;

/// Applies deployment status reports to resources
pub struct DeploymentStatusHandler {
    repository: ResourceRepository,
    retry: RetryPolicy,
}

impl DeploymentStatusHandler {
    pub fn new(repository: ResourceRepository) -> Self {
        let retry = repository.options().retry;
        Self { repository, retry }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl StatusHandler for DeploymentStatusHandler {
    type Event = DeploymentStatusEvent;

    fn name(&self) -> &'static str {
        "deployment-status"
    }

    async fn apply(&self, event: &DeploymentStatusEvent) -> Result<Outcome> {
        let repository = &self.repository;

        retry_on_conflict(&self.retry, "update_deployment_status", |_| async move {
            let resource = repository.get(event.id).await?;

            if let Some(reason) = resource.reject_report(event.status, event.operation_id) {
                return Ok(Outcome::Discarded(format!("resource {}: {}", resource.id, reason)));
            }

            let mut reported = resource.clone();
            if event.operation_id.is_some() {
                reported.status_operation_id = event.operation_id;
            }

            let updated = repository
                .update_status(
                    &reported,
                    event.status,
                    event.message.clone(),
                    event.outputs.as_ref(),
                    &resource.etag,
                )
                .await?;

            info!(
                resource_id = %updated.id,
                operation_id = ?event.operation_id,
                from = %resource.status,
                to = %updated.status,
                "Deployment status updated"
            );
            Ok(Outcome::Applied)
        })
        .await
    }
}
