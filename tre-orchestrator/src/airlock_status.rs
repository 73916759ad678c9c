use crate::airlock::{AirlockRepository, AirlockStatusEvent};
use crate::error::Result;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::status_updater::{Outcome, StatusHandler};
use async_trait::async_trait;
use tracing::info;

/// Applies airlock processor stage reports to airlock requests
pub struct AirlockStatusHandler {
    repository: AirlockRepository,
    retry: RetryPolicy,
}

impl AirlockStatusHandler {
    pub fn new(repository: AirlockRepository, retry: RetryPolicy) -> Self {
        Self { repository, retry }
    }
}

#[async_trait]
impl StatusHandler for AirlockStatusHandler {
    type Event = AirlockStatusEvent;

    fn name(&self) -> &'static str {
        "airlock-status"
    }

    async fn apply(&self, event: &AirlockStatusEvent) -> Result<Outcome> {
        let repository = &self.repository;

        retry_on_conflict(&self.retry, "update_airlock_stage", |_| async move {
            let request = repository.get(event.request_id).await?;

            if !request.status.can_transition_to(event.new_status) {
                return Ok(Outcome::Discarded(format!(
                    "airlock request {} is already {}",
                    request.id, request.status
                )));
            }

            repository
                .update_stage(&request, event.new_status, event.message.clone(), &request.etag)
                .await?;

            info!(
                request_id = %request.id,
                from = %request.status,
                to = %event.new_status,
                "Airlock request stage updated"
            );
            Ok(Outcome::Applied)
        })
        .await
    }
}
