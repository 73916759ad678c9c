//! Integration tests for tre-orchestrator
//!
//! Exercises the request path (repository and dispatcher) together with the
//! status updaters against an in-memory database and queue.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};
use tre_orchestrator::airlock::AirlockRequestType;
use tre_orchestrator::channel::{MessageChannel, DEPLOYMENT_STATUS_QUEUE, RESOURCE_REQUEST_QUEUE};
use tre_orchestrator::resource::Properties;
use tre_orchestrator::store::{Container, Document, DocumentPage, DocumentQuery};
use tre_orchestrator::test_utils::{
    create_test_db, fast_channel_options, register_test_templates, test_channel, UnavailableChannel,
};
use tre_orchestrator::*;
use uuid::Uuid;

fn props(value: Value) -> Properties {
    value.as_object().cloned().unwrap()
}

struct Harness {
    store: SqliteDocumentStore,
    repository: ResourceRepository,
    channel: Arc<SqliteMessageChannel>,
    dispatcher: RequestDispatcher,
}

async fn harness() -> Harness {
    let pool = create_test_db().await;
    let store = SqliteDocumentStore::new(pool.clone());
    register_test_templates(&store).await;

    let templates = Arc::new(TemplateRepository::new(Arc::new(store.clone())));
    let options = RepositoryOptions {
        retry: RetryPolicy::immediate(5),
        ..Default::default()
    };
    let repository = ResourceRepository::with_options(Arc::new(store.clone()), templates, options);
    let channel = test_channel(&pool);
    let dispatcher = RequestDispatcher::new(repository.clone(), channel.clone());

    Harness {
        store,
        repository,
        channel,
        dispatcher,
    }
}

fn deployment_updater(h: &Harness) -> StatusUpdater<DeploymentStatusHandler> {
    StatusUpdater::new(
        h.channel.clone(),
        DEPLOYMENT_STATUS_QUEUE,
        DeploymentStatusHandler::new(h.repository.clone()),
    )
}

async fn report(h: &Harness, body: Value) -> MessageDisposition {
    h.channel
        .send(DEPLOYMENT_STATUS_QUEUE, &body.to_string())
        .await
        .unwrap();
    let message = h.channel.receive(DEPLOYMENT_STATUS_QUEUE).await.unwrap();
    deployment_updater(h).process(message).await
}

#[tokio::test]
async fn test_create_then_get_starts_clean() {
    let h = harness().await;

    for display_name in ["a", "b", "c"] {
        let created = h
            .repository
            .create(NewResource::workspace("t1", props(json!({"display_name": display_name}))))
            .await
            .unwrap();

        let read = h.repository.get(created.id).await.unwrap();
        assert_eq!(read.resource_version, 0);
        assert!(read.history.is_empty());
        assert_eq!(read.status, ResourceStatus::NotDeployed);
    }
}

#[tokio::test]
async fn test_patch_appends_exactly_one_history_entry() {
    let h = harness().await;
    let mut resource = h
        .repository
        .create(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
        .await
        .unwrap();

    let patches = [
        ResourcePatch::enabled(false),
        ResourcePatch::properties(props(json!({"vm_size": "large"}))),
        ResourcePatch {
            is_enabled: Some(true),
            properties: Some(props(json!({"display_name": "y"}))),
        },
    ];

    for patch in patches {
        let before = resource.clone();
        resource = h
            .repository
            .patch(&before, patch, &before.etag)
            .await
            .unwrap();

        assert_eq!(resource.history.len(), before.history.len() + 1);
        let entry = resource.history.last().unwrap();
        assert_eq!(entry.properties, before.properties);
        assert_eq!(entry.is_enabled, before.is_enabled);
        assert_eq!(entry.resource_version, before.resource_version);
        assert_eq!(resource.history.len() as u64, resource.resource_version);
    }
}

#[tokio::test]
async fn test_stale_etag_leaves_document_untouched() {
    let h = harness().await;
    let created = h
        .repository
        .create(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
        .await
        .unwrap();

    let first = h
        .repository
        .patch(&created, ResourcePatch::enabled(false), &created.etag)
        .await
        .unwrap();

    let err = h
        .repository
        .patch(
            &created,
            ResourcePatch::properties(props(json!({"display_name": "lost"}))),
            &created.etag,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    let stored = h.repository.get(created.id).await.unwrap();
    assert_eq!(stored, first);
}

#[tokio::test]
async fn test_status_event_is_idempotent() {
    let h = harness().await;
    let created = h
        .repository
        .create(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
        .await
        .unwrap();
    let patched = h
        .repository
        .patch(&created, ResourcePatch::enabled(false), &created.etag)
        .await
        .unwrap();

    let event = json!({"id": created.id, "status": "deployed", "message": "ok"});
    assert_eq!(report(&h, event.clone()).await, MessageDisposition::Acknowledged);
    let once = h.repository.get(created.id).await.unwrap();

    assert_eq!(report(&h, event).await, MessageDisposition::Acknowledged);
    let twice = h.repository.get(created.id).await.unwrap();

    assert_eq!(once.status, ResourceStatus::Deployed);
    assert_eq!(twice.status, once.status);
    assert_eq!(twice.status_message, once.status_message);
    assert_eq!(twice.resource_version, patched.resource_version);
    assert_eq!(twice.history, patched.history);
}

#[tokio::test]
async fn test_late_reports_never_move_status_backwards() {
    let h = harness().await;
    let created = h
        .dispatcher
        .submit(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
        .await
        .unwrap()
        .resource;
    let install = created.operation_id.unwrap();

    for status in ["deploying", "deployed"] {
        let event = json!({"id": created.id, "operationId": install, "status": status});
        assert_eq!(report(&h, event).await, MessageDisposition::Acknowledged);
    }

    // Redelivered copies of the first report, tagged and untagged
    let late = json!({"id": created.id, "operationId": install, "status": "deploying"});
    assert_eq!(report(&h, late).await, MessageDisposition::Acknowledged);
    let untagged = json!({"id": created.id, "status": "deploying"});
    assert_eq!(report(&h, untagged).await, MessageDisposition::Acknowledged);

    let deployed = h.repository.get(created.id).await.unwrap();
    assert_eq!(deployed.status, ResourceStatus::Deployed);
    assert_eq!(deployed.status_operation_id, Some(install));

    // An upgrade may take the resource back through deploying
    let upgrade = h
        .dispatcher
        .request_update(
            created.id,
            ResourcePatch::properties(props(json!({"vm_size": "large"}))),
            &deployed.etag,
        )
        .await
        .unwrap()
        .resource
        .operation_id
        .unwrap();
    assert_ne!(upgrade, install);

    let upgrading = json!({"id": created.id, "operationId": upgrade, "status": "deploying"});
    assert_eq!(report(&h, upgrading).await, MessageDisposition::Acknowledged);
    assert_eq!(
        h.repository.get(created.id).await.unwrap().status,
        ResourceStatus::Deploying
    );

    let superseded = json!({"id": created.id, "operationId": install, "status": "failed"});
    assert_eq!(report(&h, superseded).await, MessageDisposition::Acknowledged);
    let finished = json!({"id": created.id, "operationId": upgrade, "status": "deployed"});
    assert_eq!(report(&h, finished).await, MessageDisposition::Acknowledged);

    let upgraded = h.repository.get(created.id).await.unwrap();
    assert_eq!(upgraded.status, ResourceStatus::Deployed);
    assert_eq!(upgraded.status_operation_id, Some(upgrade));
}

#[tokio::test]
async fn test_enqueue_failure_never_leaves_silent_not_deployed() {
    let h = harness().await;
    let dispatcher = RequestDispatcher::new(h.repository.clone(), Arc::new(UnavailableChannel));

    let submission = assert_ok!(
        dispatcher
            .submit(NewResource::shared_service("t1", props(json!({"display_name": "s"}))))
            .await
    );
    assert!(submission.is_degraded());

    let stored = h.repository.get(submission.resource.id).await.unwrap();
    assert_eq!(stored.status, ResourceStatus::Failed);
    assert!(stored.status_message.is_some());
}

/// Store wrapper that can be told to reject every conditional replace
struct ConflictingStore {
    inner: SqliteDocumentStore,
    conflict: AtomicBool,
}

#[async_trait]
impl DocumentStore for ConflictingStore {
    async fn create_item(&self, container: Container, id: &str, body: &Value) -> Result<Document> {
        self.inner.create_item(container, id, body).await
    }

    async fn read_item(&self, container: Container, id: &str) -> Result<Document> {
        self.inner.read_item(container, id).await
    }

    async fn conditional_replace(
        &self,
        container: Container,
        id: &str,
        body: &Value,
        etag: &str,
    ) -> Result<Document> {
        if self.conflict.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Conflict(format!("{} was modified", id)));
        }
        self.inner.conditional_replace(container, id, body, etag).await
    }

    async fn query_page(
        &self,
        query: &DocumentQuery,
        after: Option<i64>,
        limit: u32,
    ) -> Result<DocumentPage> {
        self.inner.query_page(query, after, limit).await
    }

    async fn archive_history(&self, resource_id: &str, entries: &[(u64, Value)]) -> Result<()> {
        self.inner.archive_history(resource_id, entries).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_double_failure_reports_orphan() {
    let h = harness().await;
    let store = Arc::new(ConflictingStore {
        inner: h.store.clone(),
        conflict: AtomicBool::new(true),
    });
    let templates = Arc::new(TemplateRepository::new(Arc::new(h.store.clone())));
    let repository = ResourceRepository::with_options(
        store,
        templates,
        RepositoryOptions {
            retry: RetryPolicy::immediate(5),
            ..Default::default()
        },
    );
    let dispatcher = RequestDispatcher::new(repository.clone(), Arc::new(UnavailableChannel));

    let err = assert_err!(
        dispatcher
            .submit(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
            .await
    );
    assert!(err.is_unavailable());

    let OrchestratorError::Orphaned { resource_id, .. } = err else {
        panic!("expected Orphaned");
    };

    // Left behind in not_deployed for an operator to inspect
    let orphan = repository.get(resource_id.parse::<Uuid>().unwrap()).await.unwrap();
    assert_eq!(orphan.status, ResourceStatus::NotDeployed);
}

#[tokio::test]
async fn test_updater_retries_conflicts_until_exhausted() {
    let h = harness().await;
    let created = h
        .repository
        .create(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
        .await
        .unwrap();

    let store = Arc::new(ConflictingStore {
        inner: h.store.clone(),
        conflict: AtomicBool::new(true),
    });
    let templates = Arc::new(TemplateRepository::new(Arc::new(h.store.clone())));
    let repository = ResourceRepository::new(store.clone(), templates);
    let updater = StatusUpdater::new(
        h.channel.clone(),
        DEPLOYMENT_STATUS_QUEUE,
        DeploymentStatusHandler::new(repository).with_retry(RetryPolicy::immediate(3)),
    );

    let body = json!({"id": created.id, "status": "deploying"}).to_string();
    h.channel.send(DEPLOYMENT_STATUS_QUEUE, &body).await.unwrap();
    let message = h.channel.receive(DEPLOYMENT_STATUS_QUEUE).await.unwrap();

    assert_eq!(updater.process(message).await, MessageDisposition::Unacknowledged);
    assert_eq!(updater.stats().snapshot().unacknowledged, 1);
    assert_eq!(h.channel.pending_count(DEPLOYMENT_STATUS_QUEUE).await.unwrap(), 1);
    assert_eq!(
        h.repository.get(created.id).await.unwrap().status,
        ResourceStatus::NotDeployed
    );
}

#[tokio::test]
async fn test_unknown_and_malformed_events() {
    let h = harness().await;

    let unknown = json!({"id": Uuid::new_v4(), "status": "deployed"});
    assert_eq!(report(&h, unknown).await, MessageDisposition::Acknowledged);

    let malformed = json!({"id": Uuid::new_v4(), "state": "deployed"});
    assert_eq!(report(&h, malformed).await, MessageDisposition::DeadLettered);

    assert_eq!(h.channel.pending_count(DEPLOYMENT_STATUS_QUEUE).await.unwrap(), 0);
    assert_eq!(h.channel.dead_letter_count(DEPLOYMENT_STATUS_QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_workspace_lifecycle_scenario() {
    let h = harness().await;

    let new = NewResource::workspace("t1", props(json!({"display_name": "x"}))).with_version("1.0");
    let submission = h.dispatcher.submit(new).await.unwrap();
    let created = submission.resource;
    assert_eq!(created.resource_version, 0);
    assert_eq!(created.status, ResourceStatus::NotDeployed);

    let request = h.channel.receive(RESOURCE_REQUEST_QUEUE).await.unwrap();
    let operation: OperationMessage = serde_json::from_str(&request.body).unwrap();
    assert_eq!(operation.resource_id, created.id);
    assert_eq!(operation.action, OperationAction::Install);
    h.channel.acknowledge(&request).await.unwrap();

    let disabled = h
        .dispatcher
        .request_update(created.id, ResourcePatch::enabled(false), &created.etag)
        .await
        .unwrap()
        .resource;
    assert_eq!(disabled.resource_version, 1);
    assert!(disabled.history[0].is_enabled);
    assert_eq!(disabled.status, ResourceStatus::NotDeployed);

    // The deployment system reports back through the running updater
    let updater = deployment_updater(&h);
    let stats = updater.stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(updater.run(shutdown_rx));

    let deployed_event = json!({
        "id": created.id,
        "operationId": operation.operation_id,
        "status": "deployed"
    });
    h.channel
        .send(DEPLOYMENT_STATUS_QUEUE, &deployed_event.to_string())
        .await
        .unwrap();

    for _ in 0..200 {
        if stats.snapshot().applied == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    let final_stats = task.await.unwrap();
    assert_eq!(final_stats.applied, 1);

    let deployed = h.repository.get(created.id).await.unwrap();
    assert_eq!(deployed.status, ResourceStatus::Deployed);
    assert_eq!(deployed.resource_version, 1);

    let err = h
        .dispatcher
        .request_update(created.id, ResourcePatch::enabled(true), &created.etag)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));
}

#[tokio::test]
async fn test_uninstall_to_deleted() {
    let h = harness().await;
    let created = h
        .dispatcher
        .submit(NewResource::workspace("t1", props(json!({"display_name": "x"}))))
        .await
        .unwrap()
        .resource;

    let disabled = h
        .dispatcher
        .request_update(created.id, ResourcePatch::enabled(false), &created.etag)
        .await
        .unwrap()
        .resource;
    let submission = h
        .dispatcher
        .request_uninstall(created.id, &disabled.etag)
        .await
        .unwrap();
    assert_eq!(submission.action, Some(OperationAction::Uninstall));

    for status in ["deleting", "deleted"] {
        let event = json!({"id": created.id, "status": status});
        assert_eq!(report(&h, event).await, MessageDisposition::Acknowledged);
    }

    assert!(matches!(
        h.repository.get(created.id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    let active: Vec<Resource> = h
        .repository
        .query_active(ResourceType::Workspace, &ResourceFilter::default())
        .try_collect()
        .await
        .unwrap();
    assert!(active.is_empty());

    // A late report for the deleted resource is dropped
    let late = json!({"id": created.id, "status": "failed"});
    assert_eq!(report(&h, late).await, MessageDisposition::Acknowledged);
}

#[tokio::test]
async fn test_airlock_status_flow() {
    let h = harness().await;
    let workspace = h
        .repository
        .create(NewResource::workspace("t1", props(json!({"display_name": "ws"}))))
        .await
        .unwrap();

    let airlock = AirlockRepository::new(Arc::new(h.store.clone()), h.repository.clone());
    let request = airlock
        .create(NewAirlockRequest {
            workspace_id: workspace.id,
            request_type: AirlockRequestType::Export,
            business_justification: "results".to_string(),
            created_by: "alice".to_string(),
        })
        .await
        .unwrap();

    let channel = Arc::new(SqliteMessageChannel::new(
        h.store.pool().clone(),
        fast_channel_options(),
    ));
    let updater = StatusUpdater::new(
        channel.clone(),
        "airlock-status",
        AirlockStatusHandler::new(airlock.clone(), RetryPolicy::immediate(3)),
    );

    for stage in ["approved", "approved", "rejected"] {
        let body = json!({"requestId": request.id, "newStatus": stage}).to_string();
        channel.send("airlock-status", &body).await.unwrap();
        let message = channel.receive("airlock-status").await.unwrap();
        assert_eq!(updater.process(message).await, MessageDisposition::Acknowledged);
    }

    let stats = updater.stats().snapshot();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.discarded, 1);
    assert_eq!(airlock.get(request.id).await.unwrap().status, AirlockStage::Approved);
}
