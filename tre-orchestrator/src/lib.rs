//! Resource lifecycle reconciliation
//!
//! This crate keeps the platform's record of workspaces, workspace services,
//! shared services and airlock requests consistent with what the deployment
//! system reports. Client requests are persisted and then dispatched as
//! operation messages; status reports flow back through queue-driven
//! status updaters. All writes are optimistic, guarded by document etags.
//!
//! It is consumed by the tre-worker service but can also be used by CLI
//! commands or other entry points.

pub mod airlock;
pub mod airlock_status;
pub mod channel;
pub mod db;
pub mod deployment_status;
pub mod dispatcher;
pub mod error;
pub mod operation;
pub mod repository;
pub mod resource;
pub mod retry;
pub mod status_updater;
pub mod store;
pub mod template;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use airlock::{
    AirlockRepository, AirlockRequest, AirlockStage, AirlockStatusEvent, NewAirlockRequest,
};
pub use airlock_status::AirlockStatusHandler;
pub use channel::{MessageChannel, SqliteMessageChannel};
pub use deployment_status::DeploymentStatusHandler;
pub use dispatcher::{RequestDispatcher, Submission};
pub use error::{OrchestratorError, Result};
pub use operation::{DeploymentStatusEvent, OperationAction, OperationMessage};
pub use repository::{HistoryPolicy, RepositoryOptions, ResourceFilter, ResourceRepository};
pub use resource::{NewResource, Resource, ResourcePatch, ResourceStatus, ResourceType};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use status_updater::{
    MessageDisposition, Outcome, StatusHandler, StatusUpdater, UpdaterStatsSnapshot,
};
pub use store::{DocumentStore, SqliteDocumentStore};
pub use template::{CachedTemplateProvider, Template, TemplateProvider, TemplateRepository};
