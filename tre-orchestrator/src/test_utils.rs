use crate::channel::{ChannelOptions, MessageChannel, ReceivedMessage, SqliteMessageChannel};
use crate::error::{OrchestratorError, Result};
use crate::resource::ResourceType;
use crate::store::SqliteDocumentStore;
use crate::template::{Template, TemplateRepository};
use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create an in-memory test database with migrations applied
///
/// A single long-lived connection keeps the in-memory database alive and
/// serializes access to it.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Channel options that make redelivery immediate and polling fast
pub fn fast_channel_options() -> ChannelOptions {
    ChannelOptions {
        lease: Duration::from_millis(0),
        poll_interval: Duration::from_millis(10),
        max_delivery_count: 10,
    }
}

pub fn test_channel(pool: &SqlitePool) -> Arc<SqliteMessageChannel> {
    Arc::new(SqliteMessageChannel::new(
        pool.clone(),
        ChannelOptions {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
    ))
}

/// A channel whose broker is never reachable
pub struct UnavailableChannel;

fn broker_down() -> OrchestratorError {
    OrchestratorError::ChannelUnavailable("broker unreachable".to_string())
}

#[async_trait]
impl MessageChannel for UnavailableChannel {
    async fn send(&self, _queue: &str, _body: &str) -> Result<()> {
        Err(broker_down())
    }

    async fn receive(&self, _queue: &str) -> Result<ReceivedMessage> {
        Err(broker_down())
    }

    async fn acknowledge(&self, _message: &ReceivedMessage) -> Result<()> {
        Err(broker_down())
    }

    async fn dead_letter(&self, _message: &ReceivedMessage, _reason: &str) -> Result<()> {
        Err(broker_down())
    }
}

/// Schema used by the test templates: `display_name` is required and
/// `description` has a default
pub fn basic_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["display_name"],
        "properties": {
            "display_name": {"type": "string"},
            "description": {"type": "string", "default": "no description"},
            "vm_size": {"type": "string", "enum": ["small", "large"]}
        }
    })
}

/// Register "t1"/"1.0" for every resource type
pub async fn register_test_templates(store: &SqliteDocumentStore) {
    let templates = TemplateRepository::new(Arc::new(store.clone()));

    for resource_type in [
        ResourceType::Workspace,
        ResourceType::WorkspaceService,
        ResourceType::SharedService,
    ] {
        templates
            .register(Template {
                name: "t1".to_string(),
                version: "1.0".to_string(),
                resource_type,
                current: true,
                schema: basic_schema(),
            })
            .await
            .expect("Failed to register test template");
    }
}
