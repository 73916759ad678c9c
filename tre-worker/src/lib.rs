pub mod config;
pub mod templates;

pub use config::Config;
pub use templates::load_templates;

use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;
use tre_orchestrator::channel::SqliteMessageChannel;
use tre_orchestrator::status_updater::UpdaterStatsSnapshot;
use tre_orchestrator::{
    AirlockRepository, AirlockStatusHandler, CachedTemplateProvider, DeploymentStatusHandler,
    RequestDispatcher, ResourceRepository, SqliteDocumentStore, StatusUpdater, TemplateRepository,
};

/// Everything the worker runs on, built once from the pool and config
#[derive(Clone)]
pub struct Services {
    pub store: SqliteDocumentStore,
    pub channel: Arc<SqliteMessageChannel>,
    pub template_repository: TemplateRepository,
    pub templates: Arc<CachedTemplateProvider<TemplateRepository>>,
    pub resources: ResourceRepository,
    pub airlock: AirlockRepository,
    pub dispatcher: RequestDispatcher,
}

impl Services {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        let store = SqliteDocumentStore::new(pool.clone());
        let channel = Arc::new(SqliteMessageChannel::new(pool, config.channel_options()));

        let template_repository = TemplateRepository::new(Arc::new(store.clone()));
        let templates = Arc::new(CachedTemplateProvider::new(
            template_repository.clone(),
            config.template_cache_ttl(),
        ));

        let resources = ResourceRepository::with_options(
            Arc::new(store.clone()),
            templates.clone(),
            config.repository_options(),
        );
        let airlock = AirlockRepository::new(Arc::new(store.clone()), resources.clone());
        let dispatcher = RequestDispatcher::new(resources.clone(), channel.clone())
            .with_queue(config.resource_request_queue.clone());

        Self {
            store,
            channel,
            template_repository,
            templates,
            resources,
            airlock,
            dispatcher,
        }
    }
}

/// Apply deployment status reports until `shutdown` fires
pub async fn start_deployment_status_task(
    services: Services,
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> UpdaterStatsSnapshot {
    let handler = DeploymentStatusHandler::new(services.resources.clone());
    StatusUpdater::new(services.channel.clone(), config.deployment_status_queue.clone(), handler)
        .with_error_backoff(config.channel_options().poll_interval)
        .run(shutdown)
        .await
}

/// Apply airlock stage reports until `shutdown` fires
pub async fn start_airlock_status_task(
    services: Services,
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> UpdaterStatsSnapshot {
    let handler = AirlockStatusHandler::new(services.airlock.clone(), config.retry_policy());
    StatusUpdater::new(services.channel.clone(), config.airlock_status_queue.clone(), handler)
        .with_error_backoff(config.channel_options().poll_interval)
        .run(shutdown)
        .await
}
