use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tre_orchestrator::db::{backup_database, create_pool, run_migrations};
use tre_orchestrator::DocumentStore;
use tre_worker::{
    load_templates, start_airlock_status_task, start_deployment_status_task, Config, Services,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = tre_logging::init_subscriber();

    info!("Starting tre-worker...");

    let config = Config::from_env();
    config.validate()?;
    info!(
        db_path = %config.db_path.display(),
        deployment_status_queue = %config.deployment_status_queue,
        airlock_status_queue = %config.airlock_status_queue,
        "Configuration loaded"
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let services = Services::new(pool, &config);
    services.store.ping().await?;

    if let Some(dir) = &config.templates_dir {
        load_templates(dir, &services.template_repository).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let deployment = tokio::spawn(start_deployment_status_task(
        services.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));
    let airlock = tokio::spawn(start_airlock_status_task(
        services.clone(),
        config.clone(),
        shutdown_rx,
    ));
    info!("Status updaters started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight messages");
    // Receivers only go away once their loops have exited
    let _ = shutdown_tx.send(true);

    for (name, task) in [("deployment-status", deployment), ("airlock-status", airlock)] {
        match task.await {
            Ok(stats) => info!(updater = name, ?stats, "Updater finished"),
            Err(e) => error!(updater = name, error = %e, "Updater task failed"),
        }
    }

    info!("tre-worker stopped");
    Ok(())
}
