//! taskrunner - batch jobs on Kubernetes behind a small HTTP API

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::sync::watch;

use taskrunner_cluster::KubeGateway;
use taskrunner_common::telemetry::{init_telemetry, TelemetryConfig};
use taskrunner_job::context::read_credentials;
use taskrunner_job::{JobContext, JobService, Reconciler};
use taskrunner_operator::{router, OperatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    init_telemetry(TelemetryConfig {
        service_name: "taskrunner".to_string(),
        log_filter: config.log_level.clone(),
    })?;

    config.validate()?;
    tracing::info!(
        namespace = %config.namespace,
        bucket = %config.bucket_name,
        database = ?config.database_path,
        addr = %config.api_addr(),
        "starting taskrunner"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let gateway = Arc::new(KubeGateway::new(client, config.namespace.clone()));
    let store = config.record_store()?;
    let storage = Arc::new(config.object_storage()?);

    let credentials = read_credentials(&config.credentials_file).await?;
    let ctx = Arc::new(JobContext::new(
        gateway,
        store,
        storage,
        config.launch_settings(credentials),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(Reconciler::new(ctx.clone()));
    let period = config.sync_interval();
    let reconciler_task = tokio::spawn({
        let mut rx = shutdown_rx;
        async move {
            reconciler
                .run_periodic(period, async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                })
                .await;
        }
    });

    let app = router(Arc::new(JobService::new(ctx)));
    let listener = tokio::net::TcpListener::bind(config.api_addr())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", config.api_addr(), e))?;
    tracing::info!(addr = %config.api_addr(), "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = reconciler_task.await {
        tracing::error!(error = %e, "reconciler task panicked");
    }
    tracing::info!("taskrunner stopped");
    Ok(())
}
