use anyhow::Context;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agentexec_api::app::{AppState, build_app, services};
use agentexec_infra::PipelineConfig;
use agentexec_observability::PipelineMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("reading .env");
        }
    }
    agentexec_observability::init();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let metrics = PipelineMetrics::new(Registry::new()).context("registering metrics")?;
    let services = services::build_services(&config, metrics.clone()).await?;

    let shutdown = CancellationToken::new();
    let pull_loop = tokio::spawn(services.consumer.clone().run(shutdown.clone()));

    let app = build_app(AppState::new(services.consumer.clone(), metrics));
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("binding {}", config.http_bind))?;
    info!(addr = %listener.local_addr()?, "listening");

    // Kept serving (503 on /health) while in-flight jobs drain.
    let server_stop = CancellationToken::new();
    let stop = server_stop.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    });

    shutdown_signal().await;
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = pull_loop.await {
        warn!(error = %e, "pull loop task failed");
    }
    server_stop.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "http server error"),
        Err(e) => warn!(error = %e, "http server task failed"),
    }
    if let Err(e) = services.broker.close().await {
        warn!(error = %e, "broker flush on close failed");
    }
    info!("agent executor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
