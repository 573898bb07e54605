use std::{path::Path, time::Duration};

use anyhow::Context;
use slnet_agent::{
    api::{self, ApiState},
    config::AgentConfig,
    controller::{AgentContext, ControlRequest, LifecycleController},
    nat_gateway::IgdGateway,
    process_supervisor::ProcessSupervisor,
};
use slnet_process::StatusSnapshot;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_BUFFER: usize = 1024;
const API_DRAIN: Duration = Duration::from_secs(2);

fn init_tracing(logs_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create {}", logs_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(logs_dir, "slnet-agent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AgentConfig::from_env()?;
    // Flushes the file log on exit.
    let _log_guard = init_tracing(&config.logs_dir())?;
    config.merge_persisted().await?;

    tracing::info!(
        data_root = %config.data_root.display(),
        port = config.port,
        server_dir = ?config.server_dir,
        "slnet-agent starting"
    );

    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let (requests_tx, requests_rx) = mpsc::channel(64);

    let addr = config.api_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "slnet-agent HTTP listening");

    let api_state = ApiState {
        requests: requests_tx.clone(),
        events: events.clone(),
        status: status_rx,
    };
    let (stop_api_tx, stop_api_rx) = oneshot::channel::<()>();
    let api_task = tokio::spawn(api::serve(listener, api_state, async {
        let _ = stop_api_rx.await;
    }));

    let ctx = AgentContext {
        gateway: IgdGateway::new(config.nat_timeout),
        launcher: ProcessSupervisor,
        config,
        events,
        status: status_tx,
    };
    let controller = tokio::spawn(LifecycleController::new(ctx).run(requests_rx));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping server");
            let _ = requests_tx.send(ControlRequest::Shutdown).await;
        }
    });

    let outcome = controller.await.context("controller task panicked")?;

    let _ = stop_api_tx.send(());
    match tokio::time::timeout(API_DRAIN, api_task).await {
        Ok(Ok(Err(e))) => tracing::warn!(error = %format!("{e:#}"), "HTTP server failed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server task panicked"),
        Ok(Ok(Ok(()))) | Err(_) => {}
    }

    match outcome {
        Ok(()) => {
            tracing::info!("slnet-agent stopped");
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "fatal supervisor error; exiting");
            Err(err.into())
        }
    }
}
