use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

use reloader::config::{AlertEnv, Config, Options, PodEnv, ReloaderEnv};
use reloader::notify::{self, AlertSink, FanoutSink, WebhookFormat, WebhookSink};
use reloader::pause::PauseController;
use reloader::reconcile::{self, ReconcilerContext};
use reloader::{handler, leader_election, metadata};

/// Generate future that awaits shutdown signal
async fn shutdown_signal(shutdown_signal_broadcast_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let _ = shutdown_signal_broadcast_tx.send(());
}

fn init_tracing(format: &str, level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("unknown log level {level:?}"))?;
    match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        "" => tracing_subscriber::fmt().with_env_filter(filter).init(),
        other => bail!("unknown log format {other:?}, expected `json` or empty"),
    }
    Ok(())
}

fn build_sink(config: &Config, alert_env: &AlertEnv) -> Result<Arc<dyn AlertSink>> {
    let env_sink = notify::sink_from_env(alert_env)?;
    match &config.webhook_url {
        Some(url) => {
            let client = notify::http_client(alert_env.webhook_proxy.as_deref())
                .context("failed to build webhook HTTP client")?;
            let webhook: Arc<dyn AlertSink> =
                Arc::new(WebhookSink::new(client, url.clone(), WebhookFormat::Json));
            Ok(Arc::new(FanoutSink::new(vec![webhook, env_sink])))
        }
        None => Ok(env_sink),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    init_tracing(&options.log_format, &options.log_level)?;

    let pod_env = PodEnv::from_env().context("failed to read pod environment")?;
    let reloader_env = ReloaderEnv::from_env().context("failed to read RELOADER_* environment")?;
    let alert_env = AlertEnv::from_env().context("failed to read ALERT_* environment")?;
    let config = Arc::new(options.into_config(&pod_env)?);
    let sink = build_sink(&config, &alert_env)?;

    let kube_config = kube::Config::infer().await?;
    let client: kube::Client = kube_config.try_into()?;

    // Prepare shutdown signal futures
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let shutdown_signal_fut = shutdown_signal(shutdown_tx.clone());
    tokio::spawn(async move {
        shutdown_signal_fut.await;
    });

    // Probe and metrics endpoints are served by every replica, leader or not.
    let (leadership_tx, leadership_rx) = watch::channel(true);
    let mut health_shutdown = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(
        axum::Server::bind(&config.health_addr)
            .serve(handler::health_app(leadership_rx).into_make_service())
            .with_graceful_shutdown(async move {
                let _ = health_shutdown.recv().await;
            }),
    );
    let mut metrics_shutdown = shutdown_tx.subscribe();
    let metrics_handle = tokio::spawn(
        axum::Server::bind(&config.metrics_addr)
            .serve(handler::metrics_app().into_make_service())
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.recv().await;
            }),
    );

    // Leader election
    // Acquire lease; until then this replica is a standby.
    let lease = match &config.ha {
        Some(ha) => {
            let lease_fut = leader_election::Lease::acquire_or_create(client.clone(), ha);
            let lease = tokio::select! {
                lease = lease_fut => {
                    lease?
                }
                _ = shutdown_rx.recv() => {
                    // Early exit when shutdown signal is received
                    return Ok(());
                }
            };
            tracing::info!(identity = %ha.identity, "acquired leadership");

            // Mirror lost leadership into the liveness probe.
            let mut lease_leadership = lease.leadership();
            tokio::spawn(async move {
                while lease_leadership.changed().await.is_ok() {
                    let current = *lease_leadership.borrow();
                    if leadership_tx.send(current).is_err() {
                        break;
                    }
                }
            });
            Some(lease)
        }
        None => None,
    };

    if let Err(error) = metadata::publish(&client, &config, &reloader_env, &pod_env).await {
        tracing::warn!(%error, "failed to publish metadata object");
    }

    let pause = PauseController::new(client.clone(), &config);
    {
        let pause = pause.clone();
        tokio::spawn(async move {
            if let Err(error) = pause.recover().await {
                tracing::warn!(%error, "pause recovery failed");
            }
        });
    }

    // Spawn one reconciler per watched kind
    let ctx = Arc::new(ReconcilerContext {
        client,
        config: config.clone(),
        sink,
        pause,
    });
    let mut controller_handles = Vec::new();
    if !config.ignore_configmaps {
        controller_handles.push(tokio::spawn(reconcile::run::<ConfigMap>(
            ctx.clone(),
            shutdown_tx.clone(),
        )));
    }
    if !config.ignore_secrets {
        controller_handles.push(tokio::spawn(reconcile::run::<Secret>(
            ctx.clone(),
            shutdown_tx.clone(),
        )));
    }
    if controller_handles.is_empty() {
        bail!("both configMaps and secrets are ignored, nothing to watch");
    }

    // Await all spawned futures
    for handle in controller_handles {
        handle.await??;
    }
    health_handle.await??;
    metrics_handle.await??;

    // Release lease
    if let Some(lease) = lease {
        lease.join().await?;
    }

    Ok(())
}
