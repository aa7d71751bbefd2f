use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::fingerprint::Fingerprint;
use crate::metrics::Metrics;
use crate::mutate::{self, MutationOutcome};
use crate::notify::{Alert, AlertSink};
use crate::pause::PauseController;
use crate::policy::{self, Decision};
use crate::resolve;
use crate::types::{AsConfigObject, ConfigObject, WorkloadKind};
use crate::workload::Workload;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const CONFLICT_REQUEUE: Duration = Duration::from_millis(500);
const MAX_ATTEMPTS: u32 = 12;
const QUEUE_DEPTH: usize = 64;

pub struct ReconcilerContext {
    pub client: Client,
    pub config: Arc<Config>,
    pub sink: Arc<dyn AlertSink>,
    pub pause: Arc<PauseController>,
}

/// Errors that can be raised within one reconciliation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[source] kube::Error),
}

#[derive(Clone, Debug)]
enum WorkItem {
    /// Re-derive from current state. `created` marks the first sight of the
    /// key, `initial` the startup synchronization window.
    Sync { created: bool, initial: bool },
    /// The object is gone; the snapshot is its last observed state.
    Deleted(ConfigObject),
}

#[derive(Clone, Debug)]
struct QueueItem {
    namespace: String,
    name: String,
    attempt: u32,
    item: WorkItem,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Done,
    RequeueConflict,
    RequeueBackoff,
}

/// Watch loop for one configuration object kind. Events are fanned out to
/// per-key sharded workers; a key is never processed concurrently.
pub async fn run<K>(
    ctx: Arc<ReconcilerContext>,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()>
where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + AsConfigObject
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = match &ctx.config.watch_namespace {
        Some(ns) => Api::namespaced(ctx.client.clone(), ns),
        None => Api::all(ctx.client.clone()),
    };

    // Sharded workers: same key, same worker, strict arrival order.
    let mut senders = Vec::with_capacity(ctx.config.workers);
    let mut worker_handles = Vec::with_capacity(ctx.config.workers);
    for _ in 0..ctx.config.workers {
        let (tx, rx) = mpsc::channel::<QueueItem>(QUEUE_DEPTH);
        worker_handles.push(tokio::spawn(worker_loop::<K>(
            ctx.clone(),
            rx,
            tx.clone(),
            shutdown.subscribe(),
        )));
        senders.push(tx);
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut synced_once = false;
    let mut shutdown_rx = shutdown.subscribe();
    let mut stream = Box::pin(watcher(api, watcher::Config::default()));

    info!(kind = %K::KIND, "watching configuration objects");
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Applied(object))) => {
                let co = object.as_config_object();
                let key = (co.namespace.clone(), co.name.clone());
                let created = seen.insert(key);
                dispatch(
                    &senders,
                    QueueItem {
                        namespace: co.namespace,
                        name: co.name,
                        attempt: 0,
                        item: WorkItem::Sync {
                            created,
                            initial: false,
                        },
                    },
                )
                .await;
            }
            Some(Ok(watcher::Event::Deleted(object))) => {
                let co = object.as_config_object();
                seen.remove(&(co.namespace.clone(), co.name.clone()));
                dispatch(
                    &senders,
                    QueueItem {
                        namespace: co.namespace.clone(),
                        name: co.name.clone(),
                        attempt: 0,
                        item: WorkItem::Deleted(co.deleted_view()),
                    },
                )
                .await;
            }
            Some(Ok(watcher::Event::Restarted(objects))) => {
                let initial = !synced_once;
                synced_once = true;
                seen.clear();
                for object in objects {
                    let co = object.as_config_object();
                    seen.insert((co.namespace.clone(), co.name.clone()));
                    dispatch(
                        &senders,
                        QueueItem {
                            namespace: co.namespace,
                            name: co.name,
                            attempt: 0,
                            item: WorkItem::Sync {
                                created: initial,
                                initial,
                            },
                        },
                    )
                    .await;
                }
            }
            Some(Err(error)) => {
                warn!(kind = %K::KIND, %error, "watch stream error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            None => break,
        }
    }

    drop(senders);
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!(kind = %K::KIND, "reconciler stopped");
    Ok(())
}

fn shard_of(namespace: &str, name: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    namespace.hash(&mut hasher);
    name.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

async fn dispatch(senders: &[mpsc::Sender<QueueItem>], item: QueueItem) {
    let shard = shard_of(&item.namespace, &item.name, senders.len());
    if senders[shard].send(item).await.is_err() {
        debug!("worker queue closed, dropping event");
    }
}

async fn worker_loop<K>(
    ctx: Arc<ReconcilerContext>,
    mut rx: mpsc::Receiver<QueueItem>,
    tx: mpsc::Sender<QueueItem>,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + AsConfigObject
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    loop {
        let item = tokio::select! {
            _ = shutdown.recv() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        match process::<K>(&ctx, &item).await {
            Ok(Outcome::Done) => {}
            Ok(Outcome::RequeueConflict) => requeue(&tx, item, CONFLICT_REQUEUE),
            Ok(Outcome::RequeueBackoff) => {
                let delay = backoff_delay(item.attempt);
                requeue(&tx, item, delay);
            }
            Err(Error::Kubernetes(error)) => {
                if is_transient(&error) {
                    warn!(%error, namespace = %item.namespace, name = %item.name, "transient error, requeueing");
                    let delay = backoff_delay(item.attempt);
                    requeue(&tx, item, delay);
                } else {
                    warn!(%error, namespace = %item.namespace, name = %item.name, "dropping reconciliation");
                }
            }
        }
    }
}

fn requeue(tx: &mpsc::Sender<QueueItem>, mut item: QueueItem, delay: Duration) {
    if item.attempt >= MAX_ATTEMPTS {
        warn!(namespace = %item.namespace, name = %item.name, "giving up after {MAX_ATTEMPTS} attempts");
        return;
    }
    item.attempt += 1;
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(item).await;
    });
}

fn backoff_delay(attempt: u32) -> Duration {
    INITIAL_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

/// Transient failures are retried; not-found and forbidden complete the
/// reconciliation after a warning.
fn is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => response.code == 409 || response.code >= 500,
        _ => true,
    }
}

fn creation_triggers_reload(config: &Config, initial: bool) -> bool {
    config.reload_on_create || (initial && config.sync_after_restart)
}

async fn process<K>(ctx: &ReconcilerContext, item: &QueueItem) -> Result<Outcome, Error>
where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + AsConfigObject
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let config = &ctx.config;

    match &item.item {
        WorkItem::Deleted(snapshot) => {
            if !config.reload_on_delete {
                return Ok(Outcome::Done);
            }
            if !resolve::namespace_in_scope(&ctx.client, config, &item.namespace)
                .await
                .map_err(Error::Kubernetes)?
            {
                return Ok(Outcome::Done);
            }
            fan_out(ctx, snapshot, &Fingerprint::of_deleted()).await
        }
        WorkItem::Sync { created, initial } => {
            if *created && !creation_triggers_reload(config, *initial) {
                return Ok(Outcome::Done);
            }
            if !resolve::namespace_in_scope(&ctx.client, config, &item.namespace)
                .await
                .map_err(Error::Kubernetes)?
            {
                return Ok(Outcome::Done);
            }
            // Level-triggered: always read the current object, never the
            // event payload.
            let api: Api<K> = Api::namespaced(ctx.client.clone(), &item.namespace);
            let Some(object) = api.get_opt(&item.name).await.map_err(Error::Kubernetes)? else {
                // Gone again; the deletion event carries the snapshot.
                return Ok(Outcome::Done);
            };
            let co = object.as_config_object();
            let hash = Fingerprint::of(&co.content);
            fan_out(ctx, &co, &hash).await
        }
    }
}

async fn fan_out(
    ctx: &ReconcilerContext,
    co: &ConfigObject,
    hash: &Fingerprint,
) -> Result<Outcome, Error> {
    let candidates = resolve::workloads_referencing(&ctx.client, &ctx.config, co)
        .await
        .map_err(Error::Kubernetes)?;

    let mut failed = false;
    for resolved in candidates {
        let mut workload = resolved.workload;
        let decision = policy::should_reload(co, workload.as_ref(), resolved.edge, &ctx.config);
        let Decision::Reload { auto } = decision else {
            continue;
        };

        if ctx.config.webhook_only() {
            send_alert(ctx, co, workload.as_ref(), hash, auto);
            continue;
        }

        let outcome = match mutate::apply(
            workload.as_mut(),
            co,
            hash,
            &ctx.config,
            Utc::now().timestamp(),
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, workload = %workload.name(), kind = %workload.kind(), "skipping workload");
                continue;
            }
        };
        if outcome == MutationOutcome::Unchanged {
            Metrics::global().record_noop();
            debug!(workload = %workload.name(), co = %co.name, "already up to date");
            continue;
        }

        match workload.persist(ctx.client.clone()).await {
            Ok(()) => {
                Metrics::global().record_success(&co.namespace);
                info!(
                    kind = %workload.kind(),
                    workload = %workload.name(),
                    namespace = %co.namespace,
                    co_kind = %co.kind,
                    co = %co.name,
                    %hash,
                    "reloaded workload"
                );
                send_alert(ctx, co, workload.as_ref(), hash, auto);
                hand_off_pause(ctx, workload.as_ref()).await;
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                warn!(workload = %workload.name(), co = %co.name, "conflict while persisting, requeueing");
                return Ok(Outcome::RequeueConflict);
            }
            Err(error) => {
                Metrics::global().record_failure(&co.namespace);
                error!(%error, workload = %workload.name(), co = %co.name, "failed to persist workload");
                failed = true;
            }
        }
    }

    if failed {
        Ok(Outcome::RequeueBackoff)
    } else {
        Ok(Outcome::Done)
    }
}

fn send_alert(
    ctx: &ReconcilerContext,
    co: &ConfigObject,
    workload: &dyn Workload,
    hash: &Fingerprint,
    auto: bool,
) {
    let alert = Alert {
        workload_kind: workload.kind(),
        workload_name: workload.name().to_string(),
        namespace: co.namespace.clone(),
        co_kind: co.kind,
        co_name: co.name.clone(),
        hash: hash.to_string(),
        auto,
    };
    let sink = ctx.sink.clone();
    tokio::spawn(async move {
        if let Err(error) = sink.send(&alert).await {
            warn!(%error, sink = sink.name(), "failed to deliver reload notification");
        }
    });
}

async fn hand_off_pause(ctx: &ReconcilerContext, workload: &dyn Workload) {
    if workload.kind() != WorkloadKind::Deployment {
        return;
    }
    let Some(period) = workload
        .annotations()
        .get(&ctx.config.annotations.pause_period)
    else {
        return;
    };
    if let Err(error) = ctx
        .pause
        .pause_after_reload(workload.namespace(), workload.name(), period)
        .await
    {
        error!(%error, deployment = %workload.name(), "failed to pause deployment after reload");
    }
}
