use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid pause period {value:?}: {reason}")]
    InvalidPeriod { value: String, reason: String },
    #[error("invalid paused-at timestamp {value:?}")]
    InvalidPausedAt { value: String },
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
}

/// Keyed one-shot timers. Arming a key cancels and replaces any timer
/// already installed for it, so at most one timer exists per key.
pub(crate) struct TimerTable {
    entries: Mutex<HashMap<(String, String), TimerEntry>>,
    next_generation: AtomicU64,
}

struct TimerEntry {
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

impl TimerTable {
    fn new() -> Arc<TimerTable> {
        Arc::new(TimerTable {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    fn arm<F>(self: &Arc<Self>, key: (String, String), wait: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let table = Arc::clone(self);
        let task_key = key.clone();

        // The lock is held across the spawn so the task cannot observe the
        // table before its own entry is inserted.
        let mut entries = self.entries.lock().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            on_fire.await;
            let mut entries = table.entries.lock().unwrap();
            if entries.get(&task_key).map(|e| e.generation) == Some(generation) {
                entries.remove(&task_key);
            }
        });
        if let Some(old) = entries.insert(key, TimerEntry { generation, handle }) {
            old.handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Pauses a Deployment for a bounded period after each reload and unpauses
/// it when the period elapses, surviving controller restarts through the
/// paused-at annotation.
pub struct PauseController {
    client: Client,
    period_key: String,
    paused_at_key: String,
    watch_namespace: Option<String>,
    timers: Arc<TimerTable>,
}

impl PauseController {
    pub fn new(client: Client, config: &Config) -> Arc<PauseController> {
        Arc::new(PauseController {
            client,
            period_key: config.annotations.pause_period.clone(),
            paused_at_key: config.annotations.paused_at.clone(),
            watch_namespace: config.watch_namespace.clone(),
            timers: TimerTable::new(),
        })
    }

    /// A pause period must be a positive duration like `30s` or `5m`.
    pub fn parse_period(value: &str) -> Result<Duration, Error> {
        let period = humantime::parse_duration(value).map_err(|err| Error::InvalidPeriod {
            value: value.to_string(),
            reason: err.to_string(),
        })?;
        if period.is_zero() {
            return Err(Error::InvalidPeriod {
                value: value.to_string(),
                reason: "period must be positive".to_string(),
            });
        }
        Ok(period)
    }

    /// Pauses the deployment now and schedules the unpause.
    pub async fn pause_after_reload(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        period_value: &str,
    ) -> Result<(), Error> {
        let period = Self::parse_period(period_value)?;
        let paused_at = Utc::now();

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "paused": true },
            "metadata": { "annotations": { &self.paused_at_key: paused_at.to_rfc3339() } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        info!(namespace, deployment = name, period = period_value, "paused deployment after reload");

        self.schedule_unpause(namespace, name, paused_at, period);
        Ok(())
    }

    fn schedule_unpause(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        paused_at: DateTime<Utc>,
        period: Duration,
    ) {
        let deadline = paused_at + chrono::Duration::from_std(period).unwrap_or(chrono::Duration::max_value());
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        let controller = Arc::clone(self);
        let ns = namespace.to_string();
        let deployment = name.to_string();
        self.timers.arm(
            (namespace.to_string(), name.to_string()),
            wait,
            async move {
                if let Err(error) = controller.unpause(&ns, &deployment).await {
                    warn!(%error, namespace = %ns, deployment = %deployment, "failed to unpause deployment");
                }
            },
        );
    }

    /// Clears the pause state: `paused = false`, paused-at removed.
    pub async fn unpause(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "paused": false },
            "metadata": { "annotations": { &self.paused_at_key: serde_json::Value::Null } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        info!(namespace, deployment = name, "unpaused deployment");
        Ok(())
    }

    /// Startup recovery: re-arm timers for deployments still inside their
    /// pause window, unpause the ones whose deadline already passed.
    pub async fn recover(self: &Arc<Self>) -> Result<(), Error> {
        let api: Api<Deployment> = match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        for deployment in api.list(&ListParams::default()).await?.items {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
            let Some(annotations) = &deployment.metadata.annotations else {
                continue;
            };
            let Some(paused_at_raw) = annotations.get(&self.paused_at_key) else {
                continue;
            };
            match self.recover_one(annotations.get(&self.period_key), paused_at_raw) {
                Ok(Some((paused_at, period))) => {
                    self.schedule_unpause(&namespace, &name, paused_at, period);
                }
                Ok(None) => {
                    if let Err(error) = self.unpause(&namespace, &name).await {
                        warn!(%error, %namespace, deployment = %name, "failed to unpause during recovery");
                    }
                }
                Err(error) => {
                    warn!(%error, %namespace, deployment = %name, "skipping deployment with malformed pause state");
                }
            }
        }
        Ok(())
    }

    /// `Some` when the pause window is still open, `None` when it elapsed.
    fn recover_one(
        &self,
        period_raw: Option<&String>,
        paused_at_raw: &str,
    ) -> Result<Option<(DateTime<Utc>, Duration)>, Error> {
        let paused_at = DateTime::parse_from_rfc3339(paused_at_raw)
            .map_err(|_| Error::InvalidPausedAt {
                value: paused_at_raw.to_string(),
            })?
            .with_timezone(&Utc);
        let Some(period_raw) = period_raw else {
            // Paused-at without a period: stale state, clear it.
            return Ok(None);
        };
        let period = Self::parse_period(period_raw)?;
        let deadline = paused_at + chrono::Duration::from_std(period).unwrap_or(chrono::Duration::max_value());
        if deadline <= Utc::now() {
            Ok(None)
        } else {
            Ok(Some((paused_at, period)))
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }
}
