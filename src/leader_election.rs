use std::time::Duration;

use chrono::{Local, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease as KubeLease, LeaseSpec as KubeLeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Client,
};
use tokio::{
    sync::{oneshot::Sender, watch},
    task::JoinHandle,
};

use crate::config::HaConfig;

const FIELD_MANAGER: &str = "reloader.stakater.com";

/// A held `coordination.k8s.io/v1` lease. Dropped leadership is signalled
/// through the [`Lease::leadership`] channel; the liveness endpoint turns it
/// into a failing probe.
pub struct Lease {
    join_handle: JoinHandle<()>,
    sender: Sender<()>,
    leadership: watch::Receiver<bool>,
}

impl Lease {
    /// Blocks until this replica holds the lease, contending at the
    /// configured retry period while another holder's lease is live.
    pub async fn acquire_or_create(
        kube_api_client: Client,
        params: &HaConfig,
    ) -> Result<Lease, kube::Error> {
        let lease_api: Api<KubeLease> =
            Api::namespaced(kube_api_client.clone(), &params.lease_namespace);

        let _lease = loop {
            let get_lease = lease_api.get_opt(&params.lease_name).await?;

            if let Some(mut lease) = get_lease {
                if lease_expired(&lease) || held_by(&lease, &params.identity) {
                    lease.metadata.managed_fields = None;

                    let spec = lease.spec.get_or_insert_with(Default::default);
                    if spec.lease_transitions.is_none() {
                        spec.lease_transitions = Some(0);
                    }
                    if let Some(lt) = spec.lease_transitions.as_mut() {
                        *lt += 1
                    }
                    spec.acquire_time = Some(now());
                    spec.renew_time = None;
                    spec.lease_duration_seconds = Some(params.lease_duration_secs as i32);
                    spec.holder_identity = Some(params.identity.clone());

                    lease = lease_api
                        .patch(
                            &params.lease_name,
                            &PatchParams::apply(FIELD_MANAGER).force(),
                            &Patch::Apply(&lease),
                        )
                        .await?;
                    break lease;
                } else {
                    // Another replica holds a live lease; contend again later.
                    tokio::time::sleep(Duration::from_secs(params.retry_period_secs)).await;
                    continue;
                }
            } else {
                let lease = lease_api
                    .create(
                        &PostParams::default(),
                        &KubeLease {
                            metadata: ObjectMeta {
                                namespace: Some(params.lease_namespace.clone()),
                                name: Some(params.lease_name.clone()),
                                ..Default::default()
                            },
                            spec: Some(KubeLeaseSpec {
                                acquire_time: Some(now()),
                                lease_duration_seconds: Some(params.lease_duration_secs as i32),
                                holder_identity: Some(params.identity.clone()),
                                lease_transitions: Some(1),
                                ..Default::default()
                            }),
                        },
                    )
                    .await?;
                break lease;
            }
        };

        // Oneshot channel to shutdown the renew task
        let (sender, mut recv) = tokio::sync::oneshot::channel();
        let (leader_tx, leadership) = watch::channel(true);

        let renew_object_name = params.lease_name.clone();
        let retry_period = Duration::from_secs(params.retry_period_secs);
        let renew_deadline = Duration::from_secs(params.renew_deadline_secs);
        let release_on_cancel = params.release_on_cancel;

        // Renew task: heartbeat at the retry period; give up leadership once
        // the renew deadline passes without a successful renewal.
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(retry_period);
            let mut last_renewed = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = interval.tick() => (),
                    _ = &mut recv => {
                        break
                    }
                }

                let patch_params = PatchParams::apply(FIELD_MANAGER);
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": now(),
                    }
                });
                match lease_api
                    .patch(&renew_object_name, &patch_params, &Patch::Merge(patch))
                    .await
                {
                    Ok(_) => last_renewed = tokio::time::Instant::now(),
                    Err(error) => {
                        tracing::error!(%error, "failed to renew lease");
                        if last_renewed.elapsed() >= renew_deadline {
                            tracing::error!("renew deadline exceeded, giving up leadership");
                            let _ = leader_tx.send(false);
                            return;
                        }
                    }
                }
            }

            let _ = leader_tx.send(false);

            if release_on_cancel {
                let patch_params = PatchParams::apply(FIELD_MANAGER);
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": Option::<()>::None,
                        "acquireTime": Option::<()>::None,
                        "holderIdentity": Option::<()>::None
                    }
                });
                if let Err(error) = lease_api
                    .patch(&renew_object_name, &patch_params, &Patch::Merge(patch))
                    .await
                {
                    tracing::error!(%error, "failed to release lease");
                }
            }
        });

        Ok(Lease {
            join_handle,
            sender,
            leadership,
        })
    }

    /// True while this replica may reconcile.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership.clone()
    }

    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        // The renew task is gone already when leadership was lost.
        let _ = self.sender.send(());
        self.join_handle.await
    }
}

fn now() -> MicroTime {
    let local_now = Local::now();
    MicroTime(local_now.with_timezone(&Utc))
}

fn held_by(lease: &KubeLease, identity: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        == Some(identity)
}

fn lease_expired(lease: &KubeLease) -> bool {
    let Some(KubeLeaseSpec {
        acquire_time,
        renew_time,
        lease_duration_seconds,
        ..
    }) = lease.spec.as_ref()
    else {
        return true;
    };

    let local_now = Local::now();
    let utc_now = local_now.with_timezone(&Utc);

    let lease_duration = chrono::Duration::seconds(lease_duration_seconds.unwrap_or(0) as i64);
    if let Some(MicroTime(time)) = renew_time {
        return time
            .checked_add_signed(lease_duration)
            .map(|expire| utc_now.gt(&expire))
            .unwrap_or(true);
    } else if let Some(MicroTime(time)) = acquire_time {
        return time
            .checked_add_signed(lease_duration)
            .map(|expire| utc_now.gt(&expire))
            .unwrap_or(true);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(spec: Option<KubeLeaseSpec>) -> KubeLease {
        KubeLease {
            metadata: ObjectMeta {
                name: Some("reloader".to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    #[test]
    fn missing_spec_counts_as_expired() {
        assert!(lease_expired(&lease(None)));
        assert!(lease_expired(&lease(Some(KubeLeaseSpec::default()))));
    }

    #[test]
    fn live_renewal_is_not_expired() {
        let spec = KubeLeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        };
        assert!(!lease_expired(&lease(Some(spec))));
    }

    #[test]
    fn stale_renewal_is_expired() {
        let spec = KubeLeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(60))),
            ..Default::default()
        };
        assert!(lease_expired(&lease(Some(spec))));
    }

    #[test]
    fn acquire_time_is_the_fallback() {
        let spec = KubeLeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(15),
            acquire_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        };
        assert!(!lease_expired(&lease(Some(spec))));
    }

    #[test]
    fn holder_identity_matches_own_lease() {
        let spec = KubeLeaseSpec {
            holder_identity: Some("reloader-0".to_string()),
            ..Default::default()
        };
        let lease = lease(Some(spec));
        assert!(held_by(&lease, "reloader-0"));
        assert!(!held_by(&lease, "reloader-1"));
    }
}
