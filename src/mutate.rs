use k8s_openapi::api::core::v1::EnvVar;
use thiserror::Error;

use crate::config::{Config, ReloadStrategy, RELOADED_FROM_ANNOTATION};
use crate::fingerprint::{name_digest, Fingerprint};
use crate::types::{CoKind, ConfigObject, ReloadSource};
use crate::workload::{container_references, volumes_referencing, Workload};

/// Longest env-var name this controller will stamp. Longer names are
/// truncated in the middle; prefix and kind suffix always survive.
const MAX_ENV_NAME: usize = 253;

const ENV_PREFIX: &str = "STAKATER";

/// Longest annotation name segment Kubernetes accepts.
const MAX_ANNOTATION_NAME: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Changed,
    /// The stamped value already equals the new fingerprint; nothing to
    /// persist.
    Unchanged,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("workload has no pod template to mutate")]
    NoPodTemplate,
    #[error("failed to serialize reload source: {0}")]
    SerializeReloadSource(#[source] serde_json::Error),
}

/// Name of the env var stamped by the env-var strategy, e.g.
/// `STAKATER_MY_APP_CONFIG_CONFIGMAP` for a ConfigMap `my.app.config`.
pub fn env_var_name(kind: CoKind, name: &str) -> String {
    let full = format!("{ENV_PREFIX}_{}_{}", sanitize(name), kind.env_suffix());
    if full.len() <= MAX_ENV_NAME {
        return full;
    }
    let suffix = kind.env_suffix();
    let keep = MAX_ENV_NAME - suffix.len() - 1;
    format!("{}_{suffix}", &full[..keep])
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        let c = c.to_ascii_uppercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Pod-template annotation key used by the annotation strategy. Distinct
/// (kind, name) pairs yield distinct keys; names too long for an annotation
/// segment are shortened around a digest of the full name.
pub fn annotation_key(kind: CoKind, name: &str) -> String {
    let domain = match kind {
        CoKind::ConfigMap => "configmap.reloader.stakater.com",
        CoKind::Secret => "secret.reloader.stakater.com",
    };
    if name.len() <= MAX_ANNOTATION_NAME {
        return format!("{domain}/{name}");
    }
    let digest = name_digest(name);
    let keep = MAX_ANNOTATION_NAME - digest.len() - 1;
    format!("{domain}/{}-{digest}", &name[..keep])
}

/// Applies the configured restart trigger for `co` to the workload's pod
/// template. Reports [`MutationOutcome::Unchanged`] when the trigger value
/// already equals `hash`, so callers can skip persistence.
pub fn apply(
    workload: &mut dyn Workload,
    co: &ConfigObject,
    hash: &Fingerprint,
    config: &Config,
    observed_at: i64,
) -> Result<MutationOutcome, Error> {
    let outcome = match config.reload_strategy {
        ReloadStrategy::EnvVars => apply_env_vars(workload, co, hash)?,
        ReloadStrategy::Annotations => apply_annotation(workload, co, hash)?,
    };
    if outcome == MutationOutcome::Changed {
        stamp_reload_source(workload, co, hash, observed_at)?;
    }
    Ok(outcome)
}

/// Container names that consume the object, through env or a mounted volume.
/// Empty means the reference is not attributable to a specific container
/// (an unmounted volume), in which case every container is a target.
pub fn referring_containers(workload: &dyn Workload, co: &ConfigObject) -> Vec<String> {
    let referencing_volumes = volumes_referencing(workload.volumes(), co.kind, &co.name);
    let referring: Vec<String> = workload
        .containers()
        .iter()
        .filter(|c| container_references(c, co.kind, &co.name, &referencing_volumes))
        .map(|c| c.name.clone())
        .collect();
    if referring.is_empty() {
        workload.containers().iter().map(|c| c.name.clone()).collect()
    } else {
        referring
    }
}

fn apply_env_vars(
    workload: &mut dyn Workload,
    co: &ConfigObject,
    hash: &Fingerprint,
) -> Result<MutationOutcome, Error> {
    let var_name = env_var_name(co.kind, &co.name);
    let targets = referring_containers(workload, co);

    let up_to_date = workload
        .containers()
        .iter()
        .filter(|c| targets.contains(&c.name))
        .all(|c| {
            c.env
                .iter()
                .flatten()
                .any(|e| e.name == var_name && e.value.as_deref() == Some(hash.as_str()))
        });
    if up_to_date {
        return Ok(MutationOutcome::Unchanged);
    }

    let containers = workload.containers_mut().ok_or(Error::NoPodTemplate)?;
    for container in containers
        .iter_mut()
        .filter(|c| targets.contains(&c.name))
    {
        let env = container.env.get_or_insert_with(Vec::new);
        match env.iter_mut().find(|e| e.name == var_name) {
            Some(existing) => {
                existing.value = Some(hash.to_string());
                existing.value_from = None;
            }
            None => env.push(EnvVar {
                name: var_name.clone(),
                value: Some(hash.to_string()),
                value_from: None,
            }),
        }
    }
    Ok(MutationOutcome::Changed)
}

fn apply_annotation(
    workload: &mut dyn Workload,
    co: &ConfigObject,
    hash: &Fingerprint,
) -> Result<MutationOutcome, Error> {
    let key = annotation_key(co.kind, &co.name);
    if workload.pod_annotations().get(&key).map(String::as_str) == Some(hash.as_str()) {
        return Ok(MutationOutcome::Unchanged);
    }
    workload
        .pod_annotations_mut()
        .ok_or(Error::NoPodTemplate)?
        .insert(key, hash.to_string());
    Ok(MutationOutcome::Changed)
}

fn stamp_reload_source(
    workload: &mut dyn Workload,
    co: &ConfigObject,
    hash: &Fingerprint,
    observed_at: i64,
) -> Result<(), Error> {
    let source = ReloadSource {
        kind: co.kind,
        name: co.name.clone(),
        namespace: co.namespace.clone(),
        hash: hash.to_string(),
        containers: referring_containers(workload, co),
        observed_at,
    };
    let value = serde_json::to_string(&source).map_err(Error::SerializeReloadSource)?;
    workload
        .pod_annotations_mut()
        .ok_or(Error::NoPodTemplate)?
        .insert(RELOADED_FROM_ANNOTATION.to_string(), value);
    Ok(())
}
