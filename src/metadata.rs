use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Client,
};
use tracing::debug;

use crate::config::{Config, PodEnv, ReloaderEnv};

const FIELD_MANAGER: &str = "reloader.stakater.com";

/// Publishes a ConfigMap in the controller's own namespace describing the
/// running build and its effective options. Skipped silently when the
/// namespace is unknown; callers treat errors as non-fatal.
pub async fn publish(
    client: &Client,
    config: &Config,
    reloader_env: &ReloaderEnv,
    pod_env: &PodEnv,
) -> Result<()> {
    let Some(namespace) = reloader_env
        .namespace
        .clone()
        .or_else(|| pod_env.pod_namespace.clone())
    else {
        debug!("controller namespace unknown, skipping metadata object");
        return Ok(());
    };

    let name = format!(
        "{}-meta",
        reloader_env.deployment_name.as_deref().unwrap_or("reloader")
    );
    let data = build_metadata(config, reloader_env)?;

    let meta_object = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "reloader".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&meta_object),
    )
    .await
    .context("failed to publish metadata object")?;
    debug!(%namespace, %name, "published metadata object");
    Ok(())
}

fn build_metadata(
    config: &Config,
    reloader_env: &ReloaderEnv,
) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::new();
    data.insert(
        "version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    data.insert(
        "commit".to_string(),
        env!("RELOADER_GIT_COMMIT").to_string(),
    );
    data.insert(
        "buildTimestamp".to_string(),
        env!("RELOADER_BUILD_TIMESTAMP").to_string(),
    );
    data.insert(
        "rustcVersion".to_string(),
        env!("RELOADER_RUSTC_VERSION").to_string(),
    );
    if let Some(deployment) = &reloader_env.deployment_name {
        data.insert("deployment".to_string(), deployment.clone());
    }
    data.insert(
        "options".to_string(),
        serde_json::to_string_pretty(config).context("failed to serialize options")?,
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::Options;

    #[test]
    fn metadata_carries_build_info_and_options() {
        let config = Options::parse_from(["reloader", "--reload-strategy", "annotations"])
            .into_config(&PodEnv::default())
            .unwrap();
        let env = ReloaderEnv {
            namespace: Some("infra".to_string()),
            deployment_name: Some("reloader".to_string()),
        };
        let data = build_metadata(&config, &env).unwrap();
        assert!(data.contains_key("version"));
        assert!(data.contains_key("commit"));
        assert!(data.contains_key("buildTimestamp"));
        assert!(data.contains_key("rustcVersion"));
        assert_eq!(data.get("deployment").map(String::as_str), Some("reloader"));
        assert!(data.get("options").unwrap().contains("Annotations"));
    }
}
