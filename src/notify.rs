use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::AlertEnv;
use crate::types::{CoKind, WorkloadKind};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// One reload, described for the outside world.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub workload_kind: WorkloadKind,
    pub workload_name: String,
    pub namespace: String,
    pub co_kind: CoKind,
    pub co_name: String,
    pub hash: String,
    pub auto: bool,
}

impl Alert {
    pub fn title(&self) -> String {
        format!(
            "Reloaded {} {}/{}",
            self.workload_kind, self.namespace, self.workload_name
        )
    }

    pub fn text(&self) -> String {
        format!(
            "{} {}/{} reloaded after a change to {} {} (hash {})",
            self.workload_kind,
            self.namespace,
            self.workload_name,
            self.co_kind,
            self.co_name,
            self.hash
        )
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to deliver alert: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outbound notification contract. Failures are logged by callers and never
/// affect reconciliation.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), Error>;
}

pub struct NoopSink;

#[async_trait]
impl AlertSink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn send(&self, _alert: &Alert) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookFormat {
    Text,
    Json,
}

/// Plain webhook: POSTs either the alert text or the alert as JSON.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    format: WebhookFormat,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: String, format: WebhookFormat) -> Self {
        WebhookSink {
            client,
            url,
            format,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &'static str {
        match self.format {
            WebhookFormat::Text => "webhook",
            WebhookFormat::Json => "json-webhook",
        }
    }

    async fn send(&self, alert: &Alert) -> Result<(), Error> {
        let request = self.client.post(&self.url);
        let request = match self.format {
            WebhookFormat::Text => request.body(alert.text()),
            WebhookFormat::Json => request.json(alert),
        };
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Serialize)]
struct SlackAttachment {
    fallback: String,
    color: &'static str,
    title: String,
    text: String,
    fields: Vec<SlackField>,
}

#[derive(Serialize)]
struct SlackField {
    title: &'static str,
    value: String,
    short: bool,
}

pub struct SlackSink {
    client: reqwest::Client,
    url: String,
}

impl SlackSink {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        SlackSink { client, url }
    }

    fn payload(alert: &Alert) -> SlackPayload {
        let fields = vec![
            SlackField {
                title: "Workload",
                value: format!("{} {}", alert.workload_kind, alert.workload_name),
                short: true,
            },
            SlackField {
                title: "Namespace",
                value: alert.namespace.clone(),
                short: true,
            },
            SlackField {
                title: "Changed",
                value: format!("{} {}", alert.co_kind, alert.co_name),
                short: true,
            },
            SlackField {
                title: "Trigger",
                value: if alert.auto { "auto" } else { "explicit" }.to_string(),
                short: true,
            },
        ];
        SlackPayload {
            attachments: vec![SlackAttachment {
                fallback: alert.text(),
                color: "#36a64f",
                title: alert.title(),
                text: alert.text(),
                fields,
            }],
        }
    }
}

#[async_trait]
impl AlertSink for SlackSink {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<(), Error> {
        self.client
            .post(&self.url)
            .json(&Self::payload(alert))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct TeamsMessageCard {
    #[serde(rename = "@type")]
    card_type: &'static str,
    #[serde(rename = "@context")]
    context: &'static str,
    #[serde(rename = "themeColor")]
    theme_color: &'static str,
    summary: String,
    title: String,
    text: String,
}

pub struct TeamsSink {
    client: reqwest::Client,
    url: String,
}

impl TeamsSink {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        TeamsSink { client, url }
    }

    fn payload(alert: &Alert) -> TeamsMessageCard {
        TeamsMessageCard {
            card_type: "MessageCard",
            context: "http://schema.org/extensions",
            theme_color: "36a64f",
            summary: alert.title(),
            title: alert.title(),
            text: alert.text(),
        }
    }
}

#[async_trait]
impl AlertSink for TeamsSink {
    fn name(&self) -> &'static str {
        "teams"
    }

    async fn send(&self, alert: &Alert) -> Result<(), Error> {
        self.client
            .post(&self.url)
            .json(&Self::payload(alert))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct GoogleChatPayload {
    cards: Vec<GoogleChatCard>,
}

#[derive(Serialize)]
struct GoogleChatCard {
    header: GoogleChatHeader,
    sections: Vec<GoogleChatSection>,
}

#[derive(Serialize)]
struct GoogleChatHeader {
    title: String,
}

#[derive(Serialize)]
struct GoogleChatSection {
    widgets: Vec<GoogleChatWidget>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleChatWidget {
    text_paragraph: GoogleChatText,
}

#[derive(Serialize)]
struct GoogleChatText {
    text: String,
}

pub struct GoogleChatSink {
    client: reqwest::Client,
    url: String,
}

impl GoogleChatSink {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        GoogleChatSink { client, url }
    }

    fn payload(alert: &Alert) -> GoogleChatPayload {
        GoogleChatPayload {
            cards: vec![GoogleChatCard {
                header: GoogleChatHeader {
                    title: alert.title(),
                },
                sections: vec![GoogleChatSection {
                    widgets: vec![GoogleChatWidget {
                        text_paragraph: GoogleChatText { text: alert.text() },
                    }],
                }],
            }],
        }
    }
}

#[async_trait]
impl AlertSink for GoogleChatSink {
    fn name(&self) -> &'static str {
        "gchat"
    }

    async fn send(&self, alert: &Alert) -> Result<(), Error> {
        self.client
            .post(&self.url)
            .json(&Self::payload(alert))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Delivers to every inner sink; reports the first failure after trying all.
pub struct FanoutSink(Vec<Arc<dyn AlertSink>>);

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        FanoutSink(sinks)
    }
}

#[async_trait]
impl AlertSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn send(&self, alert: &Alert) -> Result<(), Error> {
        let mut first_error = None;
        for sink in &self.0 {
            if let Err(error) = sink.send(alert).await {
                tracing::warn!(%error, sink = sink.name(), "alert delivery failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Shared outbound HTTP client: bounded timeout, optional forward proxy.
pub fn http_client(proxy: Option<&str>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(SEND_TIMEOUT);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    builder.build()
}

/// Builds the alert sink selected by `ALERT_SINK`, or a no-op when no
/// webhook URL is configured.
pub fn sink_from_env(env: &AlertEnv) -> Result<Arc<dyn AlertSink>> {
    let Some(url) = env.webhook_url.clone() else {
        return Ok(Arc::new(NoopSink));
    };
    let client = http_client(env.webhook_proxy.as_deref())
        .context("failed to build alert HTTP client")?;
    let sink: Arc<dyn AlertSink> = match env.sink.as_deref() {
        Some("slack") => Arc::new(SlackSink::new(client, url)),
        Some("teams") => Arc::new(TeamsSink::new(client, url)),
        Some("gchat") | Some("google-chat") => Arc::new(GoogleChatSink::new(client, url)),
        Some("json") => Arc::new(WebhookSink::new(client, url, WebhookFormat::Json)),
        None | Some("webhook") => Arc::new(WebhookSink::new(client, url, WebhookFormat::Text)),
        Some(other) => bail!("unknown alert sink {other:?}"),
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        Alert {
            workload_kind: WorkloadKind::Deployment,
            workload_name: "app".to_string(),
            namespace: "prod".to_string(),
            co_kind: CoKind::ConfigMap,
            co_name: "app-config".to_string(),
            hash: "deadbeef".to_string(),
            auto: true,
        }
    }

    #[test]
    fn alert_text_names_both_objects() {
        let text = alert().text();
        assert!(text.contains("Deployment prod/app"));
        assert!(text.contains("ConfigMap app-config"));
        assert!(text.contains("deadbeef"));
    }

    #[test]
    fn slack_payload_shape() {
        let value = serde_json::to_value(SlackSink::payload(&alert())).unwrap();
        let attachment = &value["attachments"][0];
        assert_eq!(attachment["title"], "Reloaded Deployment prod/app");
        assert!(attachment["fallback"].as_str().unwrap().contains("app-config"));
    }

    #[test]
    fn teams_payload_is_a_message_card() {
        let value = serde_json::to_value(TeamsSink::payload(&alert())).unwrap();
        assert_eq!(value["@type"], "MessageCard");
        assert_eq!(value["@context"], "http://schema.org/extensions");
        assert_eq!(value["title"], "Reloaded Deployment prod/app");
    }

    #[test]
    fn gchat_payload_nests_a_text_widget() {
        let value = serde_json::to_value(GoogleChatSink::payload(&alert())).unwrap();
        let widget = &value["cards"][0]["sections"][0]["widgets"][0];
        assert!(widget["textParagraph"]["text"]
            .as_str()
            .unwrap()
            .contains("reloaded"));
    }

    #[test]
    fn sink_selection_follows_alert_env() {
        let no_url = AlertEnv::default();
        assert_eq!(sink_from_env(&no_url).unwrap().name(), "noop");

        let slack = AlertEnv {
            webhook_url: Some("https://hooks.example.com/x".to_string()),
            sink: Some("slack".to_string()),
            webhook_proxy: None,
        };
        assert_eq!(sink_from_env(&slack).unwrap().name(), "slack");

        let default_webhook = AlertEnv {
            webhook_url: Some("https://hooks.example.com/x".to_string()),
            sink: None,
            webhook_proxy: None,
        };
        assert_eq!(sink_from_env(&default_webhook).unwrap().name(), "webhook");

        let unknown = AlertEnv {
            webhook_url: Some("https://hooks.example.com/x".to_string()),
            sink: Some("carrier-pigeon".to_string()),
            webhook_proxy: None,
        };
        assert!(sink_from_env(&unknown).is_err());
    }
}
