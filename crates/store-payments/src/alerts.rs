//! Ops Alerts
//!
//! Best-effort operator notifications over Slack incoming webhooks. An
//! unconfigured channel is a silent no-op and delivery failures are only
//! logged.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::env;
use crate::metadata::MetadataBag;

/// A completed sale, for the sales channel
#[derive(Clone, Debug, Default)]
pub struct SaleNotice {
    pub order_id: String,
    pub customer_email: String,
    pub product_name: String,

    /// Minor units
    pub amount: i64,
    pub affiliate_id: Option<String>,
}

/// Notification seam
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn ops_alert(&self, message: &str, context: &MetadataBag);

    async fn sales_notification(&self, sale: &SaleNotice);
}

#[derive(Clone, Debug, Default)]
pub struct SlackConfig {
    pub alert_webhook_url: Option<String>,

    /// Falls back to the alert channel when unset
    pub sales_webhook_url: Option<String>,
}

impl SlackConfig {
    pub fn from_env() -> Self {
        Self {
            alert_webhook_url: env::var("SLACK_ALERT_WEBHOOK_URL"),
            sales_webhook_url: env::var("SLACK_SALES_WEBHOOK_URL"),
        }
    }
}

pub struct SlackNotifier {
    http: reqwest::Client,
    config: SlackConfig,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(SlackConfig::from_env())
    }

    async fn post(&self, url: &str, body: &Value) -> crate::Result<()> {
        self.http
            .post(url)
            .timeout(Duration::from_secs(5))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn dollars(minor: i64) -> String {
    format!("${}.{:02}", minor / 100, (minor % 100).abs())
}

/// Keep the first three characters of an email.
fn redact_email(email: &str) -> String {
    let head: String = email.chars().take(3).collect();
    format!("{head}***")
}

pub(crate) fn ops_alert_body(message: &str, context: &MetadataBag) -> Value {
    let mut text = format!(":rotating_light: {message}");
    if !context.is_empty() {
        let pretty = serde_json::to_string_pretty(&context.to_json()).unwrap_or_default();
        text.push_str(&format!("\n```{pretty}```"));
    }
    json!({ "text": text })
}

pub(crate) fn sale_body(sale: &SaleNotice) -> Value {
    let amount = dollars(sale.amount);
    let mut blocks = vec![
        json!({ "type": "header", "text": { "type": "plain_text", "text": "New Sale!", "emoji": true } }),
        json!({ "type": "section", "fields": [
            { "type": "mrkdwn", "text": format!("*Product:*\n{}", sale.product_name) },
            { "type": "mrkdwn", "text": format!("*Amount:*\n{amount}") },
            { "type": "mrkdwn", "text": format!("*Order ID:*\n{}", sale.order_id) },
            { "type": "mrkdwn", "text": format!("*Customer:*\n{}", redact_email(&sale.customer_email)) },
        ]}),
    ];
    if let Some(affiliate) = &sale.affiliate_id {
        blocks.push(json!({ "type": "section", "text": { "type": "mrkdwn", "text": format!("*Affiliate:* {affiliate}") } }));
    }
    json!({ "text": format!("New Sale: {amount}"), "blocks": blocks })
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn ops_alert(&self, message: &str, context: &MetadataBag) {
        let Some(url) = &self.config.alert_webhook_url else {
            tracing::debug!(message, reason = "webhook_url_missing", "ops.alert_skipped");
            return;
        };
        match self.post(url, &ops_alert_body(message, context)).await {
            Ok(()) => tracing::info!(message, "ops.alert_sent"),
            Err(e) => tracing::error!(message, error = %e, "ops.alert_failed"),
        }
    }

    async fn sales_notification(&self, sale: &SaleNotice) {
        let Some(url) = self
            .config
            .sales_webhook_url
            .as_ref()
            .or(self.config.alert_webhook_url.as_ref())
        else {
            tracing::debug!(reason = "webhook_url_missing", "sales.notification_skipped");
            return;
        };
        match self.post(url, &sale_body(sale)).await {
            Ok(()) => tracing::info!(order_id = %sale.order_id, "sales.notification_sent"),
            Err(e) => tracing::error!(order_id = %sale.order_id, error = %e, "sales.notification_failed"),
        }
    }
}
