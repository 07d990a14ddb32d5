//! Generic webhook delivery adapter.
//!
//! POSTs the rendered notification as JSON to the configured `webhook_url`,
//! authenticating with HTTP basic auth.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{
    DeliveryAdapter, DeliveryOutcome, classify_reqwest_error, classify_status, parse_retry_after,
};
use crate::render::{Payload, RenderedAttribute};
use crate::settings::{FieldDefinition, FieldSchema, FieldType, ModuleDescription, ModuleSettings};
use crate::{Error, Result};

const PROVIDER: &str = "webhook";

/// Message shown when credentials are missing or rejected.
const LOGIN_FAILED: &str =
    "API Login Failed. Please check your credentials input and try again.";

/// Webhook adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Display name shown by hosts.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Custom headers added to every request.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_display_name() -> String {
    "Webhook".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            headers: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// JSON body posted to the webhook.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    channel: &'a str,
    bot_name: Option<&'a str>,
    notification_title: &'a str,
    notification_url: Option<&'a str>,
    notification_message: &'a str,
    notification_attributes: &'a [RenderedAttribute],
}

impl<'a> From<&'a Payload> for WebhookBody<'a> {
    fn from(payload: &'a Payload) -> Self {
        Self {
            channel: &payload.channel,
            bot_name: payload.bot_name.as_deref(),
            notification_title: &payload.title,
            notification_url: payload.url.as_deref(),
            notification_message: &payload.message,
            notification_attributes: &payload.attributes,
        }
    }
}

/// Generic webhook delivery adapter.
pub struct WebhookAdapter {
    config: WebhookConfig,
    client: Client,
}

impl WebhookAdapter {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                headers.insert(name, value);
            } else {
                warn!("Ignoring invalid webhook header: {}", name);
            }
        }
        headers
    }

    fn endpoint(
        settings: &ModuleSettings,
        key: &str,
    ) -> std::result::Result<Option<Url>, url::ParseError> {
        settings.get_non_empty(key).map(Url::parse).transpose()
    }

    fn credentials(settings: &ModuleSettings) -> Option<(&str, &str)> {
        Some((
            settings.get_non_empty("api_username")?,
            settings.get_non_empty("api_password")?,
        ))
    }

    async fn post(&self, payload: &Payload, settings: &ModuleSettings) -> Result<()> {
        let url = Self::endpoint(settings, "webhook_url")
            .map_err(|e| Error::permanent(format!("Invalid webhook_url: {}", e)))?
            .ok_or_else(|| Error::permanent("No webhook_url configured"))?;
        let (username, password) =
            Self::credentials(settings).ok_or_else(|| Error::permanent(LOGIN_FAILED))?;

        let response = self
            .client
            .post(url)
            .headers(self.build_headers())
            .basic_auth(username, Some(password))
            .json(&WebhookBody::from(payload))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(PROVIDER, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!("Webhook failed: {} - {}", status, body);
            return Err(classify_status(PROVIDER, status, retry_after, &body));
        }

        // A 2xx response may still carry an application-level error.
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&body)
            && let Some(error) = map.get("error")
            && !error.is_null()
        {
            let reason = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(Error::permanent(format!(
                "Notification delivery failed: {}",
                reason
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl DeliveryAdapter for WebhookAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn description(&self) -> ModuleDescription {
        ModuleDescription::new(self.config.display_name.clone()).with_logo("webhook.png")
    }

    fn settings_schema(&self) -> FieldSchema {
        FieldSchema::new(vec![
            FieldDefinition::new("webhook_url", "Webhook URL", FieldType::Text)
                .description("Endpoint that receives notification payloads")
                .required(),
            FieldDefinition::new("api_username", "API Username", FieldType::Text)
                .description("Required username to authenticate with message service")
                .required(),
            FieldDefinition::new("api_password", "API Password", FieldType::Password)
                .description("Required password to authenticate with message service")
                .required(),
            FieldDefinition::new("verify_url", "Verification URL", FieldType::Text)
                .description("Optional endpoint used to verify credentials"),
        ])
    }

    async fn send(&self, payload: &Payload, settings: &ModuleSettings) -> DeliveryOutcome {
        let result = self.post(payload, settings).await;
        if result.is_ok() {
            debug!("Webhook notification sent to channel {}", payload.channel);
        }
        result.into()
    }

    async fn test_connection(&self, settings: &ModuleSettings) -> Result<()> {
        let (username, password) =
            Self::credentials(settings).ok_or_else(|| Error::validation(LOGIN_FAILED))?;
        Self::endpoint(settings, "webhook_url")
            .map_err(|e| Error::validation(format!("Invalid webhook_url: {}", e)))?
            .ok_or_else(|| Error::validation("No webhook_url configured"))?;

        let verify_url = Self::endpoint(settings, "verify_url")
            .map_err(|e| Error::validation(format!("Invalid verify_url: {}", e)))?;
        let Some(verify_url) = verify_url else {
            return Ok(());
        };

        let response = self
            .client
            .get(verify_url)
            .headers(self.build_headers())
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(PROVIDER, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if matches!(status.as_u16(), 401 | 403) {
            return Err(Error::validation(LOGIN_FAILED));
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(PROVIDER, status, retry_after, &body))
    }
}
