//! Telegram Bot API delivery adapter.
//!
//! Sends messages via `POST /bot<token>/sendMessage`, using the payload's
//! channel as the target `chat_id`. Rate limits (429) are surfaced as
//! retryable failures carrying the `parameters.retry_after` hint, so the
//! dispatcher owns the wait.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{DeliveryAdapter, DeliveryOutcome, classify_reqwest_error, classify_status};
use crate::model::AttributeStyle;
use crate::render::{Payload, RenderedAttribute};
use crate::settings::{FieldDefinition, FieldSchema, FieldType, ModuleDescription, ModuleSettings};
use crate::{Error, Result};

const PROVIDER: &str = "telegram";

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Longest escaped bot name or title kept in the message header.
const HEADER_FIELD_LIMIT: usize = 512;

/// Longer title links are dropped rather than cut.
const LINK_LIMIT: usize = 1024;

const TRUNCATION_SUFFIX: &str = "\n\n[truncated]";

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Disable link previews in sent messages.
    #[serde(default = "default_true")]
    pub disable_web_page_preview: bool,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            disable_web_page_preview: true,
        }
    }
}

/// Telegram delivery adapter.
pub struct TelegramAdapter {
    config: TelegramConfig,
    client: Client,
}

impl TelegramAdapter {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            token,
            method
        )
    }

    /// Build the HTML message text for a payload.
    ///
    /// The result never exceeds the Telegram limit. Only escaped text is cut,
    /// so tags and entities always stay balanced: header fields and the body
    /// are truncated by character, attribute lines are kept or dropped whole.
    fn build_message(&self, payload: &Payload) -> String {
        let mut header = String::new();
        if let Some(bot_name) = &payload.bot_name {
            header.push_str(&format!(
                "<i>{}</i>\n",
                escape_truncated(bot_name, HEADER_FIELD_LIMIT)
            ));
        }

        let title = escape_truncated(&payload.title, HEADER_FIELD_LIMIT);
        match payload.url.as_deref().map(escape_html) {
            Some(url) if char_len(&url) <= LINK_LIMIT => {
                header.push_str(&format!("<b><a href=\"{}\">{}</a></b>", url, title))
            }
            _ => header.push_str(&format!("<b>{}</b>", title)),
        }

        let mut budget = TELEGRAM_MESSAGE_LIMIT.saturating_sub(char_len(&header));

        let mut attributes = String::new();
        if !payload.attributes.is_empty() && budget > 0 {
            attributes.push('\n');
            budget -= 1;
        }
        for attr in &payload.attributes {
            let line = attribute_line(attr);
            let len = char_len(&line);
            if len > budget {
                break;
            }
            attributes.push_str(&line);
            budget -= len;
        }

        let mut text = header;
        if !payload.message.is_empty() && budget > 2 {
            text.push_str("\n\n");
            text.push_str(&escape_truncated(&payload.message, budget - 2));
        }
        text.push_str(&attributes);
        text
    }

    async fn send_message(&self, payload: &Payload, settings: &ModuleSettings) -> Result<()> {
        let token = settings
            .get_non_empty("bot_token")
            .ok_or_else(|| Error::permanent("No Telegram bot_token configured"))?;

        let body = json!({
            "chat_id": payload.channel,
            "text": self.build_message(payload),
            "parse_mode": "HTML",
            "disable_web_page_preview": self.config.disable_web_page_preview,
        });

        let response = self
            .client
            .post(self.method_url(token, "sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(PROVIDER, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let retry_after = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|b| b.get("parameters")?.get("retry_after")?.as_u64())
            .map(Duration::from_secs);

        warn!("Telegram sendMessage failed: {} - {}", status, text);
        Err(classify_status(PROVIDER, status, retry_after, &text))
    }
}

#[async_trait]
impl DeliveryAdapter for TelegramAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn description(&self) -> ModuleDescription {
        ModuleDescription::new("Telegram").with_logo("telegram.png")
    }

    fn settings_schema(&self) -> FieldSchema {
        FieldSchema::new(vec![
            FieldDefinition::new("bot_token", "Bot Token", FieldType::Password)
                .description("Token issued by @BotFather")
                .required(),
        ])
    }

    async fn send(&self, payload: &Payload, settings: &ModuleSettings) -> DeliveryOutcome {
        let result = self.send_message(payload, settings).await;
        if result.is_ok() {
            debug!("Telegram notification sent to chat {}", payload.channel);
        }
        result.into()
    }

    async fn test_connection(&self, settings: &ModuleSettings) -> Result<()> {
        let token = settings
            .get_non_empty("bot_token")
            .ok_or_else(|| Error::validation("Telegram bot token is required"))?;

        let response = self
            .client
            .get(self.method_url(token, "getMe"))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(PROVIDER, e))?;

        let status = response.status();
        if matches!(status.as_u16(), 401 | 404) {
            return Err(Error::validation("Telegram rejected the bot token"));
        }

        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(PROVIDER, status, None, &text));
        }

        let ok = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|b| b.get("ok")?.as_bool())
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "Unexpected Telegram getMe response: {}",
                text
            )))
        }
    }
}

fn style_emoji(style: AttributeStyle) -> &'static str {
    match style {
        AttributeStyle::Info => "\u{2139}\u{fe0f}",     // ℹ️
        AttributeStyle::Success => "\u{2705}",          // ✅
        AttributeStyle::Warning => "\u{26a0}\u{fe0f}",  // ⚠️
        AttributeStyle::Danger => "\u{1f6a8}",          // 🚨
        AttributeStyle::Primary => "\u{1f537}",         // 🔷
        AttributeStyle::Default => "\u{2022}",          // •
    }
}

fn attribute_line(attr: &RenderedAttribute) -> String {
    let value = match &attr.url {
        Some(url) => format!(
            "<a href=\"{}\">{}</a>",
            escape_html(url),
            escape_html(&attr.value)
        ),
        None => escape_html(&attr.value),
    };
    format!(
        "\n{} <b>{}:</b> {}",
        style_emoji(attr.style),
        escape_html(&attr.label),
        value
    )
}

fn html_entity(c: char) -> Option<&'static str> {
    match c {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        '"' => Some("&quot;"),
        _ => None,
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match html_entity(c) {
            Some(entity) => escaped.push_str(entity),
            None => escaped.push(c),
        }
    }
    escaped
}

/// Escape `input`, cutting whole characters so the result fits in `limit`.
fn escape_truncated(input: &str, limit: usize) -> String {
    let escaped = escape_html(input);
    if char_len(&escaped) <= limit {
        return escaped;
    }

    let Some(room) = limit.checked_sub(char_len(TRUNCATION_SUFFIX)) else {
        return String::new();
    };
    let mut truncated = String::new();
    let mut used = 0;
    for c in input.chars() {
        let len = html_entity(c).map_or(1, str::len);
        if used + len > room {
            break;
        }
        match html_entity(c) {
            Some(entity) => truncated.push_str(entity),
            None => truncated.push(c),
        }
        used += len;
    }
    truncated.push_str(TRUNCATION_SUFFIX);
    truncated
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
