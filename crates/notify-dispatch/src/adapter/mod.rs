//! Delivery adapters.
//!
//! An adapter owns everything provider-specific: authentication, wire format
//! and, most importantly, classifying failures as retryable or not. The
//! dispatcher's retry policy depends entirely on that classification.
//!
//! Bundled adapters:
//! - Generic JSON webhooks
//! - Telegram Bot API

mod telegram;
mod webhook;

pub use telegram::{TelegramAdapter, TelegramConfig};
pub use webhook::{WebhookAdapter, WebhookConfig};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::ErrorCode;
use crate::render::Payload;
use crate::settings::{FieldSchema, ModuleDescription, ModuleSettings};
use crate::{Error, Result};

/// Maximum number of response body characters kept in error messages.
const ERROR_BODY_LIMIT: usize = 512;

/// Result of a delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The provider accepted the message.
    Delivered,
    /// The provider did not accept the message.
    Failed { error: Error, retryable: bool },
}

impl DeliveryOutcome {
    /// A failure whose retryability follows the error kind.
    pub fn failed(error: Error) -> Self {
        let retryable = error.is_retryable();
        Self::Failed { error, retryable }
    }

    /// A failure that must not be retried.
    pub fn terminal(error: Error) -> Self {
        Self::Failed {
            error,
            retryable: false,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { retryable: true, .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Delivered => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.error().map(Error::code)
    }

    /// Convert into a plain result.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Delivered => Ok(()),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

impl From<Result<()>> for DeliveryOutcome {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Delivered,
            Err(e) => Self::failed(e),
        }
    }
}

/// Provider-specific delivery capability.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Short provider name, used in breaker keys and logs.
    fn provider(&self) -> &'static str;

    /// Display metadata for hosts.
    fn description(&self) -> ModuleDescription;

    /// Module-level settings this adapter needs.
    fn settings_schema(&self) -> FieldSchema;

    /// Whether an attempt that hits the dispatcher timeout may be retried.
    fn timeout_is_retryable(&self) -> bool {
        true
    }

    /// Deliver `payload`. Every failure must be classified.
    async fn send(&self, payload: &Payload, settings: &ModuleSettings) -> DeliveryOutcome;

    /// Verify credentials without sending a notification.
    async fn test_connection(&self, settings: &ModuleSettings) -> Result<()>;
}

/// Classify a non-success HTTP status.
///
/// 408, 425, 429 and 5xx are retryable; everything else is permanent.
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    let body = truncate_body(body);
    let message = if body.is_empty() {
        format!("{} responded with {}", provider, status)
    } else {
        format!("{} responded with {} - {}", provider, status, body)
    };

    let retryable = status.is_server_error()
        || matches!(status.as_u16(), 408 | 425 | 429);

    if retryable {
        Error::TransientDelivery {
            message,
            retry_after,
        }
    } else {
        Error::permanent(message)
    }
}

/// Classify a transport-level reqwest error.
///
/// Connect, timeout, request and body errors are retryable; builder,
/// redirect and decode errors are permanent. The request URL is stripped
/// from the message since it can carry credentials.
pub fn classify_reqwest_error(provider: &str, e: reqwest::Error) -> Error {
    let retryable = e.is_connect() || e.is_timeout() || e.is_request() || e.is_body();
    let message = format!("{} request failed: {}", provider, e.without_url());
    if retryable {
        Error::transient(message)
    } else {
        Error::permanent(message)
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= ERROR_BODY_LIMIT {
        return body.to_string();
    }
    let truncated: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    format!("{}...", truncated)
}
