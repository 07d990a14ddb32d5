//! Notification dispatcher.
//!
//! The Dispatcher is responsible for:
//! - Validating rule and module settings before any network call
//! - Resolving the selected channel and rendering the payload
//! - Delivering through the adapter with a per-attempt timeout
//! - Retrying transient failures with exponential backoff and jitter
//! - Short-circuiting destinations whose circuit breaker is open

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{DeliveryAdapter, DeliveryOutcome};
use crate::breaker::{
    BreakerSettings, BreakerSnapshot, CircuitBreakerManager, CircuitState,
    DestinationKey,
};
use crate::channel::{ChannelOption, ChannelResolver, ChannelSource};
use crate::model::Notification;
use crate::render::{Payload, render};
use crate::retry::RetryPolicy;
use crate::settings::{
    CHANNEL_FIELD, FieldSchema, ModuleDescription, ModuleSettings, NotificationSettings,
};
use crate::{Error, Result};

/// Message returned when a rule has no channel selected.
pub const NO_CHANNEL_SELECTED: &str = "No channel selected";

/// Configuration for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Total send attempts per dispatch, including the first.
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds.
    pub initial_retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Draw retry delays uniformly from [0, capped delay].
    pub jitter: bool,
    /// Timeout for a single adapter call in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Consecutive terminal failures that open a destination's circuit.
    pub circuit_breaker_threshold: u32,
    /// Rolling window for counting consecutive failures, in milliseconds.
    pub circuit_breaker_window_ms: u64,
    /// How long an open circuit short-circuits dispatches, in milliseconds.
    pub circuit_breaker_cooldown_ms: u64,
    /// Reuse channel listings for this long. `None` fetches on every call.
    pub channel_cache_ttl_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            jitter: true,
            attempt_timeout_ms: 10000,
            circuit_breaker_threshold: 5,
            circuit_breaker_window_ms: 60000,
            circuit_breaker_cooldown_ms: 300000,
            channel_cache_ttl_ms: None,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.max_retry_delay_ms < self.initial_retry_delay_ms {
            return Err(Error::config(
                "max_retry_delay_ms must not be lower than initial_retry_delay_ms",
            ));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(Error::config("attempt_timeout_ms must be positive"));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(Error::config("circuit_breaker_threshold must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            jitter: self.jitter,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.circuit_breaker_threshold,
            window: Duration::from_millis(self.circuit_breaker_window_ms),
            cooldown: Duration::from_millis(self.circuit_breaker_cooldown_ms),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Dispatch lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Resolving,
    Rendering,
    Sending,
    Delivered,
    Failed,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    short_circuited: AtomicU64,
    cancelled: AtomicU64,
}

/// Statistics about the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub short_circuited: u64,
    pub cancelled: u64,
    pub circuit_breakers: Vec<BreakerSnapshot>,
}

/// Orchestrates resolution, rendering and delivery of notifications.
pub struct Dispatcher {
    config: DispatcherConfig,
    retry_policy: RetryPolicy,
    adapter: Arc<dyn DeliveryAdapter>,
    resolver: ChannelResolver,
    notification_schema: FieldSchema,
    breakers: CircuitBreakerManager,
    counters: DispatchCounters,
    cancellation_token: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher with the default configuration.
    pub fn new(adapter: Arc<dyn DeliveryAdapter>, channels: Arc<dyn ChannelSource>) -> Self {
        Self::build(DispatcherConfig::default(), adapter, channels)
    }

    /// Create a dispatcher with a custom configuration.
    pub fn with_config(
        config: DispatcherConfig,
        adapter: Arc<dyn DeliveryAdapter>,
        channels: Arc<dyn ChannelSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, adapter, channels))
    }

    fn build(
        config: DispatcherConfig,
        adapter: Arc<dyn DeliveryAdapter>,
        channels: Arc<dyn ChannelSource>,
    ) -> Self {
        let resolver = match config.channel_cache_ttl_ms {
            Some(ttl) => ChannelResolver::with_ttl(channels, Duration::from_millis(ttl)),
            None => ChannelResolver::new(channels),
        };

        info!(
            "Dispatcher initialized for provider {} (max_attempts={}, timeout={}ms)",
            adapter.provider(),
            config.max_attempts,
            config.attempt_timeout_ms
        );

        Self {
            retry_policy: config.retry_policy(),
            breakers: CircuitBreakerManager::new(config.breaker_settings()),
            adapter,
            resolver,
            notification_schema: FieldSchema::notification_default(),
            counters: DispatchCounters::default(),
            cancellation_token: CancellationToken::new(),
            config,
        }
    }

    /// Replace the rule-level settings schema.
    pub fn with_notification_schema(mut self, schema: FieldSchema) -> Self {
        self.notification_schema = schema;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Display metadata of the underlying provider.
    pub fn description(&self) -> ModuleDescription {
        self.adapter.description()
    }

    /// Module-level settings schema.
    pub fn settings_schema(&self) -> FieldSchema {
        self.adapter.settings_schema()
    }

    /// Rule-level settings schema.
    pub fn notification_settings_schema(&self) -> FieldSchema {
        self.notification_schema.clone()
    }

    /// Options for a dynamic settings field.
    ///
    /// Fields other than `channel` have no runtime options.
    pub async fn dynamic_field_options(
        &self,
        field_name: &str,
        settings: &ModuleSettings,
    ) -> Result<Vec<ChannelOption>> {
        if field_name == CHANNEL_FIELD {
            self.resolver.list_channels(settings).await
        } else {
            Ok(Vec::new())
        }
    }

    /// Validate module settings and verify them with the provider.
    ///
    /// Success resets every circuit breaker of this provider.
    pub async fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        let provider = self.adapter.provider();
        self.adapter.settings_schema().validate(settings.as_map())?;

        let attempt_timeout = self.config.attempt_timeout();
        match timeout(attempt_timeout, self.adapter.test_connection(settings)).await {
            Ok(Ok(())) => {
                self.breakers.reset_provider(provider);
                info!("Connection test succeeded for provider {}", provider);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Connection test failed for provider {}: {}", provider, e);
                Err(e)
            }
            Err(_) => Err(Error::transient(format!(
                "{} connection test timed out after {:?}",
                provider, attempt_timeout
            ))),
        }
    }

    /// Deliver `notification` to the channel selected in `notification_settings`.
    pub async fn dispatch(
        &self,
        notification: &Notification,
        module_settings: &ModuleSettings,
        notification_settings: &NotificationSettings,
    ) -> DeliveryOutcome {
        let token = self.cancellation_token.child_token();
        self.dispatch_with_cancellation(
            notification,
            module_settings,
            notification_settings,
            &token,
        )
        .await
    }

    /// Like [`Dispatcher::dispatch`], aborting promptly when `token` is cancelled.
    pub async fn dispatch_with_cancellation(
        &self,
        notification: &Notification,
        module_settings: &ModuleSettings,
        notification_settings: &NotificationSettings,
        token: &CancellationToken,
    ) -> DeliveryOutcome {
        let Some(channel_id) = notification_settings.channel() else {
            debug!("Dispatch rejected: {}", NO_CHANNEL_SELECTED);
            return self.fail(Error::validation(NO_CHANNEL_SELECTED));
        };

        if let Err(e) = self
            .notification_schema
            .validate(notification_settings.as_map())
            .and_then(|()| self.adapter.settings_schema().validate(module_settings.as_map()))
        {
            debug!("Dispatch rejected: {}", e);
            return self.fail(e);
        }

        let key = DestinationKey::new(self.adapter.provider(), channel_id);
        // An abandoned dispatch drops the permit, which frees a half-open trial slot.
        let permit = match self.breakers.get(&key).acquire() {
            Ok(permit) => permit,
            Err(retry_after) => {
                self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
                debug!(
                    destination = %key,
                    retry_after_ms = millis(retry_after),
                    "Dispatch short-circuited by open circuit"
                );
                return DeliveryOutcome::terminal(Error::CircuitOpen {
                    destination: key.to_string(),
                    retry_after,
                });
            }
        };

        let mut state = DispatchState::Idle;
        transition(&mut state, DispatchState::Resolving, &key);
        let channel = match self.resolver.resolve(channel_id, module_settings).await {
            Ok(channel) => channel,
            Err(e) => {
                drop(permit);
                if matches!(e, Error::NotFound { .. }) {
                    // Next dispatch sees channels added since the last listing.
                    self.resolver.invalidate(module_settings).await;
                }
                transition(&mut state, DispatchState::Failed, &key);
                return self.fail(e);
            }
        };

        transition(&mut state, DispatchState::Rendering, &key);
        let payload = render(notification, &channel, notification_settings);

        transition(&mut state, DispatchState::Sending, &key);
        let outcome = self
            .send_with_retry(&payload, module_settings, &key, token)
            .await;

        match &outcome {
            DeliveryOutcome::Delivered => {
                permit.success();
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                transition(&mut state, DispatchState::Delivered, &key);
                info!("Notification delivered to {} ({})", key, channel.name);
            }
            DeliveryOutcome::Failed {
                error: Error::Cancelled,
                ..
            } => {
                drop(permit);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                transition(&mut state, DispatchState::Failed, &key);
                info!("Notification dispatch to {} cancelled", key);
            }
            DeliveryOutcome::Failed { error, .. } => {
                permit.failure();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                transition(&mut state, DispatchState::Failed, &key);
                warn!(
                    destination = %key,
                    code = %error.code(),
                    "Notification delivery failed: {}",
                    error
                );
            }
        }

        outcome
    }

    /// Send with per-attempt timeout and retry on transient failures.
    async fn send_with_retry(
        &self,
        payload: &Payload,
        settings: &ModuleSettings,
        key: &DestinationKey,
        token: &CancellationToken,
    ) -> DeliveryOutcome {
        let attempt_timeout = self.config.attempt_timeout();
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancelled(token) => {
                    return DeliveryOutcome::terminal(Error::Cancelled);
                }
                result = timeout(attempt_timeout, self.adapter.send(payload, settings)) => result,
            };

            let (error, retryable) = match result {
                Ok(DeliveryOutcome::Delivered) => return DeliveryOutcome::Delivered,
                Ok(DeliveryOutcome::Failed { error, retryable }) => (error, retryable),
                Err(_) => {
                    let message = format!(
                        "{} attempt timed out after {:?}",
                        key.provider, attempt_timeout
                    );
                    if self.adapter.timeout_is_retryable() {
                        (Error::transient(message), true)
                    } else {
                        (Error::permanent(message), false)
                    }
                }
            };

            if !retryable {
                return DeliveryOutcome::terminal(error);
            }

            if !self.retry_policy.should_retry(attempt) {
                warn!(
                    destination = %key,
                    attempts = attempt + 1,
                    "Retries exhausted"
                );
                return DeliveryOutcome::terminal(error);
            }

            let delay = self.retry_policy.delay_with_hint(attempt, error.retry_after());
            warn!(
                destination = %key,
                attempt = attempt + 1,
                max = self.retry_policy.max_attempts,
                delay_ms = millis(delay),
                error = %error,
                "Retrying after transient error"
            );

            tokio::select! {
                biased;
                _ = self.cancelled(token) => {
                    return DeliveryOutcome::terminal(Error::Cancelled);
                }
                _ = sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Resolves when either the request or the dispatcher is cancelled.
    async fn cancelled(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.cancellation_token.cancelled() => {}
        }
    }

    fn fail(&self, error: Error) -> DeliveryOutcome {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        DeliveryOutcome::terminal(error)
    }

    /// Circuit state for a destination of this dispatcher's provider.
    pub fn circuit_state(&self, destination: &str) -> CircuitState {
        self.breakers
            .state(&DestinationKey::new(self.adapter.provider(), destination))
    }

    /// Get dispatch statistics.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            short_circuited: self.counters.short_circuited.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            circuit_breakers: self.breakers.snapshots(),
        }
    }

    /// Cancel all in-flight dispatches.
    pub fn shutdown(&self) {
        info!("Stopping dispatcher");
        self.cancellation_token.cancel();
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn transition(state: &mut DispatchState, next: DispatchState, key: &DestinationKey) {
    debug!(destination = %key, from = ?*state, to = ?next, "Dispatch state transition");
    *state = next;
}
