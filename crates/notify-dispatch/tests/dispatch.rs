//! Integration tests for the dispatcher.
//!
//! These tests drive the full dispatch pipeline against a spy adapter and a
//! spy channel source, so every adapter call and channel lookup is counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify_dispatch::breaker::CircuitState;
use notify_dispatch::settings::{FieldDefinition, FieldType, ModuleDescription};
use notify_dispatch::{
    Attribute, AttributeStyle, ChannelOption, ChannelSource, DeliveryAdapter, DeliveryOutcome,
    Dispatcher, DispatcherConfig, Error, ErrorCode, FieldSchema, ModuleSettings, Notification,
    NotificationSettings, Payload, Result,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Deliver,
    /// Fail with a retryable error for the first N calls, then deliver.
    TransientThenDeliver(usize),
    AlwaysTransient,
    AlwaysPermanent,
    /// Never complete.
    Hang,
}

struct SpyAdapter {
    behavior: Mutex<Behavior>,
    timeout_retryable: bool,
    calls: AtomicUsize,
    connection_tests: AtomicUsize,
    payloads: Mutex<Vec<Payload>>,
}

impl SpyAdapter {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            timeout_retryable: true,
            calls: AtomicUsize::new(0),
            connection_tests: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn with_non_retryable_timeouts(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            timeout_retryable: false,
            calls: AtomicUsize::new(0),
            connection_tests: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryAdapter for SpyAdapter {
    fn provider(&self) -> &'static str {
        "spy"
    }

    fn description(&self) -> ModuleDescription {
        ModuleDescription::new("Spy").with_logo("spy.png")
    }

    fn settings_schema(&self) -> FieldSchema {
        FieldSchema::new(vec![
            FieldDefinition::new("api_key", "API Key", FieldType::Password).required(),
        ])
    }

    fn timeout_is_retryable(&self) -> bool {
        self.timeout_retryable
    }

    async fn send(&self, payload: &Payload, _settings: &ModuleSettings) -> DeliveryOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.payloads.lock().push(payload.clone());

        let behavior = *self.behavior.lock();
        match behavior {
            Behavior::Deliver => DeliveryOutcome::Delivered,
            Behavior::TransientThenDeliver(failures) if call <= failures => {
                DeliveryOutcome::failed(Error::transient(format!("busy ({})", call)))
            }
            Behavior::TransientThenDeliver(_) => DeliveryOutcome::Delivered,
            Behavior::AlwaysTransient => {
                DeliveryOutcome::failed(Error::transient(format!("busy ({})", call)))
            }
            Behavior::AlwaysPermanent => {
                DeliveryOutcome::failed(Error::permanent("Invalid credentials"))
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                DeliveryOutcome::Delivered
            }
        }
    }

    async fn test_connection(&self, _settings: &ModuleSettings) -> Result<()> {
        self.connection_tests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SpySource {
    calls: AtomicUsize,
    channels: Vec<ChannelOption>,
}

impl SpySource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            channels: vec![
                ChannelOption::new("1", "Tech Support", "Channel ID"),
                ChannelOption::new("2", "Customer Service", "Channel ID"),
            ],
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSource for SpySource {
    async fn list_channels(&self, _settings: &ModuleSettings) -> Result<Vec<ChannelOption>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.channels.clone())
    }
}

/// Config with millisecond delays so retry tests finish quickly.
fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        initial_retry_delay_ms: 1,
        max_retry_delay_ms: 10,
        attempt_timeout_ms: 1000,
        ..Default::default()
    }
}

fn setup(
    behavior: Behavior,
    config: DispatcherConfig,
) -> (Dispatcher, Arc<SpyAdapter>, Arc<SpySource>) {
    let adapter = SpyAdapter::new(behavior);
    let source = SpySource::new();
    let dispatcher = Dispatcher::with_config(config, adapter.clone(), source.clone())
        .expect("valid dispatcher config");
    (dispatcher, adapter, source)
}

fn module_settings() -> ModuleSettings {
    ModuleSettings::new().with("api_key", "secret")
}

fn to_channel(channel: &str) -> NotificationSettings {
    NotificationSettings::new().with("channel", channel)
}

fn ticket() -> Notification {
    Notification::new("Ticket #42 updated", "The client replied to the ticket.")
        .with_url("https://billing.example.com/tickets/42")
        .with_attribute(
            Attribute::new("Priority", "High")
                .unwrap()
                .with_style(AttributeStyle::Danger),
        )
        .with_attribute(Attribute::new("Department", "Support").unwrap())
}

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_blank_channel_fails_without_side_effects() {
        let (dispatcher, adapter, source) = setup(Behavior::Deliver, fast_config());

        for settings in [
            NotificationSettings::new(),
            to_channel(""),
            to_channel("   "),
        ] {
            let outcome = dispatcher
                .dispatch(&ticket(), &module_settings(), &settings)
                .await;

            assert!(!outcome.is_retryable());
            let err = outcome.error().expect("dispatch should fail");
            assert_eq!(err.code(), ErrorCode::ValidationError);
            assert!(err.to_string().contains("No channel selected"));
        }

        assert_eq!(adapter.calls(), 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_module_setting_fails_before_resolving() {
        let (dispatcher, adapter, source) = setup(Behavior::Deliver, fast_config());

        let outcome = dispatcher
            .dispatch(&ticket(), &ModuleSettings::new(), &to_channel("2"))
            .await;

        let err = outcome.error().expect("dispatch should fail");
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(err.to_string().contains("API Key"));
        assert_eq!(adapter.calls(), 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_not_found() {
        let (dispatcher, adapter, _source) = setup(Behavior::Deliver, fast_config());

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("9"))
            .await;

        assert!(!outcome.is_retryable());
        assert_eq!(outcome.code(), Some(ErrorCode::NotFound));
        assert_eq!(adapter.calls(), 0);
        assert_eq!(dispatcher.circuit_state("9"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_validate_settings_checks_schema_first() {
        let (dispatcher, adapter, _source) = setup(Behavior::Deliver, fast_config());

        let err = dispatcher
            .validate_settings(&ModuleSettings::new().with("api_key", " "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(adapter.connection_tests.load(Ordering::SeqCst), 0);

        dispatcher
            .validate_settings(&module_settings())
            .await
            .unwrap();
        assert_eq!(adapter.connection_tests.load(Ordering::SeqCst), 1);
    }
}

mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_selected_channel_is_delivered() {
        let (dispatcher, adapter, _source) = setup(Behavior::Deliver, fast_config());

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;

        assert!(outcome.is_delivered());
        assert_eq!(adapter.calls(), 1);

        let payloads = adapter.payloads.lock();
        let payload = &payloads[0];
        assert_eq!(payload.channel, "2");
        assert_eq!(payload.bot_name, None);
        assert_eq!(payload.title, "Ticket #42 updated");
        let labels: Vec<&str> = payload.attributes.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, vec!["Priority", "Department"]);
    }

    #[tokio::test]
    async fn test_bot_name_is_forwarded() {
        let (dispatcher, adapter, _source) = setup(Behavior::Deliver, fast_config());

        let settings = to_channel("1").with("bot_name", "Billing Bot");
        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &settings)
            .await;

        assert!(outcome.is_delivered());
        assert_eq!(
            adapter.payloads.lock()[0].bot_name.as_deref(),
            Some("Billing Bot")
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_delivered() {
        for attempts in 1..=3usize {
            let (dispatcher, adapter, _source) = setup(
                Behavior::TransientThenDeliver(attempts - 1),
                fast_config(),
            );

            let outcome = dispatcher
                .dispatch(&ticket(), &module_settings(), &to_channel("2"))
                .await;

            assert!(outcome.is_delivered(), "attempts = {}", attempts);
            assert_eq!(adapter.calls(), attempts);
        }
    }

    #[tokio::test]
    async fn test_retried_sends_use_identical_payloads() {
        let (dispatcher, adapter, _source) =
            setup(Behavior::TransientThenDeliver(2), fast_config());

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert!(outcome.is_delivered());

        let payloads = adapter.payloads.lock();
        assert_eq!(payloads.len(), 3);
        let first = payloads[0].to_json_bytes().unwrap();
        for payload in payloads.iter() {
            assert_eq!(payload.to_json_bytes().unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysPermanent, fast_config());

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;

        assert!(!outcome.is_retryable());
        assert_eq!(outcome.code(), Some(ErrorCode::PermanentDeliveryError));
        assert!(
            outcome
                .error()
                .unwrap()
                .to_string()
                .contains("Invalid credentials")
        );
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let config = DispatcherConfig {
            max_attempts: 4,
            ..fast_config()
        };
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysTransient, config);

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;

        assert!(!outcome.is_retryable());
        assert!(outcome.error().unwrap().to_string().contains("busy (4)"));
        assert_eq!(adapter.calls(), 4);

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_channel_listing_is_cached_with_ttl() {
        let config = DispatcherConfig {
            channel_cache_ttl_ms: Some(60_000),
            ..fast_config()
        };
        let (dispatcher, _adapter, source) = setup(Behavior::Deliver, config);

        for _ in 0..3 {
            let outcome = dispatcher
                .dispatch(&ticket(), &module_settings(), &to_channel("1"))
                .await;
            assert!(outcome.is_delivered());
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_channel_listing_is_fresh_without_ttl() {
        let (dispatcher, _adapter, source) = setup(Behavior::Deliver, fast_config());

        for _ in 0..2 {
            dispatcher
                .dispatch(&ticket(), &module_settings(), &to_channel("1"))
                .await;
        }
        assert_eq!(source.calls(), 2);
    }
}

mod timeout_tests {
    use super::*;

    fn timeout_config() -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: 2,
            attempt_timeout_ms: 50,
            ..fast_config()
        }
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_by_default() {
        let (dispatcher, adapter, _source) = setup(Behavior::Hang, timeout_config());

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;

        assert_eq!(outcome.code(), Some(ErrorCode::TransientDeliveryError));
        assert!(outcome.error().unwrap().to_string().contains("timed out"));
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn test_adapter_can_opt_out_of_timeout_retries() {
        let adapter = SpyAdapter::with_non_retryable_timeouts(Behavior::Hang);
        let dispatcher =
            Dispatcher::with_config(timeout_config(), adapter.clone(), SpySource::new()).unwrap();

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;

        assert!(!outcome.is_retryable());
        assert_eq!(outcome.code(), Some(ErrorCode::PermanentDeliveryError));
        assert!(outcome.error().unwrap().to_string().contains("timed out"));
        assert_eq!(adapter.calls(), 1);
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let config = DispatcherConfig {
            initial_retry_delay_ms: 10_000,
            max_retry_delay_ms: 10_000,
            jitter: false,
            ..fast_config()
        };
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysTransient, config);
        let token = CancellationToken::new();

        let started = Instant::now();
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        };
        let (ticket, settings, channel) = (ticket(), module_settings(), to_channel("2"));
        let (outcome, ()) = tokio::join!(
            dispatcher.dispatch_with_cancellation(&ticket, &settings, &channel, &token),
            cancel
        );

        assert_eq!(outcome.code(), Some(ErrorCode::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(adapter.calls(), 1);
        assert_eq!(dispatcher.stats().cancelled, 1);
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_hanging_send() {
        let (dispatcher, adapter, _source) = setup(Behavior::Hang, fast_config());
        let token = CancellationToken::new();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let (ticket, settings, channel) = (ticket(), module_settings(), to_channel("2"));
        let (outcome, ()) = tokio::join!(
            dispatcher.dispatch_with_cancellation(&ticket, &settings, &channel, &token),
            cancel
        );

        assert_eq!(outcome.code(), Some(ErrorCode::Cancelled));
        assert_eq!(adapter.calls(), 1);
    }
}

mod circuit_breaker_tests {
    use super::*;

    fn breaker_config() -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: 1,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_ms: 100,
            ..fast_config()
        }
    }

    #[tokio::test]
    async fn test_circuit_opens_short_circuits_and_recovers() {
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysPermanent, breaker_config());

        for _ in 0..3 {
            dispatcher
                .dispatch(&ticket(), &module_settings(), &to_channel("2"))
                .await;
        }
        assert_eq!(adapter.calls(), 3);
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Open);

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert_eq!(outcome.code(), Some(ErrorCode::CircuitOpen));
        assert!(matches!(
            outcome.error(),
            Some(Error::CircuitOpen { retry_after, .. }) if *retry_after <= Duration::from_millis(100)
        ));
        assert_eq!(adapter.calls(), 3);
        assert_eq!(dispatcher.stats().short_circuited, 1);

        // Other destinations are unaffected.
        adapter.set_behavior(Behavior::Deliver);
        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("1"))
            .await;
        assert!(outcome.is_delivered());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert!(outcome.is_delivered());
        assert_eq!(adapter.calls(), 5);
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_circuit() {
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysPermanent, breaker_config());

        for _ in 0..3 {
            dispatcher
                .dispatch(&ticket(), &module_settings(), &to_channel("2"))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert_eq!(outcome.code(), Some(ErrorCode::PermanentDeliveryError));
        assert_eq!(adapter.calls(), 4);
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_abandoned_half_open_dispatch_frees_trial_slot() {
        let config = DispatcherConfig {
            circuit_breaker_threshold: 1,
            circuit_breaker_cooldown_ms: 50,
            ..breaker_config()
        };
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysPermanent, config);

        dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The half-open dispatch is dropped by the caller mid-send.
        adapter.set_behavior(Behavior::Hang);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.dispatch(&ticket(), &module_settings(), &to_channel("2")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(adapter.calls(), 2);

        adapter.set_behavior(Behavior::Deliver);
        let outcome = dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert!(outcome.is_delivered());
        assert_eq!(adapter.calls(), 3);
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retried_dispatch_counts_as_one_failure() {
        let config = DispatcherConfig {
            max_attempts: 3,
            ..breaker_config()
        };
        let (dispatcher, adapter, _source) = setup(Behavior::AlwaysTransient, config);

        dispatcher
            .dispatch(&ticket(), &module_settings(), &to_channel("2"))
            .await;
        assert_eq!(adapter.calls(), 3);
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_validate_settings_resets_breakers() {
        let (dispatcher, _adapter, _source) = setup(Behavior::AlwaysPermanent, breaker_config());

        for _ in 0..3 {
            dispatcher
                .dispatch(&ticket(), &module_settings(), &to_channel("2"))
                .await;
        }
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Open);

        dispatcher
            .validate_settings(&module_settings())
            .await
            .unwrap();
        assert_eq!(dispatcher.circuit_state("2"), CircuitState::Closed);
    }
}

mod interface_tests {
    use super::*;

    #[tokio::test]
    async fn test_dynamic_field_options() {
        let (dispatcher, _adapter, source) = setup(Behavior::Deliver, fast_config());

        let options = dispatcher
            .dynamic_field_options("channel", &module_settings())
            .await
            .unwrap();
        let names: Vec<&str> = options.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Tech Support", "Customer Service"]);

        let options = dispatcher
            .dynamic_field_options("department", &module_settings())
            .await
            .unwrap();
        assert!(options.is_empty());
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_schemas_and_description() {
        let (dispatcher, _adapter, _source) = setup(Behavior::Deliver, fast_config());

        let notification_schema = dispatcher.notification_settings_schema();
        assert!(notification_schema.get("channel").unwrap().required);
        assert!(!notification_schema.get("bot_name").unwrap().required);

        assert!(dispatcher.settings_schema().get("api_key").is_some());
        assert_eq!(dispatcher.description().display_name, "Spy");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = DispatcherConfig {
            max_attempts: 0,
            ..Default::default()
        };
        let result = Dispatcher::with_config(config, SpyAdapter::new(Behavior::Deliver), SpySource::new());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
