//! CLI configuration file.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use notify_dispatch::adapter::{TelegramAdapter, TelegramConfig, WebhookAdapter, WebhookConfig};
use notify_dispatch::{
    ChannelOption, DeliveryAdapter, Dispatcher, DispatcherConfig, ModuleSettings,
    StaticChannelSource,
};
use serde::{Deserialize, Serialize};

/// Provider selection and its adapter options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Webhook(WebhookConfig),
    Telegram(TelegramConfig),
}

impl ProviderConfig {
    pub fn build_adapter(&self) -> Arc<dyn DeliveryAdapter> {
        match self {
            Self::Webhook(config) => Arc::new(WebhookAdapter::new(config.clone())),
            Self::Telegram(config) => Arc::new(TelegramAdapter::new(config.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub module_settings: ModuleSettings,
    #[serde(default)]
    pub channels: Vec<ChannelOption>,
}

impl AppConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.dispatcher.validate()?;
        if config.channels.is_empty() {
            tracing::warn!("No channels configured; every dispatch will fail to resolve");
        }
        Ok(config)
    }

    pub fn build_dispatcher(&self) -> anyhow::Result<Dispatcher> {
        let channels = Arc::new(StaticChannelSource::new(self.channels.clone()));
        let dispatcher = Dispatcher::with_config(
            self.dispatcher.clone(),
            self.provider.build_adapter(),
            channels,
        )?;
        Ok(dispatcher)
    }
}
