//! Destination channel enumeration and resolution.
//!
//! The host supplies a [`ChannelSource`] that knows which destinations are
//! currently available for a given set of module settings. The
//! [`ChannelResolver`] validates a rule's selected channel against that list,
//! optionally caching listings for an explicit TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::settings::ModuleSettings;
use crate::{Error, Result};

/// Maximum number of distinct settings fingerprints kept per resolver.
const CHANNEL_CACHE_CAPACITY: u64 = 64;

/// A selectable delivery destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelOption {
    #[serde(deserialize_with = "deserialize_channel_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ChannelOption {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Hosts commonly hand out numeric ids; store them in decimal form.
fn deserialize_channel_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChannelId {
        Text(String),
        Number(i64),
    }

    Ok(match ChannelId::deserialize(deserializer)? {
        ChannelId::Text(s) => s,
        ChannelId::Number(n) => n.to_string(),
    })
}

/// Host capability that enumerates available destinations.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// List destinations reachable with `settings`.
    ///
    /// Must not mutate state. An empty list is a valid answer.
    async fn list_channels(&self, settings: &ModuleSettings) -> Result<Vec<ChannelOption>>;
}

/// A fixed destination list, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticChannelSource {
    channels: Vec<ChannelOption>,
}

impl StaticChannelSource {
    pub fn new(channels: Vec<ChannelOption>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ChannelSource for StaticChannelSource {
    async fn list_channels(&self, _settings: &ModuleSettings) -> Result<Vec<ChannelOption>> {
        Ok(self.channels.clone())
    }
}

/// Resolves a rule's selected channel id against the host's destinations.
pub struct ChannelResolver {
    source: Arc<dyn ChannelSource>,
    cache: Option<Cache<String, Arc<Vec<ChannelOption>>>>,
}

impl ChannelResolver {
    /// Create a resolver that queries `source` on every call.
    pub fn new(source: Arc<dyn ChannelSource>) -> Self {
        Self {
            source,
            cache: None,
        }
    }

    /// Create a resolver whose listings are reused for `ttl`.
    pub fn with_ttl(source: Arc<dyn ChannelSource>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(CHANNEL_CACHE_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self {
            source,
            cache: Some(cache),
        }
    }

    /// List currently available destinations.
    pub async fn list_channels(&self, settings: &ModuleSettings) -> Result<Vec<ChannelOption>> {
        let Some(cache) = &self.cache else {
            return self.source.list_channels(settings).await;
        };

        let key = settings_fingerprint(settings);
        if let Some(cached) = cache.get(&key).await {
            debug!("Channel list served from cache ({} entries)", cached.len());
            return Ok(cached.as_ref().clone());
        }

        let channels = self.source.list_channels(settings).await?;
        cache.insert(key, Arc::new(channels.clone())).await;
        Ok(channels)
    }

    /// Look up `field_value` among the available destinations.
    pub async fn resolve(
        &self,
        field_value: &str,
        settings: &ModuleSettings,
    ) -> Result<ChannelOption> {
        let id = field_value.trim();
        if id.is_empty() {
            return Err(Error::not_found("Channel", "<none selected>"));
        }

        self.list_channels(settings)
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::not_found("Channel", id))
    }

    /// Drop any cached listing for `settings`.
    pub async fn invalidate(&self, settings: &ModuleSettings) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&settings_fingerprint(settings)).await;
        }
    }
}

/// Stable digest of the settings, so cache keys never hold credentials.
fn settings_fingerprint(settings: &ModuleSettings) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in settings.as_map() {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}
