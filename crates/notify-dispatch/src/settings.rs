//! Module and rule settings, and the field schemas they are checked against.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Key of the dynamic field holding the selected destination.
pub const CHANNEL_FIELD: &str = "channel";

/// Key of the optional bot display name field.
pub const BOT_NAME_FIELD: &str = "bot_name";

/// Provider-level settings (credentials, endpoints).
///
/// Opaque to the dispatcher; only delivery adapters interpret the values.
/// `Debug` prints keys only so credentials never reach logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleSettings(BTreeMap<String, String>);

impl ModuleSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value for `key`, or `None` when absent or blank.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Debug for ModuleSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl From<BTreeMap<String, String>> for ModuleSettings {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Per-rule settings chosen when a notification rule is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationSettings(BTreeMap<String, String>);

impl NotificationSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The selected destination id, or `None` when absent or blank.
    pub fn channel(&self) -> Option<&str> {
        self.get(CHANNEL_FIELD)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// The bot display name, or `None` when absent or blank.
    pub fn bot_name(&self) -> Option<&str> {
        self.get(BOT_NAME_FIELD)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NotificationSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Input type of a settings field, as a host would render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Password,
    YesNo,
    Dropdown,
    Radio,
    Textarea,
    /// Options are supplied at runtime by `dynamic_field_options`.
    Dynamic,
}

/// A single settings field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub key: String,
    pub friendly_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl FieldDefinition {
    pub fn new(
        key: impl Into<String>,
        friendly_name: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self {
            key: key.into(),
            friendly_name: friendly_name.into(),
            field_type,
            description: String::new(),
            required: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Ordered collection of field definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema(Vec<FieldDefinition>);

impl FieldSchema {
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        Self(fields)
    }

    /// Default rule-level schema: optional bot name, required channel.
    pub fn notification_default() -> Self {
        Self(vec![
            FieldDefinition::new(BOT_NAME_FIELD, "Bot Name", FieldType::Text)
                .description("Define the name of your notification bot."),
            FieldDefinition::new(CHANNEL_FIELD, "Channel", FieldType::Dynamic)
                .description("Select the desired channel for notification delivery.")
                .required(),
        ])
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&FieldDefinition> {
        self.0.iter().find(|f| f.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that every required field has a non-blank value.
    ///
    /// All missing fields are reported in a single validation error.
    pub fn validate(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let missing: Vec<&str> = self
            .0
            .iter()
            .filter(|f| f.required)
            .filter(|f| values.get(&f.key).is_none_or(|v| v.trim().is_empty()))
            .map(|f| f.friendly_name.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Display metadata a host shows for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescription {
    pub display_name: String,
    #[serde(default)]
    pub logo_file_name: Option<String>,
}

impl ModuleDescription {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            logo_file_name: None,
        }
    }

    pub fn with_logo(mut self, logo_file_name: impl Into<String>) -> Self {
        self.logo_file_name = Some(logo_file_name.into());
        self
    }
}
