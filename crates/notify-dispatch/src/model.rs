//! Provider-agnostic notification model.
//!
//! A [`Notification`] is built by the host when a rule fires and handed to the
//! dispatcher read-only. Its [`Attribute`]s are small labelled values (client
//! name, ticket priority, invoice total, ...) that providers render as fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Visual style hint attached to an attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeStyle {
    #[default]
    Info,
    Success,
    Warning,
    Danger,
    Primary,
    Default,
}

impl AttributeStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Danger => "danger",
            Self::Primary => "primary",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for AttributeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "danger" => Ok(Self::Danger),
            "primary" => Ok(Self::Primary),
            "default" => Ok(Self::Default),
            other => Err(Error::validation(format!(
                "Unknown attribute style: {}",
                other
            ))),
        }
    }
}

/// A labelled value attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "AttributeRepr")]
pub struct Attribute {
    label: String,
    value: String,
    url: Option<String>,
    style: AttributeStyle,
    icon: Option<String>,
}

/// Unvalidated wire form of [`Attribute`].
#[derive(Deserialize)]
struct AttributeRepr {
    label: String,
    value: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    style: AttributeStyle,
    #[serde(default)]
    icon: Option<String>,
}

impl TryFrom<AttributeRepr> for Attribute {
    type Error = Error;

    fn try_from(repr: AttributeRepr) -> Result<Self> {
        let mut attribute = Attribute::new(repr.label, repr.value)?.with_style(repr.style);
        attribute.url = repr.url;
        attribute.icon = repr.icon;
        Ok(attribute)
    }
}

impl Attribute {
    /// Create an attribute with the default `info` style.
    ///
    /// Fails with a validation error when `label` or `value` is blank.
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let value = value.into();

        if label.trim().is_empty() {
            return Err(Error::validation("Attribute label must not be empty"));
        }
        if value.trim().is_empty() {
            return Err(Error::validation(format!(
                "Attribute '{}' must have a value",
                label
            )));
        }

        Ok(Self {
            label,
            value,
            url: None,
            style: AttributeStyle::default(),
            icon: None,
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_style(mut self, style: AttributeStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn style(&self) -> AttributeStyle {
        self.style
    }

    pub fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }
}

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    title: String,
    #[serde(default)]
    url: Option<String>,
    message: String,
    #[serde(default)]
    attributes: Vec<Attribute>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: None,
            message: message.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = Attribute>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
}
