//! Notification to payload rendering.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::channel::ChannelOption;
use crate::model::{Attribute, AttributeStyle, Notification};
use crate::settings::NotificationSettings;

/// A rendered attribute, in notification order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedAttribute {
    pub label: String,
    pub value: String,
    pub url: Option<String>,
    pub style: AttributeStyle,
    pub icon: Option<String>,
}

impl From<&Attribute> for RenderedAttribute {
    fn from(attribute: &Attribute) -> Self {
        Self {
            label: attribute.label().to_string(),
            value: attribute.value().to_string(),
            url: attribute.url().map(str::to_string),
            style: attribute.style(),
            icon: attribute.icon().map(str::to_string),
        }
    }
}

/// Provider-neutral payload handed to a delivery adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Target destination id.
    pub channel: String,
    pub bot_name: Option<String>,
    pub title: String,
    pub url: Option<String>,
    pub message: String,
    pub attributes: Vec<RenderedAttribute>,
}

impl Payload {
    /// Canonical JSON encoding of the payload.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Build the payload for `notification` addressed to `channel`.
///
/// Pure: identical inputs always produce identical payloads, which keeps
/// retried sends idempotent.
pub fn render(
    notification: &Notification,
    channel: &ChannelOption,
    settings: &NotificationSettings,
) -> Payload {
    Payload {
        channel: channel.id.clone(),
        bot_name: settings.bot_name().map(str::to_string),
        title: notification.title().to_string(),
        url: notification.url().map(str::to_string),
        message: notification.message().to_string(),
        attributes: notification
            .attributes()
            .iter()
            .map(RenderedAttribute::from)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelOption {
        ChannelOption::new("2", "Customer Service", "Channel ID")
    }

    fn notification_with(labels: &[&str]) -> Notification {
        Notification::new("Invoice Paid", "Invoice #1001 has been paid").with_attributes(
            labels
                .iter()
                .map(|l| Attribute::new(*l, format!("value-{l}")).unwrap()),
        )
    }

    #[test]
    fn test_render_maps_all_fields() {
        let notification = Notification::new("New Order", "Order #7 placed")
            .with_url("https://billing.example.com/orders/7")
            .with_attribute(
                Attribute::new("Total", "$25.00")
                    .unwrap()
                    .with_style(AttributeStyle::Success)
                    .with_url("https://billing.example.com/invoices/9")
                    .with_icon("fas fa-dollar-sign"),
            );
        let settings = NotificationSettings::new()
            .with("channel", "2")
            .with("bot_name", "Billing Bot");

        let payload = render(&notification, &channel(), &settings);

        assert_eq!(payload.channel, "2");
        assert_eq!(payload.bot_name.as_deref(), Some("Billing Bot"));
        assert_eq!(payload.title, "New Order");
        assert_eq!(
            payload.url.as_deref(),
            Some("https://billing.example.com/orders/7")
        );
        assert_eq!(payload.message, "Order #7 placed");
        assert_eq!(
            payload.attributes,
            vec![RenderedAttribute {
                label: "Total".to_string(),
                value: "$25.00".to_string(),
                url: Some("https://billing.example.com/invoices/9".to_string()),
                style: AttributeStyle::Success,
                icon: Some("fas fa-dollar-sign".to_string()),
            }]
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let notification = notification_with(&["Client", "Amount", "Gateway"]);
        let settings = NotificationSettings::new().with("channel", "2");

        let first = render(&notification, &channel(), &settings)
            .to_json_bytes()
            .unwrap();
        let second = render(&notification, &channel(), &settings)
            .to_json_bytes()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_preserves_attribute_order() {
        let settings = NotificationSettings::new().with("channel", "2");

        for labels in [vec![], vec!["Only"], vec!["Zeta", "Alpha", "Mid", "Beta"]] {
            let payload = render(&notification_with(&labels), &channel(), &settings);
            let rendered: Vec<&str> = payload
                .attributes
                .iter()
                .map(|a| a.label.as_str())
                .collect();
            assert_eq!(rendered, labels);
        }
    }

    #[test]
    fn test_blank_bot_name_is_omitted() {
        let settings = NotificationSettings::new()
            .with("channel", "2")
            .with("bot_name", " ");
        let payload = render(&notification_with(&[]), &channel(), &settings);
        assert_eq!(payload.bot_name, None);
    }
}
