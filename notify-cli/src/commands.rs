use std::path::Path;

use anyhow::{Context, bail};
use notify_dispatch::{
    Attribute, DeliveryOutcome, Dispatcher, ModuleSettings, Notification, NotificationSettings,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs CLI commands against a configured dispatcher.
pub struct CommandExecutor {
    dispatcher: Dispatcher,
    module_settings: ModuleSettings,
}

/// Notification fields given on the command line.
pub struct SendArgs {
    pub channel: String,
    pub title: Option<String>,
    pub message: String,
    pub url: Option<String>,
    pub attributes: Vec<String>,
    pub bot_name: Option<String>,
    pub file: Option<std::path::PathBuf>,
}

impl CommandExecutor {
    pub fn new(dispatcher: Dispatcher, module_settings: ModuleSettings) -> Self {
        Self {
            dispatcher,
            module_settings,
        }
    }

    pub async fn send(&self, args: SendArgs, token: &CancellationToken) -> anyhow::Result<()> {
        let notification = match &args.file {
            Some(path) => load_notification(path).await?,
            None => build_notification(&args)?,
        };

        let mut settings = NotificationSettings::new().with("channel", args.channel.as_str());
        if let Some(bot_name) = &args.bot_name {
            settings = settings.with("bot_name", bot_name.as_str());
        }

        let outcome = self
            .dispatcher
            .dispatch_with_cancellation(&notification, &self.module_settings, &settings, token)
            .await;

        let stats = self.dispatcher.stats();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            short_circuited = stats.short_circuited,
            "Dispatch finished"
        );

        match outcome {
            DeliveryOutcome::Delivered => {
                println!(
                    "{}",
                    json!({ "status": "delivered", "channel": args.channel })
                );
                Ok(())
            }
            DeliveryOutcome::Failed { error, .. } => {
                println!(
                    "{}",
                    json!({
                        "status": "failed",
                        "channel": args.channel,
                        "code": error.code(),
                        "message": error.to_string(),
                    })
                );
                bail!("Delivery failed ({}): {}", error.code(), error)
            }
        }
    }

    pub async fn test_connection(&self) -> anyhow::Result<()> {
        let description = self.dispatcher.description();
        self.dispatcher
            .validate_settings(&self.module_settings)
            .await
            .with_context(|| format!("{} connection test failed", description.display_name))?;
        println!("{} connection OK", description.display_name);
        Ok(())
    }

    pub async fn list_channels(&self, as_json: bool) -> anyhow::Result<()> {
        let channels = self
            .dispatcher
            .dynamic_field_options("channel", &self.module_settings)
            .await?;

        if as_json {
            println!("{}", serde_json::to_string_pretty(&channels)?);
            return Ok(());
        }

        if channels.is_empty() {
            warn!("No channels available");
        }
        for channel in &channels {
            if channel.description.is_empty() {
                println!("{:>8}  {}", channel.id, channel.name);
            } else {
                println!("{:>8}  {} ({})", channel.id, channel.name, channel.description);
            }
        }
        Ok(())
    }

    pub fn print_schema(&self) -> anyhow::Result<()> {
        let schema = json!({
            "description": self.dispatcher.description(),
            "settings": self.dispatcher.settings_schema(),
            "notification_settings": self.dispatcher.notification_settings_schema(),
        });
        println!("{}", serde_json::to_string_pretty(&schema)?);
        Ok(())
    }
}

async fn load_notification(path: &Path) -> anyhow::Result<Notification> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read notification file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid notification file {}", path.display()))
}

fn build_notification(args: &SendArgs) -> anyhow::Result<Notification> {
    let title = args.title.as_deref().context("--title is required")?;
    let mut notification = Notification::new(title, args.message.as_str());
    if let Some(url) = &args.url {
        notification = notification.with_url(url.as_str());
    }
    for raw in &args.attributes {
        notification = notification.with_attribute(parse_attribute(raw)?);
    }
    Ok(notification)
}

/// Parse `LABEL=VALUE`.
fn parse_attribute(raw: &str) -> anyhow::Result<Attribute> {
    let Some((label, value)) = raw.split_once('=') else {
        bail!("Invalid attribute '{}', expected LABEL=VALUE", raw);
    };
    Ok(Attribute::new(label.trim(), value.trim())?)
}
