use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "notify-cli", author, version, about = "Dispatch notifications through pluggable providers", long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "NOTIFY_CLI_CONFIG", global = true, default_value = "notify.json")]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a notification
    Send {
        /// Destination channel id
        #[arg(long)]
        channel: String,

        /// Notification title
        #[arg(short, long, required_unless_present = "file")]
        title: Option<String>,

        /// Notification body
        #[arg(short, long, default_value = "")]
        message: String,

        /// Link attached to the title
        #[arg(long)]
        url: Option<String>,

        /// Attribute as LABEL=VALUE, repeatable
        #[arg(short, long = "attribute", value_name = "LABEL=VALUE")]
        attributes: Vec<String>,

        /// Bot name shown by the provider
        #[arg(long)]
        bot_name: Option<String>,

        /// Read the notification from a JSON file instead of flags
        #[arg(short, long, conflicts_with_all = ["title", "url", "attributes"])]
        file: Option<PathBuf>,
    },

    /// Verify the configured provider credentials
    TestConnection,

    /// List available channels
    Channels {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the settings schemas of the configured provider
    Schema,
}
