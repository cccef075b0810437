// CLI module for pubsub-runtime
/// Command execution handlers
pub mod commands;
/// Output formatting utilities
pub mod output;

use clap::{Args, Parser, Subcommand};

use crate::config::RuntimeConfig;
use crate::error::Result;

/// Command-line interface for pubsub-runtime
#[derive(Parser)]
#[command(name = "pubsub-runtime")]
#[command(author, version, about = "Publish, pull and receive push deliveries from Google Cloud Pub/Sub", long_about = None)]
pub struct Cli {
    /// Connection settings shared by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Settings that override the environment-derived configuration
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Project that owns topics and subscriptions
    #[arg(long, global = true, env = "PUBSUB_PROJECT_ID")]
    pub project: Option<String>,

    /// Local emulator address (host:port)
    #[arg(long, global = true, env = "PUBSUB_EMULATOR_HOST")]
    pub emulator_host: Option<String>,

    /// Log level or filter directive
    #[arg(long, global = true, env = "PUBSUB_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Publish text messages to a topic
    Publish {
        /// Topic name
        #[arg(long)]
        topic: String,

        /// Message body; repeat to publish a batch
        #[arg(long = "data", required = true)]
        data: Vec<String>,

        /// Attribute applied to every message (key=value)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },

    /// Pull messages from a subscription and log them
    Listen {
        /// Subscription name
        #[arg(long)]
        subscription: String,

        /// Topic the subscription is attached to
        #[arg(long)]
        topic: String,

        /// Maximum messages per pull
        #[arg(long, default_value = "1000")]
        max_messages: i32,

        /// Delete the subscription on exit
        #[arg(long)]
        delete_on_exit: bool,
    },

    /// Accept push deliveries for a subscription and log them
    ServePush {
        /// Subscription name
        #[arg(long)]
        subscription: String,

        /// Topic the subscription is attached to
        #[arg(long)]
        topic: String,

        /// Listen port
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Show the resolved configuration
    Config,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl GlobalArgs {
    /// Resolve configuration from these flags, falling back to the environment.
    pub fn load_config(&self) -> Result<RuntimeConfig> {
        RuntimeConfig::from_lookup(|key| {
            let flag = match key {
                "PUBSUB_PROJECT_ID" => self.project.clone(),
                "PUBSUB_EMULATOR_HOST" => self.emulator_host.clone(),
                "PUBSUB_LOG_LEVEL" => self.log_level.clone(),
                _ => None,
            };
            flag.or_else(|| std::env::var(key).ok())
        })
    }
}

fn parse_attribute(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected key=value, got {:?}", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from([
            "pubsub-runtime",
            "--project",
            "acme",
            "publish",
            "--topic",
            "orders",
            "--data",
            "one",
            "--data",
            "two",
            "--attr",
            "source=cli",
        ])
        .unwrap();

        assert_eq!(cli.global.project.as_deref(), Some("acme"));
        match cli.command {
            Commands::Publish {
                topic,
                data,
                attributes,
            } => {
                assert_eq!(topic, "orders");
                assert_eq!(data, vec!["one", "two"]);
                assert_eq!(attributes, vec![("source".to_string(), "cli".to_string())]);
            }
            _ => panic!("Expected publish command"),
        }
    }

    #[test]
    fn test_attribute_requires_key() {
        assert!(parse_attribute("=value").is_err());
        assert!(parse_attribute("novalue").is_err());
        assert_eq!(
            parse_attribute("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn test_flags_override_environment() {
        let args = GlobalArgs {
            project: Some("flag-project".to_string()),
            emulator_host: Some("localhost:8085".to_string()),
            log_level: None,
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.project_id, "flag-project");
        assert!(config.target.is_emulator());
    }
}
