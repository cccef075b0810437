//! Configuration for the Pub/Sub runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Production Pub/Sub endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Default push listener port.
pub const DEFAULT_PUSH_PORT: u16 = 8080;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Project that owns topics and subscriptions.
    pub project_id: String,
    /// Where the RPC channel connects.
    pub target: Target,
    /// Channel tuning.
    pub connection: ConnectionConfig,
    /// Push listener configuration.
    pub push: PushConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// RPC target selected at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    /// Unauthenticated local emulator at `host:port`.
    Emulator {
        /// `host:port` of the emulator.
        host: String,
    },
    /// Authenticated TLS endpoint.
    Production {
        /// Endpoint URL.
        endpoint: String,
    },
}

impl Target {
    /// True for the local emulator target.
    pub fn is_emulator(&self) -> bool {
        matches!(self, Target::Emulator { .. })
    }

    /// URI the channel connects to.
    pub fn uri(&self) -> String {
        match self {
            Target::Emulator { host } => format!("http://{}", host),
            Target::Production { endpoint } => endpoint.clone(),
        }
    }
}

/// Channel configuration: reconnect backoff, keepalive, idle and call timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// First reconnect/retry delay.
    pub initial_backoff: Duration,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub backoff_jitter: f64,
    /// Idle connections older than this are recycled.
    pub idle_timeout: Duration,
    /// HTTP/2 keepalive ping interval.
    pub keepalive_interval: Duration,
    /// How long to wait for a keepalive ack.
    pub keepalive_timeout: Duration,
    /// Default per-call timeout.
    pub call_timeout: Duration,
    /// Calls wait for the channel to become ready instead of failing fast.
    pub wait_for_ready: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 1.6,
            backoff_jitter: 0.2,
            idle_timeout: Duration::from_secs(30 * 60),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(60),
            wait_for_ready: true,
        }
    }
}

/// Push listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Bind address.
    pub bind_address: String,
    /// Listen port.
    pub port: u16,
    /// Force push support on or off. `None` means "supported unless talking
    /// to the emulator".
    pub push_supported: Option<bool>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PUSH_PORT,
            push_supported: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env-filter directive.
    pub level: String,
    /// Log format (text or json).
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format.
    Text,
    /// JSON format.
    Json,
}

impl RuntimeConfig {
    /// Configuration for `project_id` against the production endpoint.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            target: Target::Production {
                endpoint: DEFAULT_ENDPOINT.to_string(),
            },
            connection: ConnectionConfig::default(),
            push: PushConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Point the configuration at a local emulator.
    pub fn with_emulator(mut self, host: impl Into<String>) -> Result<Self> {
        let host = host.into();
        validate_emulator_host(&host)?;
        self.target = Target::Emulator { host };
        Ok(self)
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let project_id = non_empty("PUBSUB_PROJECT_ID")
            .or_else(|| non_empty("GOOGLE_CLOUD_PROJECT"))
            .ok_or_else(|| {
                Error::Config(
                    "missing project ID (set PUBSUB_PROJECT_ID or GOOGLE_CLOUD_PROJECT)"
                        .to_string(),
                )
            })?;

        let mut config = Self::new(project_id);

        if let Some(endpoint) = non_empty("PUBSUB_ENDPOINT") {
            config.target = Target::Production { endpoint };
        }
        if let Some(host) = non_empty("PUBSUB_EMULATOR_HOST") {
            config = config.with_emulator(host)?;
        }

        if let Some(port) = non_empty("PORT") {
            config.push.port = port
                .parse()
                .map_err(|e| Error::Config(format!("invalid PORT {:?}: {}", port, e)))?;
        }
        if let Some(flag) = non_empty("PUBSUB_PUSH_SUPPORTED") {
            config.push.push_supported = Some(parse_bool(&flag).ok_or_else(|| {
                Error::Config(format!("invalid PUBSUB_PUSH_SUPPORTED {:?}", flag))
            })?);
        }

        if let Some(level) = non_empty("PUBSUB_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = non_empty("PUBSUB_LOG_FORMAT") {
            config.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => return Err(Error::Config(format!("unknown log format {:?}", other))),
            };
        }

        Ok(config)
    }

    /// Whether the remote environment delivers push requests.
    pub fn push_supported(&self) -> bool {
        self.push
            .push_supported
            .unwrap_or(!self.target.is_emulator())
    }
}

/// Check an emulator address of the form `host:port`.
pub fn validate_emulator_host(host: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Error::Config(format!("malformed emulator host {:?}: {}", host, reason))
    };

    let (name, port) = host
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;

    if name.is_empty() || name == "[]" {
        return Err(invalid("empty host"));
    }
    if name.contains('/') {
        return Err(invalid("host must not include a scheme or path"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid("port is not a number in 0-65535"))?;

    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
