use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Command-line flags. Every value is optional so that an unset flag does
/// not mask the TOML file or the environment.
#[derive(Parser, Serialize, Debug, Default)]
#[command(name = "relay-server", version, about = "One-to-one WebSocket message relay")]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "RELAY_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long, env = "RELAY_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./relay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Print a signed access token for the given user id and exit
    #[arg(long, value_name = "USER_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_token: Option<i64>,

    /// Data directory for persistent state (DB, signing key)
    #[arg(long, env = "RELAY_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Shared HS256 secret. When unset, a random key is kept in data_dir.
    #[arg(long, env = "RELAY_JWT_SECRET", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Lifetime of tokens issued with --issue-token
    #[arg(long, env = "RELAY_TOKEN_TTL_SECS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_ttl_secs: Option<u64>,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub config: String,
    pub json_logs: bool,
    pub generate_config: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_token: Option<i64>,
    pub data_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    pub token_ttl_secs: u64,
    /// Per-connection session settings (loaded from [session] section in TOML)
    #[serde(default)]
    pub session: SessionConfig,
}

/// How an accepted message is presented to its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Replay the sender's frame byte-for-byte.
    #[default]
    Verbatim,
    /// Send a server-built frame from the persisted record (sender, id, time).
    Enriched,
}

/// Settings for each connection session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Largest inbound frame accepted, in bytes (default: 65536)
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Time the writer gets to flush a close frame on teardown (default: 1000)
    #[serde(default = "default_close_grace")]
    pub close_grace_millis: u64,

    /// "verbatim" or "enriched" (default: verbatim)
    #[serde(default)]
    pub forward_mode: ForwardMode,
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_millis)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            max_message_bytes: default_max_message_bytes(),
            close_grace_millis: default_close_grace(),
            forward_mode: ForwardMode::Verbatim,
        }
    }
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_close_grace() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./relay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            issue_token: None,
            data_dir: "./data".to_string(),
            jwt_secret: None,
            token_ttl_secs: 86400,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RELAY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Cli::parse()).extract::<Self>()?.validate()
    }

    /// Reject settings that would break every session at runtime.
    pub fn validate(self) -> Result<Self, figment::Error> {
        if self.session.ping_interval_secs == 0 {
            return Err("session.ping_interval_secs must be greater than 0".to_string().into());
        }
        if self.session.pong_timeout_secs == 0 {
            return Err("session.pong_timeout_secs must be greater than 0".to_string().into());
        }
        Ok(self)
    }

    pub fn figment(cli: Cli) -> Figment {
        let config_path = cli.config.clone();

        // Nested keys use a double underscore: RELAY_SESSION__FORWARD_MODE
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Relay Server Configuration
# Place this file at ./relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and generated signing key
# data_dir = "./data"

# Shared HS256 secret used to verify access tokens.
# Leave unset to generate a random key in data_dir/jwt_secret.
# jwt_secret = ""

# Lifetime of tokens printed by --issue-token
# token_ttl_secs = 86400

# ---- Sessions ----
# [session]
# ping_interval_secs = 30
# pong_timeout_secs = 10
# max_message_bytes = 65536
# close_grace_millis = 1000

# "verbatim" replays the sender's frame unchanged.
# "enriched" sends {id, sender_id, receiver_id, msg, time} from the stored record.
# forward_mode = "verbatim"
"#
    .to_string()
}
