//! Server configuration

use clap::{ArgAction, Parser};
use std::time::Duration;

/// Runtime settings, read from flags or the environment
#[derive(Debug, Clone, Parser)]
#[command(name = "huddle", version, about = "Real-time issue collaboration server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "HUDDLE_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:huddle.db")]
    pub database_url: String,

    /// Window in which an identical message from the same sender is dropped
    #[arg(long, env = "HUDDLE_MESSAGE_DEDUP_MS", default_value_t = 2000)]
    pub message_dedup_ms: u64,

    /// Minimum spacing between relayed code edits per connection and snippet
    #[arg(long, env = "HUDDLE_CODE_SYNC_MS", default_value_t = 500)]
    pub code_sync_ms: u64,

    /// How long guard entries are retained before being swept
    #[arg(long, env = "HUDDLE_GUARD_HORIZON_MS", default_value_t = 5000)]
    pub guard_horizon_ms: u64,

    #[arg(long, env = "HUDDLE_PERSIST_TIMEOUT_MS", default_value_t = 5000)]
    pub persist_timeout_ms: u64,

    /// Comma separated terms the moderation gate blocks
    #[arg(
        long,
        env = "HUDDLE_FORBIDDEN_WORDS",
        value_delimiter = ',',
        default_value = "seed phrase,secret recovery phrase"
    )]
    pub forbidden_words: Vec<String>,

    /// Scan workspace uploads and file edits
    #[arg(
        long,
        env = "HUDDLE_MODERATE_WORKSPACE",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub moderate_workspace: bool,

    #[arg(long, env = "HUDDLE_WORKSPACE_TTL_HOURS", default_value_t = 72)]
    pub workspace_ttl_hours: i64,

    /// Upper bound on the total size of an uploaded workspace
    #[arg(long, env = "HUDDLE_MAX_WORKSPACE_BYTES", default_value_t = 5 * 1024 * 1024)]
    pub max_workspace_bytes: u64,

    /// Honour the `role` query parameter on upgrade. Only enable behind an
    /// auth proxy that sets it; otherwise every connection is a plain user.
    #[arg(
        long,
        env = "HUDDLE_TRUST_CLIENT_ROLE",
        action = ArgAction::Set,
        default_value_t = false
    )]
    pub trust_client_role: bool,
}

impl Config {
    pub fn message_dedup_window(&self) -> Duration {
        Duration::from_millis(self.message_dedup_ms)
    }

    pub fn code_sync_window(&self) -> Duration {
        Duration::from_millis(self.code_sync_ms)
    }

    pub fn guard_horizon(&self) -> Duration {
        Duration::from_millis(self.guard_horizon_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn workspace_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.workspace_ttl_hours)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            database_url: "sqlite:huddle.db".to_string(),
            message_dedup_ms: 2000,
            code_sync_ms: 500,
            guard_horizon_ms: 5000,
            persist_timeout_ms: 5000,
            forbidden_words: vec![
                "seed phrase".to_string(),
                "secret recovery phrase".to_string(),
            ],
            moderate_workspace: true,
            workspace_ttl_hours: 72,
            max_workspace_bytes: 5 * 1024 * 1024,
            trust_client_role: false,
        }
    }
}
