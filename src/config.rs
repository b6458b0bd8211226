//! Configuration for Stagehand
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::surface::ConnectionConfig;

/// Stagehand - control-surface connection managers for a streaming
/// dashboard
#[derive(Parser, Debug, Clone)]
#[command(name = "stagehand")]
#[command(about = "Remote-control local streaming tools from a dashboard")]
pub struct Args {
    /// Compositor WebSocket host
    #[arg(long, env = "COMPOSITOR_HOST", default_value = "127.0.0.1")]
    pub compositor_host: String,

    /// Compositor WebSocket port
    #[arg(long, env = "COMPOSITOR_PORT", default_value = "4455")]
    pub compositor_port: u16,

    /// Compositor connection password (omit when the compositor runs
    /// without authentication)
    #[arg(long, env = "COMPOSITOR_PASSWORD")]
    pub compositor_password: Option<String>,

    /// Avatar tool WebSocket host
    #[arg(long, env = "AVATAR_HOST", default_value = "127.0.0.1")]
    pub avatar_host: String,

    /// Avatar tool WebSocket port
    #[arg(long, env = "AVATAR_PORT", default_value = "8001")]
    pub avatar_port: u16,

    /// Where the issued avatar-tool credential is persisted
    #[arg(long, env = "AVATAR_TOKEN_FILE", default_value = "avatar_token.json")]
    pub avatar_token_file: PathBuf,

    /// Connect timeout in milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "3000")]
    pub connect_timeout_ms: u64,

    /// Request/response timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Connection settings for the compositor manager.
    pub fn compositor_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.compositor_host.clone(), self.compositor_port)
            .with_password(self.compositor_password.clone())
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    /// Connection settings for the avatar-tool manager.
    pub fn avatar_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.avatar_host.clone(), self.avatar_port)
            .with_credential_file(self.avatar_token_file.clone())
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.compositor_config()
            .validate()
            .map_err(|e| format!("compositor: {e}"))?;
        self.avatar_config()
            .validate()
            .map_err(|e| format!("avatar tool: {e}"))?;

        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err("timeouts must be non-zero".to_string());
        }

        Ok(())
    }
}
