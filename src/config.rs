//! Bridge configuration
//!
//! Parses `<config_dir>/tool-bridge/config.toml`. Every field has a default, so
//! an empty file (or no file) yields a usable configuration apart from the
//! program to launch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Implementation;
use crate::{Error, Result};

/// Environment variable the identity token is handed to the child under
pub const DEFAULT_IDENTITY_ENV: &str = "TOOL_BRIDGE_IDENTITY";

/// Overrides `launch.program`
pub const PROGRAM_ENV: &str = "TOOL_BRIDGE_PROGRAM";

/// Overrides `identity`. Kept apart from [`DEFAULT_IDENTITY_ENV`] so a host
/// that was itself launched by a bridge keeps its own expectation.
pub const IDENTITY_ENV: &str = "TOOL_BRIDGE_EXPECTED_IDENTITY";

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Configuration for one bridge and the child process it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Registry key for this child-process identity
    pub name: String,

    /// Version marker for the tool logic the caller expects the child to run
    pub identity: String,

    /// Environment variable carrying `identity` into the child
    pub identity_env: String,

    /// Protocol version offered during `initialize`
    pub protocol_version: String,

    pub client_name: String,
    pub client_version: String,

    /// Per-call deadline in milliseconds, 0 disables it
    pub request_timeout_ms: u64,

    pub handshake_timeout_ms: u64,

    /// Time allowed for a graceful exit before the child is killed
    pub shutdown_grace_ms: u64,

    /// Longest stdout line accepted from the child
    pub max_line_bytes: usize,

    pub launch: LaunchConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "tool-server".to_string(),
            identity: env!("CARGO_PKG_VERSION").to_string(),
            identity_env: DEFAULT_IDENTITY_ENV.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 2_000,
            max_line_bytes: crate::transport::MAX_LINE_BYTES,
            launch: LaunchConfig::default(),
        }
    }
}

/// How to launch the child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Executable path, or a bare name looked up on PATH
    pub program: String,

    pub args: Vec<String>,

    /// Working directory of the child
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// When false the child only sees a small allowlist of variables plus `env`
    pub inherit_env: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            inherit_env: true,
        }
    }
}

impl LaunchConfig {
    /// Resolve `program` to an executable path
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if self.program.contains('/') || self.program.contains(std::path::MAIN_SEPARATOR) {
            return Ok(PathBuf::from(&self.program));
        }

        which::which(&self.program)
            .map_err(|e| Error::Spawn(format!("{} not found on PATH: {}", self.program, e)))
    }
}

impl BridgeConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("tool-bridge"))
            .unwrap_or_else(|| PathBuf::from(".tool-bridge"))
            .join("config.toml")
    }

    /// Read the config at `path`, or at the default location when `None`.
    ///
    /// A missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => {
                let path = Self::default_path();
                if !path.exists() {
                    tracing::warn!("Bridge config not found at {:?}, using defaults", path);
                    return Ok(Self::default());
                }
                Self::from_path(&path)
            }
        }
    }

    /// Read configuration from a specific path
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {:?}: {}", path, e)))?;

        let config: BridgeConfig = toml::from_str(&content)?;

        tracing::debug!(
            "Loaded bridge config {:?} (program {:?})",
            config.name,
            config.launch.program
        );

        Ok(config)
    }

    /// Apply `TOOL_BRIDGE_PROGRAM` / `TOOL_BRIDGE_EXPECTED_IDENTITY` overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(program) = lookup(PROGRAM_ENV) {
            self.launch.program = program;
        }
        if let Some(identity) = lookup(IDENTITY_ENV) {
            self.identity = identity;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("name must not be empty".to_string()));
        }
        if self.launch.program.trim().is_empty() {
            return Err(Error::Config("launch.program must not be empty".to_string()));
        }
        if self.identity_env.trim().is_empty() {
            return Err(Error::Config("identity_env must not be empty".to_string()));
        }
        if let Some(cwd) = &self.launch.cwd {
            crate::utils::validate_and_canonicalize_path(cwd)?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn client_info(&self) -> Implementation {
        Implementation {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }
}
