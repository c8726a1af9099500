//! Tool Bridge - process bridge to a long-lived stdio JSON-RPC tool server
//!
//! A [`ProcessBridge`] owns one child process speaking newline-delimited
//! JSON-RPC 2.0, performs the `initialize` handshake, and lets unrelated
//! concurrent callers issue requests against it. Hosts that reload keep a
//! [`BridgeRegistry`] and attach to their bridge by name.

pub mod bridge;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod transport;

mod error;
mod tools;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{
    BridgeStatus, CommandLauncher, IdentityMatch, LaunchMatch, Launcher, NeverStale, Phase,
    ProcessBridge, ProcessBridgeBuilder, ProcessInfo, SpawnedChild, StalenessPolicy,
};
pub use config::{BridgeConfig, LaunchConfig};
pub use error::{Error, Result};
pub use protocol::{Notification, ToolInfo};
pub use registry::BridgeRegistry;

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber.
///
/// Honors `RUST_LOG`, defaulting to `tool_bridge=info`. Stdout is left alone so
/// hosts can use it for their own output. Calling this twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tool_bridge=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
