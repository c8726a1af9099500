//! Staleness policies
//!
//! Decide whether a live tool server still runs the logic the caller expects.
//! The identity token handed to the child at spawn time is compared verbatim;
//! nothing inspects argv.

use super::process::ProcessInfo;
use crate::config::BridgeConfig;

pub trait StalenessPolicy: Send + Sync + 'static {
    /// True when `running` should be replaced before serving `expected`.
    fn is_stale(&self, running: &ProcessInfo, expected: &BridgeConfig) -> bool;

    fn name(&self) -> &'static str;
}

/// Stale when the identity token differs
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMatch;

impl StalenessPolicy for IdentityMatch {
    fn is_stale(&self, running: &ProcessInfo, expected: &BridgeConfig) -> bool {
        running.identity != expected.identity
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Stale when the identity token or any launch parameter differs
#[derive(Debug, Default, Clone, Copy)]
pub struct LaunchMatch;

impl StalenessPolicy for LaunchMatch {
    fn is_stale(&self, running: &ProcessInfo, expected: &BridgeConfig) -> bool {
        running.identity != expected.identity || running.launch != expected.launch
    }

    fn name(&self) -> &'static str {
        "launch"
    }
}

/// Keep the running process until it exits
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStale;

impl StalenessPolicy for NeverStale {
    fn is_stale(&self, _running: &ProcessInfo, _expected: &BridgeConfig) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "never"
    }
}
