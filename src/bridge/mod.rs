//! Process bridge
//!
//! Owns one tool server child at a time, performs the handshake, and lets any
//! number of concurrent callers issue requests against it. Startup is shared:
//! callers that race into [`ProcessBridge::ensure_started`] all await the same
//! launch, and a launch failure is reported to each of them.
//!
//! Lock order is `lifecycle` → `config` → `last_error` → pending table. No lock
//! is held across an `.await`.

pub(crate) mod pending;
pub(crate) mod process;
pub mod staleness;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::protocol::{Implementation, Notification};
use crate::utils::validate_name;
use crate::{Error, Result};

use pending::PendingCalls;
use process::ChildProcess;

pub use process::{CommandLauncher, Launcher, ProcessInfo, SpawnedChild};
pub use staleness::{IdentityMatch, LaunchMatch, NeverStale, StalenessPolicy};

/// Buffered notifications per subscriber before the oldest are dropped
const NOTIFICATION_CAPACITY: usize = 256;

type Startup = Shared<BoxFuture<'static, Result<Arc<ChildProcess>>>>;

enum Lifecycle {
    NotStarted,
    Starting { generation: u64, startup: Startup },
    Ready(Arc<ChildProcess>),
    /// The last launch failed
    Degraded,
    Terminated,
}

/// Coarse state reported by [`ProcessBridge::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    NotStarted,
    Starting,
    Ready,
    /// The process exited or the last launch failed; the next call respawns
    Degraded,
    Terminated,
}

/// Snapshot of a bridge for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub instance_id: Uuid,
    pub name: String,
    pub phase: Phase,
    pub expected_identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    pub pending_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct BridgeInner {
    instance_id: Uuid,
    config: RwLock<BridgeConfig>,
    launcher: Arc<dyn Launcher>,
    staleness: Arc<dyn StalenessPolicy>,
    pending: Arc<PendingCalls>,
    notifications: broadcast::Sender<Notification>,
    lifecycle: Mutex<Lifecycle>,
    generation: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Handle to a bridge; clones share the same child process
#[derive(Clone)]
pub struct ProcessBridge {
    inner: Arc<BridgeInner>,
}

pub struct ProcessBridgeBuilder {
    config: BridgeConfig,
    launcher: Arc<dyn Launcher>,
    staleness: Arc<dyn StalenessPolicy>,
}

impl ProcessBridgeBuilder {
    /// Replace the OS launcher
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn staleness(mut self, policy: impl StalenessPolicy) -> Self {
        self.staleness = Arc::new(policy);
        self
    }

    pub fn build(self) -> Result<ProcessBridge> {
        self.config.validate()?;

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let inner = BridgeInner {
            instance_id: Uuid::new_v4(),
            config: RwLock::new(self.config),
            launcher: self.launcher,
            staleness: self.staleness,
            pending: Arc::new(PendingCalls::new()),
            notifications,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            generation: AtomicU64::new(0),
            last_error: Mutex::new(None),
        };

        tracing::debug!(
            instance_id = %inner.instance_id,
            policy = inner.staleness.name(),
            "Process bridge created"
        );

        Ok(ProcessBridge {
            inner: Arc::new(inner),
        })
    }
}

impl ProcessBridge {
    /// Bridge that launches `config.launch` as an OS process
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: BridgeConfig) -> ProcessBridgeBuilder {
        ProcessBridgeBuilder {
            config,
            launcher: Arc::new(CommandLauncher),
            staleness: Arc::new(IdentityMatch),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn name(&self) -> String {
        self.inner.config.read().name.clone()
    }

    pub fn config(&self) -> BridgeConfig {
        self.inner.config.read().clone()
    }

    /// Start the tool server unless a live, current one is already running.
    pub async fn ensure_started(&self) -> Result<()> {
        self.acquire().await.map(|_| ())
    }

    async fn acquire(&self) -> Result<Arc<ChildProcess>> {
        let startup = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let retired = match &*lifecycle {
                Lifecycle::Terminated => return Err(Error::Terminated),
                Lifecycle::Starting { startup, .. } => Err(startup.clone()),
                Lifecycle::Ready(child) => match self.inner.retire_reason(child) {
                    None => return Ok(Arc::clone(child)),
                    Some(reason) => Ok(Some((Arc::clone(child), reason))),
                },
                Lifecycle::NotStarted | Lifecycle::Degraded => Ok(None),
            };
            match retired {
                Ok(retired) => self.inner.begin_startup(&mut lifecycle, retired),
                Err(in_flight) => in_flight,
            }
        };

        startup.await
    }

    /// Send `method` and wait for the response, using the configured timeout.
    pub async fn call(&self, method: &str, params: Option<JsonValue>) -> Result<JsonValue> {
        let timeout = self.inner.config.read().request_timeout();
        self.dispatch(method, params, timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue> {
        self.dispatch(method, params, Some(timeout)).await
    }

    /// Typed variant of [`call`](Self::call)
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue> {
        validate_name("method", method)?;
        let child = self.acquire().await?;
        child.request(method, params, timeout).await
    }

    /// Send a notification to the tool server
    pub async fn notify(&self, method: &str, params: Option<JsonValue>) -> Result<()> {
        validate_name("method", method)?;
        let child = self.acquire().await?;
        child.notify(method, params).await
    }

    /// Notifications emitted by the tool server from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(*self.inner.lifecycle.lock(), Lifecycle::Terminated)
    }

    pub fn status(&self) -> BridgeStatus {
        let (phase, child, last_error) = {
            let lifecycle = self.inner.lifecycle.lock();
            let last_error = self.inner.last_error.lock().clone();
            match &*lifecycle {
                Lifecycle::NotStarted => (Phase::NotStarted, None, last_error),
                Lifecycle::Starting { .. } => (Phase::Starting, None, last_error),
                Lifecycle::Ready(child) if child.is_alive() => {
                    (Phase::Ready, Some(Arc::clone(child)), last_error)
                }
                Lifecycle::Ready(child) => (
                    Phase::Degraded,
                    Some(Arc::clone(child)),
                    child.exit_reason().or(last_error),
                ),
                Lifecycle::Degraded => (Phase::Degraded, None, last_error),
                Lifecycle::Terminated => (Phase::Terminated, None, last_error),
            }
        };

        let config = self.inner.config.read();
        BridgeStatus {
            instance_id: self.inner.instance_id,
            name: config.name.clone(),
            phase,
            expected_identity: config.identity.clone(),
            process: child.as_ref().map(|c| c.info().clone()),
            server_info: child
                .as_ref()
                .and_then(|c| c.server_info())
                .and_then(|s| s.server_info.clone()),
            pending_calls: self.inner.pending.len(),
            last_error,
        }
    }

    /// Kill the running tool server, reject its outstanding calls, and start a fresh one.
    pub async fn restart(&self) -> Result<()> {
        let retired = self.take_running()?;
        if let Some(child) = retired {
            let grace = self.inner.config.read().shutdown_grace();
            self.inner
                .retire(child, Error::Restarted("restart requested".to_string()), grace)
                .await;
        }
        self.ensure_started().await
    }

    /// Swap the configuration. A running tool server the staleness policy
    /// considers out of date is stopped; the next call starts a new one.
    pub async fn reconfigure(&self, config: BridgeConfig) -> Result<()> {
        config.validate()?;

        let (retired, grace) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Terminated) {
                return Err(Error::Terminated);
            }
            let grace = config.shutdown_grace();
            *self.inner.config.write() = config;

            let reason = match &*lifecycle {
                Lifecycle::Ready(child) => self.inner.retire_reason(child),
                _ => None,
            };
            let retired = match reason {
                Some(reason) => match std::mem::replace(&mut *lifecycle, Lifecycle::NotStarted) {
                    Lifecycle::Ready(child) => Some((child, reason)),
                    other => {
                        *lifecycle = other;
                        None
                    }
                },
                None => None,
            };
            (retired, grace)
        };

        if let Some((child, reason)) = retired {
            self.inner.retire(child, reason, grace).await;
        }
        Ok(())
    }

    /// Detach the running child so a restart can replace it
    fn take_running(&self) -> Result<Option<Arc<ChildProcess>>> {
        let mut lifecycle = self.inner.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::NotStarted) {
            Lifecycle::Terminated => {
                *lifecycle = Lifecycle::Terminated;
                Err(Error::Terminated)
            }
            Lifecycle::Ready(child) => Ok(Some(child)),
            // An in-flight startup notices it was superseded and stops its own child
            Lifecycle::Starting { .. } | Lifecycle::NotStarted | Lifecycle::Degraded => Ok(None),
        }
    }

    /// Stop the tool server for good. Every outstanding call is rejected.
    pub async fn shutdown(&self) {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.lock();
            std::mem::replace(&mut *lifecycle, Lifecycle::Terminated)
        };
        if matches!(previous, Lifecycle::Terminated) {
            return;
        }

        let failed = self.inner.pending.fail_all(|| Error::Terminated);
        tracing::info!(
            instance_id = %self.inner.instance_id,
            failed,
            "Shutting down process bridge"
        );

        if let Lifecycle::Ready(child) = previous {
            let grace = self.inner.config.read().shutdown_grace();
            child.shutdown(grace).await;
        }
    }
}

impl BridgeInner {
    /// Why `child` can no longer serve calls, if it can't
    fn retire_reason(&self, child: &ChildProcess) -> Option<Error> {
        if !child.is_alive() {
            let reason = child
                .exit_reason()
                .unwrap_or_else(|| "process is not running".to_string());
            tracing::info!(generation = child.generation(), %reason, "Tool server is gone, respawning");
            return Some(Error::ProcessExited(reason));
        }

        let config = self.config.read();
        if self.staleness.is_stale(child.info(), &config) {
            tracing::info!(
                generation = child.generation(),
                running = %child.info().identity,
                expected = %config.identity,
                policy = self.staleness.name(),
                "Tool server is stale, restarting"
            );
            return Some(Error::Restarted(format!(
                "tool server {:?} replaced by {:?}",
                child.info().identity,
                config.identity
            )));
        }
        None
    }

    fn begin_startup(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        retired: Option<(Arc<ChildProcess>, Error)>,
    ) -> Startup {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Runs as its own task so a caller giving up never abandons the launch
        let task = tokio::spawn(Arc::clone(self).start(generation, retired));
        let startup = async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Other(format!("startup task failed: {}", e))))
        }
        .boxed()
        .shared();

        *lifecycle = Lifecycle::Starting {
            generation,
            startup: startup.clone(),
        };
        startup
    }

    async fn start(
        self: Arc<Self>,
        generation: u64,
        retired: Option<(Arc<ChildProcess>, Error)>,
    ) -> Result<Arc<ChildProcess>> {
        let config = self.config.read().clone();
        if let Some((child, reason)) = retired {
            self.retire(child, reason, config.shutdown_grace()).await;
        }

        let launched = self.launch(generation, &config).await;

        let superseded = {
            let mut lifecycle = self.lifecycle.lock();
            let current = matches!(
                &*lifecycle,
                Lifecycle::Starting { generation: g, .. } if *g == generation
            );
            if current {
                let mut last_error = self.last_error.lock();
                match &launched {
                    Ok(child) => {
                        *lifecycle = Lifecycle::Ready(Arc::clone(child));
                        *last_error = None;
                    }
                    Err(e) => {
                        *lifecycle = Lifecycle::Degraded;
                        *last_error = Some(e.to_string());
                    }
                }
                None
            } else if matches!(*lifecycle, Lifecycle::Terminated) {
                Some(Error::Terminated)
            } else {
                Some(Error::Restarted("startup superseded by a restart".to_string()))
            }
        };

        match (launched, superseded) {
            (Ok(child), Some(reason)) => {
                self.retire(child, reason.clone(), config.shutdown_grace()).await;
                Err(reason)
            }
            (launched, _) => launched,
        }
    }

    async fn launch(&self, generation: u64, config: &BridgeConfig) -> Result<Arc<ChildProcess>> {
        tracing::info!(
            bridge = %config.name,
            generation,
            identity = %config.identity,
            "Starting tool server"
        );

        let spawned = self.launcher.launch(config).map_err(|e| {
            tracing::error!(generation, error = %e, "Failed to launch tool server");
            e
        })?;

        let child = ChildProcess::attach(
            spawned,
            generation,
            config,
            Arc::clone(&self.pending),
            self.notifications.clone(),
        );

        if let Err(e) = child.initialize(config).await {
            tracing::error!(generation, error = %e, "Tool server handshake failed");
            child.kill();
            return Err(e);
        }

        Ok(child)
    }

    /// Reject `child`'s outstanding calls with `reason`, then stop it.
    async fn retire(&self, child: Arc<ChildProcess>, reason: Error, grace: Duration) {
        let generation = child.generation();
        let failed = self.pending.fail_generation(generation, || reason.clone());
        tracing::info!(generation, failed, reason = %reason, "Retiring tool server");
        child.shutdown(grace).await;
    }
}
