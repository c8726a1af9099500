//! Tool server process management
//!
//! Launches the child, wires its stdio to the reader and stderr tasks, and
//! watches for it to exit. A [`ChildProcess`] represents one launch; it is
//! never reused after the process dies.

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::SinkExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::pending::PendingCalls;
use crate::config::{BridgeConfig, LaunchConfig};
use crate::protocol::{
    methods, CancelledParams, InitializeParams, InitializeResult, Notification, Outgoing,
};
use crate::transport::reader::{run_reader, run_stderr_sink, ReaderContext};
use crate::transport::{shared_writer, BoxedReader, BoxedWriter, SharedWriter};
use crate::utils::validate_and_canonicalize_path;
use crate::{Error, Result};

/// How long the reader may keep draining stdout after the process exits
const STDOUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How long a `notifications/cancelled` write may wait on stdin
const CANCEL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Variables passed through when `inherit_env` is off
const INHERITED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "RUST_LOG",
    "TMPDIR",
    "TMP",
    "TEMP",
    "SYSTEMROOT",
    "USERPROFILE",
    "APPDATA",
    "LOCALAPPDATA",
];

/// Shared "is the process still usable" flag
pub(crate) struct Liveness {
    alive: watch::Sender<bool>,
    exit_reason: Mutex<Option<String>>,
}

impl Liveness {
    pub fn new() -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            alive,
            exit_reason: Mutex::new(None),
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Flip to dead. The first reason recorded wins.
    pub fn mark_exited(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            let mut slot = self.exit_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.alive.send_replace(false);
    }

    pub fn exit_reason(&self) -> Option<String> {
        self.exit_reason.lock().clone()
    }

    /// Resolves once the process is marked dead.
    pub async fn exited(&self) {
        let mut rx = self.alive.subscribe();
        // The sender lives in `self`, so this only returns once the flag flips
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

/// Stdio handles of a freshly launched child
pub struct SpawnedChild {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    /// The OS process, when there is one
    pub child: Option<Child>,
}

impl SpawnedChild {
    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdout".to_string()))?;

        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
        })
    }
}

/// Starts tool server processes
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, config: &BridgeConfig) -> Result<SpawnedChild>;
}

/// Launches the configured program as an OS process
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, config: &BridgeConfig) -> Result<SpawnedChild> {
        let launch = &config.launch;
        let program = launch.resolve_program()?;

        tracing::info!("Spawning tool server from: {:?}", program);

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &launch.cwd {
            command.current_dir(validate_and_canonicalize_path(cwd)?);
        }

        if !launch.inherit_env {
            command.env_clear();
            for key in INHERITED_ENV {
                if let Some(value) = std::env::var_os(key) {
                    command.env(key, value);
                }
            }
        }
        command.envs(&launch.env);
        command.env(&config.identity_env, &config.identity);

        let child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{:?}: {}", program, e)))?;

        SpawnedChild::from_child(child)
    }
}

/// What was launched, and when
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Monotonic launch counter of the owning bridge
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Identity token the process was started with
    pub identity: String,
    pub launch: LaunchConfig,
    pub spawned_at: DateTime<Utc>,
}

/// One running tool server
pub(crate) struct ChildProcess {
    info: ProcessInfo,
    server_info: OnceLock<InitializeResult>,
    writer: SharedWriter,
    pending: Arc<PendingCalls>,
    liveness: Arc<Liveness>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
}

impl ChildProcess {
    /// Take ownership of a launched child and start its background tasks.
    pub fn attach(
        spawned: SpawnedChild,
        generation: u64,
        config: &BridgeConfig,
        pending: Arc<PendingCalls>,
        notifications: broadcast::Sender<Notification>,
    ) -> Arc<Self> {
        let SpawnedChild {
            stdin,
            stdout,
            stderr,
            child,
        } = spawned;

        let info = ProcessInfo {
            generation,
            pid: child.as_ref().and_then(|c| c.id()),
            identity: config.identity.clone(),
            launch: config.launch.clone(),
            spawned_at: Utc::now(),
        };

        let writer = shared_writer(stdin);
        let liveness = Arc::new(Liveness::new());
        let cancel = CancellationToken::new();

        let ctx = ReaderContext {
            generation,
            pending: Arc::clone(&pending),
            notifications,
            writer: Arc::clone(&writer),
            liveness: Arc::clone(&liveness),
            max_line_bytes: config.max_line_bytes,
        };
        tokio::spawn(run_reader(stdout, ctx, cancel.child_token()));

        if let Some(stderr) = stderr {
            tokio::spawn(run_stderr_sink(stderr, generation, cancel.child_token()));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor_exit(
            child,
            generation,
            kill_rx,
            Arc::clone(&liveness),
            cancel.clone(),
        ));

        tracing::info!(generation, pid = ?info.pid, "Tool server attached");

        Arc::new(Self {
            info,
            server_info: OnceLock::new(),
            writer,
            pending,
            liveness,
            kill_tx: Mutex::new(Some(kill_tx)),
            cancel,
        })
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn generation(&self) -> u64 {
        self.info.generation
    }

    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    pub fn exit_reason(&self) -> Option<String> {
        self.liveness.exit_reason()
    }

    fn exited_error(&self) -> Error {
        Error::ProcessExited(
            self.exit_reason()
                .unwrap_or_else(|| "process is not running".to_string()),
        )
    }

    /// Run the `initialize` handshake, then send `notifications/initialized`.
    pub async fn initialize(&self, config: &BridgeConfig) -> Result<()> {
        let params = InitializeParams {
            protocol_version: config.protocol_version.clone(),
            capabilities: serde_json::json!({}),
            client_info: config.client_info(),
        };
        let params = serde_json::to_value(params)?;
        let limit = Some(config.handshake_timeout()).filter(|d| !d.is_zero());

        let response = self
            .request(methods::INITIALIZE, Some(params), limit)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        // Servers vary in what they put here; none of it is required
        let result: InitializeResult = serde_json::from_value(response).unwrap_or_default();
        if let Some(version) = &result.protocol_version {
            if version != &config.protocol_version {
                tracing::warn!(
                    offered = %config.protocol_version,
                    accepted = %version,
                    "Tool server negotiated a different protocol version"
                );
            }
        }

        self.notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        tracing::info!(
            generation = self.info.generation,
            server = ?result.server_info,
            "Tool server initialized"
        );
        let _ = self.server_info.set(result);
        Ok(())
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<JsonValue> {
        let call = self.pending.register(self.info.generation, method);
        let id = call.id;

        // Checked after registering: a reader that exits from here on fails the entry
        if !self.is_alive() {
            return Err(self.exited_error());
        }

        let request = Outgoing::request(id, method, params);
        let Some(limit) = timeout else {
            self.send(request).await?;
            return call.wait().await;
        };

        // One deadline covers both writing the request and waiting for the reply
        let deadline = Instant::now() + limit;

        match tokio::time::timeout_at(deadline, self.send(request)).await {
            Ok(sent) => sent?,
            Err(_) => {
                tracing::warn!(id, method, ?limit, "Tool server stopped reading stdin, killing it");
                self.liveness
                    .mark_exited(Some("stdin write timed out".to_string()));
                self.kill();
                return Err(Error::Timeout(limit));
            }
        }

        match tokio::time::timeout_at(deadline, call.wait()).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(id, method, ?limit, "Tool server request timed out");
                self.cancel_remote(id, "timeout");
                Err(Error::Timeout(limit))
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<JsonValue>) -> Result<()> {
        if !self.is_alive() {
            return Err(self.exited_error());
        }
        self.send(Outgoing::notification(method, params)).await
    }

    /// Best-effort `notifications/cancelled` for an abandoned request.
    ///
    /// Written from its own task so the caller's deadline is not extended.
    fn cancel_remote(&self, id: u64, reason: &str) {
        if !self.is_alive() {
            return;
        }
        let params = serde_json::to_value(CancelledParams {
            request_id: id,
            reason,
        })
        .ok();
        let message = Outgoing::notification(methods::CANCELLED, params);
        let writer = Arc::clone(&self.writer);

        tokio::spawn(async move {
            let sent = tokio::time::timeout(CANCEL_WRITE_TIMEOUT, async {
                let mut writer = writer.lock().await;
                writer.send(message).await
            })
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(id, error = %e, "Could not send cancellation to tool server");
                }
                Err(_) => {
                    tracing::debug!(id, "Gave up sending cancellation to tool server");
                }
            }
        });
    }

    async fn send(&self, message: Outgoing) -> Result<()> {
        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(message).await
        };

        if let Err(e) = result {
            tracing::error!(
                generation = self.info.generation,
                error = %e,
                "Failed to write to tool server stdin"
            );
            self.liveness
                .mark_exited(Some(format!("stdin write failed: {}", e)));
            self.kill();
            return Err(Error::Transport(format!("Failed to write to stdin: {}", e)));
        }
        Ok(())
    }

    /// Ask the exit monitor to kill the process. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    ///
    /// `grace` also bounds flushing stdin, so a child that stopped reading is
    /// still killed on time.
    pub async fn shutdown(&self, grace: Duration) {
        let generation = self.info.generation;
        let deadline = Instant::now() + grace;

        let closed = tokio::time::timeout_at(deadline, async {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.close().await {
                tracing::debug!(generation, error = %e, "Error closing tool server stdin");
            }
            // Child pipes only close when the handle is dropped
            drop(std::mem::replace(
                writer.get_mut(),
                Box::new(tokio::io::sink()) as BoxedWriter,
            ));
        })
        .await;

        if closed.is_err() {
            tracing::warn!(generation, "Tool server stdin is not draining, killing...");
        } else if tokio::time::timeout_at(deadline, self.liveness.exited())
            .await
            .is_err()
        {
            tracing::warn!(generation, "Tool server did not exit gracefully, killing...");
        }

        self.kill();
        self.liveness.mark_exited(Some("shut down".to_string()));
        self.cancel.cancel();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Stops the reader even if the child holds stdout open
        self.cancel.cancel();
    }
}

/// Wait for the process to exit (or for a kill request) and record why.
async fn monitor_exit(
    child: Option<Child>,
    generation: u64,
    kill_rx: oneshot::Receiver<()>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
) {
    let reason = match child {
        Some(mut child) => {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) => format!("exited with code {}", code),
                        None => format!("terminated ({})", status),
                    },
                    Err(e) => format!("wait failed: {}", e),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(generation, error = %e, "Failed to kill tool server");
                    }
                    "killed".to_string()
                }
            }
        }
        // No OS process: only a kill request or the reader ending stops it
        None => {
            tokio::select! {
                biased;

                _ = kill_rx => "killed".to_string(),
                () = liveness.exited() => return,
            }
        }
    };

    tracing::info!(generation, %reason, "Tool server exited");
    liveness.mark_exited(Some(reason));

    // Output written just before exit may still be in the pipe
    tokio::time::sleep(STDOUT_DRAIN_GRACE).await;
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, FakeChild};
    use serde_json::json;

    fn attach_fake() -> (Arc<ChildProcess>, FakeChild, Arc<PendingCalls>) {
        let (spawned, fake) = FakeChild::pair();
        let pending = Arc::new(PendingCalls::new());
        let (notifications, _) = broadcast::channel(16);
        let child = ChildProcess::attach(
            spawned,
            1,
            &test_config(),
            Arc::clone(&pending),
            notifications,
        );
        (child, fake, pending)
    }

    #[test]
    fn test_liveness_keeps_first_reason() {
        let liveness = Liveness::new();
        assert!(liveness.is_alive());

        liveness.mark_exited(Some("exited with code 1".to_string()));
        liveness.mark_exited(Some("stdout closed".to_string()));

        assert!(!liveness.is_alive());
        assert_eq!(liveness.exit_reason().as_deref(), Some("exited with code 1"));
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_then_initialized() {
        let (child, mut fake, _) = attach_fake();
        let config = test_config();

        let handshake = tokio::spawn({
            let child = Arc::clone(&child);
            async move { child.initialize(&config).await }
        });

        let init = fake.recv().await;
        assert_eq!(init["method"], json!("initialize"));
        assert_eq!(init["jsonrpc"], json!("2.0"));
        assert_eq!(init["params"]["protocolVersion"], json!("2024-11-05"));
        fake.respond(
            &init,
            json!({"protocolVersion": "2024-11-05", "serverInfo": {"name": "fake", "version": "1"}}),
        )
        .await;

        let initialized = fake.recv().await;
        assert_eq!(initialized["method"], json!("notifications/initialized"));
        assert!(initialized.get("id").is_none());

        handshake.await.unwrap().unwrap();
        let server = child.server_info().and_then(|s| s.server_info.clone());
        assert_eq!(server.map(|s| s.name).as_deref(), Some("fake"));
    }

    #[tokio::test]
    async fn test_handshake_failure_maps_to_handshake_error() {
        let (child, mut fake, _) = attach_fake();
        let config = test_config();

        let handshake = tokio::spawn({
            let child = Arc::clone(&child);
            async move { child.initialize(&config).await }
        });

        let init = fake.recv().await;
        fake.fail(&init, "unsupported protocol").await;

        let err = handshake.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Handshake(ref msg) if msg.contains("unsupported protocol")));
    }

    #[tokio::test]
    async fn test_timeout_sends_cancelled_notification() {
        let (child, mut fake, pending) = attach_fake();

        let call = tokio::spawn({
            let child = Arc::clone(&child);
            async move {
                child
                    .request("tools/call", None, Some(Duration::from_millis(50)))
                    .await
            }
        });

        let request = fake.recv().await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(pending.len(), 0);

        let cancelled = fake.recv().await;
        assert_eq!(cancelled["method"], json!("notifications/cancelled"));
        assert_eq!(cancelled["params"]["requestId"], request["id"]);

        // A late answer is dropped without disturbing the process
        fake.respond(&request, json!("late")).await;
        tokio::task::yield_now().await;
        assert!(child.is_alive());
    }

    #[tokio::test]
    async fn test_kill_rejects_outstanding_calls() {
        let (child, mut fake, pending) = attach_fake();

        let call = tokio::spawn({
            let child = Arc::clone(&child);
            async move { child.request("tools/call", None, None).await }
        });
        fake.recv().await;

        child.kill();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProcessExited(ref reason) if reason == "killed"));
        assert!(!child.is_alive());
        assert_eq!(pending.len(), 0);

        let err = child.request("tools/list", None, None).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited(_)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_stdin() {
        let (child, mut fake, _) = attach_fake();

        let shutdown = tokio::spawn({
            let child = Arc::clone(&child);
            async move { child.shutdown(Duration::from_millis(200)).await }
        });

        assert!(fake.recv_eof().await);
        fake.close();
        shutdown.await.unwrap();
        assert!(!child.is_alive());
    }

    #[cfg(unix)]
    mod os_process {
        use super::*;
        use crate::bridge::{Phase, ProcessBridge};

        /// Minimal `sh` tool server: answers `initialize`, runs `on_request`
        /// for every other request with `$id` set.
        fn serve(before: &str, on_request: &str) -> String {
            format!(
                r#"{before}
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -n "$id" ] || continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","serverInfo":{{"name":"sh-tools","version":"1"}}}}}}\n' "$id" ;;
    *)
      {on_request} ;;
  esac
done
"#
            )
        }

        fn sh_bridge(script: String, inherit_env: bool) -> ProcessBridge {
            let mut config = test_config();
            config.identity = "build-7".to_string();
            config.launch = LaunchConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script],
                inherit_env,
                env: [("BRIDGE_TEST_EXTRA".to_string(), "extra".to_string())]
                    .into_iter()
                    .collect(),
                ..LaunchConfig::default()
            };
            ProcessBridge::new(config).unwrap()
        }

        const ECHO_ENV: &str = r#"printf '{"jsonrpc":"2.0","id":%s,"result":"%s:%s:%s"}\n' "$id" "$TOOL_BRIDGE_IDENTITY" "${BRIDGE_TEST_SECRET:-unset}" "${BRIDGE_TEST_EXTRA:-unset}""#;

        #[tokio::test]
        async fn test_child_sees_identity_and_configured_env() {
            let bridge = sh_bridge(serve("", ECHO_ENV), true);

            let reply = bridge.call("tools/call", None).await.unwrap();
            let reply = reply.as_str().unwrap();
            assert!(reply.starts_with("build-7:"));
            assert!(reply.ends_with(":extra"));

            let status = bridge.status();
            assert_eq!(status.phase, Phase::Ready);
            assert!(status.process.and_then(|p| p.pid).is_some());
            assert_eq!(status.server_info.map(|s| s.name).as_deref(), Some("sh-tools"));

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_env_allowlist_hides_parent_variables() {
            std::env::set_var("BRIDGE_TEST_SECRET", "hidden");
            let bridge = sh_bridge(serve("", ECHO_ENV), false);

            let reply = bridge.call("tools/call", None).await.unwrap();
            assert_eq!(reply, json!("build-7:unset:extra"));

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_exit_rejects_outstanding_call_with_status() {
            let bridge = sh_bridge(serve("", "exit 3"), true);

            let err = bridge.call("tools/call", None).await.unwrap_err();
            assert!(
                matches!(err, Error::ProcessExited(ref reason) if reason == "exited with code 3"),
                "unexpected error: {:?}",
                err
            );

            let status = bridge.status();
            assert_eq!(status.phase, Phase::Degraded);
            assert_eq!(status.last_error.as_deref(), Some("exited with code 3"));

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_stderr_noise_does_not_block_responses() {
            let chatter = r#"echo "server booting"
i=0
while [ $i -lt 2000 ]; do
  echo "diagnostic line $i padding padding padding padding padding padding" >&2
  i=$((i+1))
done"#;
            let reply = r#"echo "handling $id" >&2; printf '{"jsonrpc":"2.0","id":%s,"result":"ok"}\n' "$id""#;
            let bridge = sh_bridge(serve(chatter, reply), true);

            assert_eq!(bridge.call("tools/call", None).await.unwrap(), json!("ok"));
            assert_eq!(bridge.call("tools/list", None).await.unwrap(), json!("ok"));

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_kills_child_that_ignores_stdin_close() {
            let ignore_eof = r#"printf '{"jsonrpc":"2.0","id":%s,"result":"ok"}\n' "$id""#;
            let script = format!("{}exec sleep 30\n", serve("", ignore_eof));
            let bridge = sh_bridge(script, true);
            bridge.ensure_started().await.unwrap();

            tokio::time::timeout(Duration::from_secs(5), bridge.shutdown())
                .await
                .unwrap();
            assert!(bridge.is_terminated());
        }
    }
}
