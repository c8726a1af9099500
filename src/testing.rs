//! In-memory tool server used by the unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use crate::bridge::{Launcher, SpawnedChild};
use crate::config::{BridgeConfig, LaunchConfig};
use crate::{Error, Result};

const RECV_DEADLINE: Duration = Duration::from_secs(5);

pub(crate) fn test_config() -> BridgeConfig {
    BridgeConfig {
        name: "test-tools".to_string(),
        identity: "v1".to_string(),
        request_timeout_ms: 5_000,
        handshake_timeout_ms: 2_000,
        shutdown_grace_ms: 100,
        launch: LaunchConfig {
            program: "fake-tool-server".to_string(),
            ..LaunchConfig::default()
        },
        ..BridgeConfig::default()
    }
}

/// The child's side of a pair of in-memory pipes
pub(crate) struct FakeChild {
    stdin: BufReader<DuplexStream>,
    stdout: Option<DuplexStream>,
}

impl FakeChild {
    pub fn pair() -> (SpawnedChild, FakeChild) {
        let (bridge_stdin, child_stdin) = tokio::io::duplex(64 * 1024);
        let (child_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);

        let spawned = SpawnedChild {
            stdin: Box::new(bridge_stdin),
            stdout: Box::new(bridge_stdout),
            stderr: None,
            child: None,
        };
        let fake = FakeChild {
            stdin: BufReader::new(child_stdin),
            stdout: Some(child_stdout),
        };
        (spawned, fake)
    }

    async fn next_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(RECV_DEADLINE, self.stdin.read_line(&mut line))
            .await
            .expect("timed out waiting for the bridge to write")
            .expect("fake stdin read failed");
        (read > 0).then_some(line)
    }

    /// Next envelope the bridge wrote
    pub async fn recv(&mut self) -> JsonValue {
        let line = self.next_line().await.expect("bridge closed stdin");
        assert!(line.ends_with('\n'));
        serde_json::from_str(&line).expect("bridge wrote invalid JSON")
    }

    /// Next envelope carrying an id, skipping notifications
    pub async fn recv_request(&mut self) -> JsonValue {
        loop {
            let message = self.recv().await;
            if message.get("id").is_some() {
                return message;
            }
        }
    }

    /// True once the bridge has closed stdin, skipping anything still buffered
    pub async fn recv_eof(&mut self) -> bool {
        while self.next_line().await.is_some() {}
        true
    }

    pub async fn send_raw(&mut self, text: &str) {
        let stdout = self.stdout.as_mut().expect("fake stdout already closed");
        stdout.write_all(text.as_bytes()).await.expect("fake stdout write failed");
    }

    pub async fn respond(&mut self, request: &JsonValue, result: JsonValue) {
        let line = json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
        self.send_raw(&format!("{}\n", line)).await;
    }

    pub async fn fail(&mut self, request: &JsonValue, message: &str) {
        let line = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32000, "message": message},
        });
        self.send_raw(&format!("{}\n", line)).await;
    }

    /// Answer `initialize` and consume `notifications/initialized`.
    pub async fn handshake(&mut self) {
        let init = self.recv().await;
        assert_eq!(init["method"], json!("initialize"));
        self.respond(
            &init,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-tools", "version": "0.0.1"},
            }),
        )
        .await;

        let initialized = self.recv().await;
        assert_eq!(initialized["method"], json!("notifications/initialized"));
    }

    /// Close stdout, as a process does when it exits
    pub fn close(&mut self) {
        self.stdout = None;
    }
}

/// Launcher that hands out [`FakeChild`]s over a channel
pub(crate) struct FakeLauncher {
    spawned: AtomicUsize,
    failing: AtomicBool,
    identities: Mutex<Vec<String>>,
    children: mpsc::UnboundedSender<FakeChild>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeChild>) {
        let (children, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            spawned: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            identities: Mutex::new(Vec::new()),
            children,
        });
        (launcher, rx)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Identity token of every launch, in order
    pub fn identities(&self) -> Vec<String> {
        self.identities.lock().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, config: &BridgeConfig) -> Result<SpawnedChild> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Spawn("fake-tool-server: No such file or directory".to_string()));
        }

        self.identities.lock().push(config.identity.clone());
        let (spawned, fake) = FakeChild::pair();
        let _ = self.children.send(fake);
        Ok(spawned)
    }
}
