//! Stdout reader and stderr sink tasks
//!
//! Exactly one reader task consumes a child's stdout. It routes responses to
//! the pending-call table, broadcasts notifications, and refuses requests the
//! child initiates. When the stream ends, every call still waiting on that
//! process generation is rejected.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec::EnvelopeCodec;
use super::SharedWriter;
use crate::bridge::pending::{Delivery, PendingCalls};
use crate::bridge::process::Liveness;
use crate::protocol::{
    methods, Incoming, Notification, Outgoing, Response, ServerRequest, METHOD_NOT_FOUND,
};
use crate::Error;

/// How long a closed stdout waits for the exit monitor to report a status
const EXIT_STATUS_GRACE: Duration = Duration::from_millis(100);

/// Everything a reader needs to route one process generation's output
pub(crate) struct ReaderContext {
    pub generation: u64,
    pub pending: Arc<PendingCalls>,
    pub notifications: broadcast::Sender<Notification>,
    pub writer: SharedWriter,
    pub liveness: Arc<Liveness>,
    pub max_line_bytes: usize,
}

pub(crate) async fn run_reader<R>(stdout: R, ctx: ReaderContext, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let generation = ctx.generation;
    let mut framed = FramedRead::new(stdout, EnvelopeCodec::with_max_line_bytes(ctx.max_line_bytes));

    let (reason, stream_ended) = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(generation, "Stdout reader received shutdown signal");
                break ("reader stopped".to_string(), false);
            }
            item = framed.next() => {
                match item {
                    Some(Ok(message)) => dispatch(&ctx, message),
                    Some(Err(e)) => {
                        tracing::error!(generation, error = %e, "Error reading from tool server stdout");
                        break (format!("stdout read error: {}", e), true);
                    }
                    None => {
                        tracing::info!(generation, "Tool server stdout closed (EOF)");
                        break ("stdout closed".to_string(), true);
                    }
                }
            }
        }
    };

    if stream_ended {
        // The exit status usually lands just after stdout closes
        tokio::select! {
            () = cancel.cancelled() => {}
            () = ctx.liveness.exited() => {}
            () = tokio::time::sleep(EXIT_STATUS_GRACE) => {}
        }
    }

    ctx.liveness.mark_exited(None);
    let reason = ctx.liveness.exit_reason().unwrap_or(reason);
    let failed = ctx
        .pending
        .fail_generation(generation, || Error::ProcessExited(reason.clone()));
    if failed > 0 {
        tracing::warn!(generation, failed, %reason, "Rejected calls outstanding on exited tool server");
    }
}

fn dispatch(ctx: &ReaderContext, message: Incoming) {
    match message {
        Incoming::Response(Response {
            id: Some(id),
            outcome,
        }) => {
            let reply = outcome.map_err(|e| Error::Remote {
                code: e.code,
                message: e.message,
                data: e.data,
            });
            match ctx.pending.complete(ctx.generation, id, reply) {
                Delivery::Delivered => {}
                Delivery::Unknown => {
                    tracing::debug!(id, "Dropping response with no pending call");
                }
                Delivery::ForeignGeneration => {
                    tracing::warn!(
                        id,
                        generation = ctx.generation,
                        "Dropping response for a call sent to another process"
                    );
                }
            }
        }
        Incoming::Response(Response { id: None, outcome }) => {
            tracing::warn!(
                error = ?outcome.err(),
                "Tool server reported an error without a request id"
            );
        }
        Incoming::Notification(notification) => {
            if notification.method == methods::LOG_MESSAGE {
                log_child_message(&notification);
            } else {
                tracing::debug!(method = %notification.method, "Notification from tool server");
            }
            // No subscribers is fine
            let _ = ctx.notifications.send(notification);
        }
        Incoming::Request(request) => refuse_request(ctx, request),
    }
}

/// Answer a child-initiated request with an error so the child never waits on us.
fn refuse_request(ctx: &ReaderContext, request: ServerRequest) {
    tracing::debug!(method = %request.method, "Refusing request initiated by tool server");
    let reply = Outgoing::error_reply(
        request.id,
        METHOD_NOT_FOUND,
        format!("method not supported by client: {}", request.method),
    );

    // Written off the reader task so a full stdin pipe can never stall stdout
    let writer = Arc::clone(&ctx.writer);
    tokio::spawn(async move {
        let mut writer = writer.lock().await;
        if let Err(e) = writer.send(reply).await {
            tracing::warn!(error = %e, "Failed to refuse tool server request");
        }
    });
}

fn log_child_message(notification: &Notification) {
    let params = notification.params.as_ref();
    let level = params
        .and_then(|p| p.get("level"))
        .and_then(|l| l.as_str())
        .unwrap_or("info");
    let logger = params
        .and_then(|p| p.get("logger"))
        .and_then(|l| l.as_str())
        .unwrap_or("");
    let data = params
        .and_then(|p| p.get("data"))
        .map(|d| match d.as_str() {
            Some(s) => s.to_string(),
            None => d.to_string(),
        })
        .unwrap_or_default();

    match level {
        "debug" => tracing::debug!(target: "tool_bridge::child", logger, "{}", data),
        "warning" => tracing::warn!(target: "tool_bridge::child", logger, "{}", data),
        "error" | "critical" | "alert" | "emergency" => {
            tracing::error!(target: "tool_bridge::child", logger, "{}", data)
        }
        _ => tracing::info!(target: "tool_bridge::child", logger, "{}", data),
    }
}

/// Forward the child's stderr to tracing. Never parsed as protocol.
pub(crate) async fn run_stderr_sink<R>(stderr: R, generation: u64, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(target: "tool_bridge::child", generation, "{}", line);
                }
            }
            Err(e) => {
                tracing::debug!(generation, error = %e, "Tool server stderr closed with error");
                break;
            }
        }
    }
}
