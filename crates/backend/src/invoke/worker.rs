//! Isolated worker channel (v2).
//!
//! Every call gets its own worker, never reused. The worker sends exactly one
//! message. When that message carries a `streamPort`, the channel connects to
//! it and the connection is handed to the caller as the live response body.
//! The worker is kept alive until the body is dropped.

use std::{
  collections::BTreeMap,
  path::Path,
  pin::Pin,
  process::Stdio,
  task::{Context, Poll},
  time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, ReadBuf},
  net::TcpStream,
  process::{Child, ChildStderr, ChildStdout},
  sync::oneshot,
  time::{Instant, timeout_at},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::{Envelope, InvocationRequest, InvokeError};
use crate::runtime::Launcher;

/// Stderr lines kept for the error of a worker that exits without a message
const STDERR_TAIL_LINES: usize = 20;

// ============================================================================
// Wire Types
// ============================================================================

/// Seed data handed to a worker on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerData {
  /// Client context, already serialized to JSON
  pub client_context: String,
  pub environment: BTreeMap<String, String>,
  pub event: Value,
  /// `file://` URL of the entry
  pub entry_file_path: String,
  pub timeout_ms: u64,
}

/// The one message a worker sends back
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
  #[serde(rename = "streamPort", default, skip_serializing_if = "Option::is_none")]
  pub stream_port: Option<u16>,
  #[serde(flatten)]
  pub fields: serde_json::Map<String, Value>,
}

impl WorkerMessage {
  pub fn status_code(&self) -> Option<u16> {
    self
      .fields
      .get("statusCode")
      .and_then(Value::as_u64)
      .and_then(|code| u16::try_from(code).ok())
  }
}

/// Live response body read from the worker's stream port
#[derive(Debug)]
pub struct StreamBody {
  stream: TcpStream,
  _worker: Option<DropGuard>,
}

impl StreamBody {
  pub fn new(stream: TcpStream, worker: Option<DropGuard>) -> Self {
    Self {
      stream,
      _worker: worker,
    }
  }
}

impl AsyncRead for StreamBody {
  fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.stream).poll_read(cx, buf)
  }
}

// ============================================================================
// Spawner
// ============================================================================

/// A started worker: its single message, and a guard that stops it when dropped
pub struct WorkerProcess {
  pub message: oneshot::Receiver<Result<WorkerMessage, InvokeError>>,
  pub guard: DropGuard,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
  async fn spawn(&self, launcher: &Launcher, data: &WorkerData) -> Result<WorkerProcess, InvokeError>;
}

/// Runs each worker as a child process fed the worker data on stdin
#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner;

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
  async fn spawn(&self, launcher: &Launcher, data: &WorkerData) -> Result<WorkerProcess, InvokeError> {
    let spawn_error = |e: &dyn std::fmt::Display| InvokeError::Spawn {
      program: launcher.program.clone(),
      message: e.to_string(),
    };

    let mut child = launcher
      .command()
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| spawn_error(&e))?;

    // Written in the background so the caller's deadline covers a worker
    // that never drains stdin
    if let Some(mut stdin) = child.stdin.take() {
      let mut payload = serde_json::to_vec(data).map_err(|e| spawn_error(&e))?;
      payload.push(b'\n');
      tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&payload).await {
          debug!(error = %e, "Worker did not read its data");
        }
      });
    }

    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| spawn_error(&"stdout not piped"))?;
    let stderr = child
      .stderr
      .take()
      .ok_or_else(|| spawn_error(&"stderr not piped"))?;

    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(supervise(child, stdout, stderr, tx, cancel.clone()));

    Ok(WorkerProcess {
      message: rx,
      guard: cancel.drop_guard(),
    })
  }
}

async fn collect_stderr(stderr: ChildStderr) -> Vec<String> {
  let mut lines = BufReader::new(stderr).lines();
  let mut tail = Vec::new();
  while let Ok(Some(line)) = lines.next_line().await {
    if line.trim().is_empty() {
      continue;
    }
    info!(stream = "stderr", "{}", line);
    tail.push(line);
    if tail.len() > STDERR_TAIL_LINES {
      tail.remove(0);
    }
  }
  tail
}

/// Forward the first envelope, log other output, and kill the worker on cancel
async fn supervise(
  mut child: Child,
  stdout: ChildStdout,
  stderr: ChildStderr,
  tx: oneshot::Sender<Result<WorkerMessage, InvokeError>>,
  cancel: CancellationToken,
) {
  let mut tx = Some(tx);
  let stderr_task = tokio::spawn(collect_stderr(stderr));
  let mut lines = BufReader::new(stdout).lines();

  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        let _ = child.kill().await;
        return;
      }

      line = lines.next_line() => {
        let Ok(Some(line)) = line else {
          break;
        };

        if tx.is_some()
          && let Some(envelope) = Envelope::parse_line(&line)
          && let Some(tx) = tx.take()
        {
          let message = envelope.into_message().and_then(|message| {
            serde_json::from_value::<WorkerMessage>(message)
              .map_err(|e| InvokeError::Worker(format!("malformed worker message: {e}")))
          });
          let _ = tx.send(message);
        } else if !line.trim().is_empty() {
          info!(stream = "stdout", "{}", line);
        }
      }
    }
  }

  let status = tokio::select! {
    biased;

    _ = cancel.cancelled() => {
      let _ = child.kill().await;
      return;
    }

    status = child.wait() => status,
  };

  let tail = stderr_task.await.unwrap_or_default();
  debug!(?status, "Worker exited");

  if let Some(tx) = tx.take() {
    let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
    let _ = tx.send(Err(InvokeError::Worker(format!(
      "worker exited ({status}) without sending a message: {}",
      tail.join("\n")
    ))));
  }
}

// ============================================================================
// Invocation
// ============================================================================

/// `file://` URL for an absolute path
pub fn file_url(path: &Path) -> String {
  let raw = path.to_string_lossy().replace('\\', "/");
  let mut url = String::from("file://");
  if !raw.starts_with('/') {
    url.push('/');
  }
  for byte in raw.bytes() {
    match byte {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => url.push(byte as char),
      _ => url.push_str(&format!("%{byte:02X}")),
    }
  }
  url
}

pub async fn invoke(
  spawner: &dyn WorkerSpawner,
  launcher: &Launcher,
  entry: &Path,
  request: InvocationRequest,
  timeout_secs: u64,
) -> Result<(WorkerMessage, Option<StreamBody>), InvokeError> {
  let timeout_ms = timeout_secs.saturating_mul(1000);
  let deadline = Instant::now() + Duration::from_millis(timeout_ms);

  let data = WorkerData {
    client_context: request.context.to_string(),
    environment: request.environment,
    event: request.event,
    entry_file_path: file_url(entry),
    timeout_ms,
  };

  let WorkerProcess { message, guard } = spawner.spawn(launcher, &data).await?;

  // On any early return the guard drops and stops the worker
  let message = match timeout_at(deadline, message).await {
    Ok(Ok(result)) => result?,
    Ok(Err(_)) => return Err(InvokeError::Worker("worker exited without sending a message".to_string())),
    Err(_) => {
      warn!(entry = %entry.display(), timeout_secs, "Worker timed out");
      return Err(InvokeError::Timeout { secs: timeout_secs });
    }
  };

  let Some(port) = message.stream_port else {
    // Direct results let the worker finish on its own
    let _ = guard.disarm();
    return Ok((message, None));
  };

  let stream = match timeout_at(deadline, TcpStream::connect(("localhost", port))).await {
    Ok(Ok(stream)) => stream,
    Ok(Err(e)) => {
      return Err(InvokeError::StreamBridge {
        port,
        message: e.to_string(),
      });
    }
    Err(_) => return Err(InvokeError::Timeout { secs: timeout_secs }),
  };

  debug!(port, "Connected to worker response stream");
  Ok((message, Some(StreamBody::new(stream, Some(guard)))))
}
