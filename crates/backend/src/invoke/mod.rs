//! Invocation dispatcher.
//!
//! Routing reads `runtime_api_version` from the function's build data:
//! only the number 2 selects the worker protocol, anything else (missing,
//! non-numeric, other numbers) runs the direct protocol.
//!
//! Both protocols talk to a child process through one JSON envelope line on
//! stdout: `{"type":"result","message":...}` or `{"type":"error","message":...,"name":...}`.
//! Other stdout lines are function output and go to the log.

pub mod direct;
pub mod worker;

#[cfg(test)]
mod __tests__;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use self::worker::{StreamBody, WorkerMessage, WorkerSpawner};
use crate::{
  domain::function::{BuildData, FunctionDescriptor},
  runtime::Runtimes,
};

/// Storage-context variable only production v2 functions receive
pub const BLOBS_CONTEXT_VAR: &str = "NETLIFY_BLOBS_CONTEXT";

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// Direct execution, buffered response
  V1,
  /// Isolated worker with optional streamed body
  V2,
}

impl Protocol {
  pub fn for_build(data: Option<&BuildData>) -> Self {
    let version = data
      .and_then(|data| data.runtime_api_version.as_ref())
      .and_then(Value::as_f64);
    if version == Some(2.0) { Protocol::V2 } else { Protocol::V1 }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Protocol::V1 => "v1",
      Protocol::V2 => "v2",
    }
  }
}

// ============================================================================
// Request / Result
// ============================================================================

/// Event and context of one call, as translated by the proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvocationRequest {
  pub event: Value,
  /// Client context made available to the handler
  pub context: Value,
  /// Variables layered over the inherited environment
  pub environment: BTreeMap<String, String>,
  /// Overrides the function's configured timeout
  pub timeout_seconds: Option<u64>,
}

impl InvocationRequest {
  pub fn new(event: Value) -> Self {
    Self {
      event,
      ..Default::default()
    }
  }
}

/// Buffered response of a direct invocation
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LambdaResponse {
  pub status_code: Option<u16>,
  pub headers: Option<serde_json::Map<String, Value>>,
  pub multi_value_headers: Option<BTreeMap<String, Vec<String>>>,
  pub body: Option<String>,
  pub is_base64_encoded: bool,
}

#[derive(Debug)]
pub enum InvocationResult {
  Direct(LambdaResponse),
  /// Worker message, with the live body when the worker streamed it
  Worker {
    message: WorkerMessage,
    body: Option<StreamBody>,
  },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
  #[error("Function not found: {0}")]
  NotFound(String),

  #[error("Cannot invoke a function that has not been built")]
  NotBuilt(String),

  #[error("Task timed out after {secs} seconds")]
  Timeout { secs: u64 },

  /// Error raised by the handler itself
  #[error("{name}: {message}")]
  Runtime { name: String, message: String },

  #[error("Function process failed: {0}")]
  Process(String),

  #[error("Worker failed: {0}")]
  Worker(String),

  #[error("Failed to connect to response stream on port {port}: {message}")]
  StreamBridge { port: u16, message: String },

  #[error("Failed to launch {program}: {message}")]
  Spawn { program: String, message: String },

  #[error("Cannot launch function: {0}")]
  Launcher(String),
}

impl InvokeError {
  /// HTTP status a proxy should answer with
  pub fn status_code(&self) -> u16 {
    match self {
      InvokeError::NotFound(_) => 404,
      InvokeError::Timeout { .. } => 504,
      InvokeError::StreamBridge { .. } => 502,
      _ => 500,
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, InvokeError::Timeout { .. })
  }
}

// ============================================================================
// Envelope
// ============================================================================

/// Message a function process prints as one stdout line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum Envelope {
  Result {
    #[serde(default)]
    message: Value,
  },
  Error {
    message: String,
    #[serde(default)]
    name: Option<String>,
  },
}

impl Envelope {
  /// Parse a stdout line, `None` when it is ordinary output
  pub(crate) fn parse_line(line: &str) -> Option<Self> {
    let line = line.trim();
    if !line.starts_with('{') {
      return None;
    }
    serde_json::from_str(line).ok()
  }

  pub(crate) fn into_message(self) -> Result<Value, InvokeError> {
    match self {
      Envelope::Result { message } => Ok(message),
      Envelope::Error { message, name } => Err(InvokeError::Runtime {
        name: name.unwrap_or_else(|| "Error".to_string()),
        message,
      }),
    }
  }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes calls to the direct or worker protocol
#[derive(Clone)]
pub struct Dispatcher {
  runtimes: Runtimes,
  spawner: Arc<dyn WorkerSpawner>,
}

impl Dispatcher {
  pub fn new(runtimes: Runtimes, spawner: Arc<dyn WorkerSpawner>) -> Self {
    Self { runtimes, spawner }
  }

  pub async fn invoke(
    &self,
    function: &FunctionDescriptor,
    request: InvocationRequest,
  ) -> Result<InvocationResult, InvokeError> {
    let Some(data) = function.build_data() else {
      return Err(InvokeError::NotBuilt(function.name.clone()));
    };

    let protocol = Protocol::for_build(Some(&*data));
    let runtime = self
      .runtimes
      .get(function.runtime)
      .ok_or_else(|| InvokeError::Launcher(format!("no {} runtime registered", function.runtime)))?;

    let entry: PathBuf = data.build_path.clone().unwrap_or_else(|| function.main_file.clone());
    let timeout_secs = request.timeout_seconds.unwrap_or_else(|| function.timeout_secs());
    let launcher = runtime.launcher(function, &entry, protocol)?;
    let request_id = Uuid::new_v4().to_string();

    debug!(
      function = %function.name,
      request_id = %request_id,
      protocol = protocol.as_str(),
      entry = %entry.display(),
      timeout_secs,
      "Invoking function"
    );

    let result = match protocol {
      Protocol::V1 => direct::invoke(&launcher, function, &entry, &request, &request_id, timeout_secs)
        .await
        .map(InvocationResult::Direct),
      Protocol::V2 => worker::invoke(self.spawner.as_ref(), &launcher, &entry, request, timeout_secs)
        .await
        .map(|(message, body)| InvocationResult::Worker { message, body }),
    };

    if let Err(e) = &result {
      info!(function = %function.name, request_id = %request_id, error = %e, "Invocation failed");
    }
    result
  }
}
