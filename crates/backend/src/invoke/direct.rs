//! Direct (v1) invocation.
//!
//! The entry runs in a fresh process per call with the event on stdin. The
//! response is the envelope on the last non-empty stdout line; everything the
//! function printed before it, and all of stderr, is forwarded to the log.

use std::{collections::BTreeMap, path::Path, process::Stdio, time::Duration};

use serde_json::Value;
use tokio::{
  io::AsyncWriteExt,
  time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};

use super::{BLOBS_CONTEXT_VAR, Envelope, InvocationRequest, InvokeError, LambdaResponse};
use crate::{domain::function::FunctionDescriptor, runtime::Launcher};

pub const CLIENT_CONTEXT_VAR: &str = "LAMBDA_CLIENT_CONTEXT";
pub const ENTRY_PATH_VAR: &str = "LAMBDA_ENTRY_PATH";
pub const MODULE_FORMAT_VAR: &str = "LAMBDA_MODULE_FORMAT";
pub const TIMEOUT_MS_VAR: &str = "LAMBDA_TIMEOUT_MS";
pub const FUNCTION_NAME_VAR: &str = "LAMBDA_FUNCTION_NAME";
pub const REQUEST_ID_VAR: &str = "LAMBDA_REQUEST_ID";

/// `esm` for `.mjs` entries, `cjs` otherwise
pub fn module_format(entry: &Path) -> &'static str {
  if entry.extension().is_some_and(|ext| ext == "mjs") {
    "esm"
  } else {
    "cjs"
  }
}

/// Parent environment with request overrides, minus the storage context
fn environment(overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
  let mut env: BTreeMap<String, String> = std::env::vars().collect();
  env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
  env.remove(BLOBS_CONTEXT_VAR);
  env
}

fn parse_response(message: Value) -> Result<LambdaResponse, InvokeError> {
  match message {
    Value::Null => Ok(LambdaResponse::default()),
    Value::Object(_) => serde_json::from_value(message)
      .map_err(|e| InvokeError::Process(format!("invalid response from function: {e}"))),
    other => Err(InvokeError::Process(format!(
      "invalid response from function: expected an object, got {other}"
    ))),
  }
}

pub async fn invoke(
  launcher: &Launcher,
  function: &FunctionDescriptor,
  entry: &Path,
  request: &InvocationRequest,
  request_id: &str,
  timeout_secs: u64,
) -> Result<LambdaResponse, InvokeError> {
  let start = Instant::now();
  let timeout_ms = timeout_secs.saturating_mul(1000);
  let deadline = start + Duration::from_millis(timeout_ms);
  let env = environment(&request.environment);

  let mut cmd = launcher.command_with_env(&env);
  cmd
    .env(CLIENT_CONTEXT_VAR, request.context.to_string())
    .env(ENTRY_PATH_VAR, entry)
    .env(MODULE_FORMAT_VAR, module_format(entry))
    .env(TIMEOUT_MS_VAR, timeout_ms.to_string())
    .env(FUNCTION_NAME_VAR, &function.name)
    .env(REQUEST_ID_VAR, request_id)
    .current_dir(function.function_directory())
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let mut child = cmd.spawn().map_err(|e| InvokeError::Spawn {
    program: launcher.program.clone(),
    message: e.to_string(),
  })?;

  // The event is written alongside the wait: a function that never drains
  // stdin must still hit the deadline once the pipe buffer is full
  if let Some(mut stdin) = child.stdin.take() {
    let mut payload = request.event.to_string().into_bytes();
    payload.push(b'\n');
    let name = function.name.clone();
    tokio::spawn(async move {
      if let Err(e) = stdin.write_all(&payload).await {
        debug!(function = %name, error = %e, "Function did not read the event");
      }
    });
  }

  // Dropping the child on timeout kills it, which also ends the writer
  let output = match timeout_at(deadline, child.wait_with_output()).await {
    Ok(Ok(output)) => output,
    Ok(Err(e)) => return Err(InvokeError::Process(e.to_string())),
    Err(_) => {
      warn!(
        function = %function.name,
        timeout_secs,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Function timed out"
      );
      return Err(InvokeError::Timeout { secs: timeout_secs });
    }
  };

  let stderr = String::from_utf8_lossy(&output.stderr);
  for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
    info!(function = %function.name, stream = "stderr", "{}", line);
  }

  let stdout = String::from_utf8_lossy(&output.stdout);
  let mut lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
  let last = lines.pop();
  for line in lines {
    info!(function = %function.name, stream = "stdout", "{}", line);
  }

  let Some(envelope) = last.and_then(Envelope::parse_line) else {
    if let Some(line) = last {
      info!(function = %function.name, stream = "stdout", "{}", line);
    }
    let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default();
    return Err(InvokeError::Process(format!(
      "{} exited ({}) without a response {}",
      function.name, output.status, tail
    )));
  };

  debug!(
    function = %function.name,
    elapsed_ms = start.elapsed().as_millis() as u64,
    "Function completed"
  );

  parse_response(envelope.into_message()?)
}
