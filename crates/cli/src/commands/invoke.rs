//! Invoke command: call one function locally with a synthesized event

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use cli::payload::{EventOptions, build_invocation, parse_payload_flag};
use lambdev::{InvocationResult, InvokeError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::Project;

pub struct InvokeArgs {
  pub name: String,
  pub payload: Option<String>,
  pub identity: bool,
  pub querystring: Option<String>,
  pub timeout: Option<u64>,
  pub functions_dir: Option<PathBuf>,
  /// Print the whole response object instead of only the body
  pub full: bool,
}

pub async fn cmd_invoke(project: &Project, args: InvokeArgs) -> Result<()> {
  let directories = project.functions_directories(args.functions_dir.as_deref());
  let (registry, _) = project.open_registry(&directories, false).await?;

  let Some(function) = registry.get(&args.name) else {
    let names: Vec<String> = registry.list_functions().iter().map(|f| f.name.clone()).collect();
    registry.shutdown();
    if names.is_empty() {
      bail!("No function named '{}' (no functions found)", args.name);
    }
    bail!("No function named '{}'. Available: {}", args.name, names.join(", "));
  };

  let working_dir = std::env::current_dir().unwrap_or_else(|_| project.root.clone());
  let options = EventOptions {
    payload: args
      .payload
      .as_deref()
      .and_then(|raw| parse_payload_flag(raw, &working_dir)),
    identity: args.identity,
    querystring: args.querystring.clone(),
    scheduled: function.is_scheduled(),
  };

  let mut request = build_invocation(&function.name, &options, chrono::Utc::now());
  request.timeout_seconds = args.timeout;
  debug!(function = %function.name, event = %request.event, "Invoking");

  let result = registry.invoke(&function.name, request).await;
  registry.shutdown();

  match result {
    Ok(result) => print_result(result, args.full).await,
    Err(e) => report_error(&function.name, e),
  }
}

async fn print_result(result: InvocationResult, full: bool) -> Result<()> {
  match result {
    InvocationResult::Direct(response) => {
      info!(status = ?response.status_code, "Function responded");
      if full {
        println!("{}", serde_json::to_string_pretty(&response)?);
      } else if let Some(body) = response.body {
        println!("{}", body);
      }
    }
    InvocationResult::Worker { message, body } => {
      info!(status = ?message.status_code(), streamed = body.is_some(), "Function responded");
      if full || body.is_none() {
        println!("{}", serde_json::to_string_pretty(&message)?);
      }
      if let Some(mut body) = body {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut body, &mut stdout)
          .await
          .context("Failed to read streamed response")?;
        stdout.flush().await?;
      }
    }
  }
  Ok(())
}

fn report_error(name: &str, error: InvokeError) -> Result<()> {
  if error.is_timeout() {
    bail!("{} timed out ({}). Raise the limit with --timeout.", name, error);
  }
  bail!(
    "Ran into an error invoking {}: {} (status {})",
    name,
    error,
    error.status_code()
  )
}
