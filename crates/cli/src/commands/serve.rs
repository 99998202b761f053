//! Serve command: keep the registry loaded and rebuilding until interrupted

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::Project;

pub async fn cmd_serve(project: &Project, functions_dir: Option<&Path>) -> Result<()> {
  let directories = project.functions_directories(functions_dir);
  let (registry, summary) = project.open_registry(&directories, true).await?;

  for directory in &directories {
    info!(directory = %project.display_path(directory), "Watching functions directory");
  }

  let functions = registry.list_functions();
  println!("Loaded {} function(s), {} failed to build", functions.len(), summary.failed.len());
  for function in &functions {
    println!("  {} [{}] {}", function.name, function.runtime, project.display_path(&function.main_file));
  }
  println!("\nWatching for changes. Press Ctrl+C to stop.");

  tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

  info!("Shutting down");
  registry.shutdown();
  Ok(())
}
