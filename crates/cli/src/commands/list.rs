//! List command

use std::path::Path;

use anyhow::Result;
use lambdev::Protocol;
use serde_json::json;

use super::Project;

/// Scan, build once, and print every discovered function
pub async fn cmd_list(project: &Project, functions_dir: Option<&Path>, json_output: bool) -> Result<()> {
  let directories = project.functions_directories(functions_dir);
  let (registry, _) = project.open_registry(&directories, false).await?;
  let functions = registry.list_functions();

  if json_output {
    let entries: Vec<_> = functions
      .iter()
      .map(|function| {
        let state = function.build_state();
        json!({
          "name": function.name,
          "runtime": function.runtime.as_str(),
          "mainFile": function.main_file,
          "entry": function.entry_path(),
          "typescript": function.is_typescript(),
          "protocol": state.data.as_ref().map(|data| Protocol::for_build(Some(&**data)).as_str()),
          "schedule": function.schedule(),
          "background": function.is_background(),
          "timeout": function.timeout_secs(),
          "srcFiles": state.data.as_ref().map(|data| data.src_files.clone()).unwrap_or_default(),
          "error": state.error,
        })
      })
      .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    registry.shutdown();
    return Ok(());
  }

  if functions.is_empty() {
    println!("No functions found in:");
    for directory in &directories {
      println!("  {}", project.display_path(directory));
    }
    registry.shutdown();
    return Ok(());
  }

  println!("Functions ({})", functions.len());
  println!("=============\n");

  for function in &functions {
    let state = function.build_state();
    let protocol = state
      .data
      .as_ref()
      .map(|data| Protocol::for_build(Some(&**data)).as_str())
      .unwrap_or("-");

    println!("{} [{} {}]", function.name, function.runtime, protocol);
    println!("  File:     {}", project.display_path(&function.main_file));
    if let Some(schedule) = function.schedule() {
      println!("  Schedule: {}", schedule);
    }
    if function.is_background() {
      println!("  Background, timeout {}s", function.timeout_secs());
    }
    match (&state.data, &state.error) {
      (_, Some(error)) => println!("  Build:    FAILED - {}", error),
      (Some(data), None) => println!("  Build:    ok ({} source paths)", data.src_files.len()),
      (None, None) => println!("  Build:    pending"),
    }
    println!();
  }

  registry.shutdown();
  Ok(())
}
