//! Project-wide legacy builder.
//!
//! A project opts in by depending on the configured tool and running
//! `<tool> build <dir>` from one of its `package.json` scripts. The build then
//! runs that script through the project's package manager and the output
//! directory becomes the source set of every script function.
//!
//! Detection happens once per [`LegacyBuilderCache`] and the outcome, including
//! "not present", is memoized.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use serde::Deserialize;
use tokio::{process::Command, sync::OnceCell};
use tracing::{debug, info, warn};

use super::BuildError;
use crate::domain::{config::LegacyBuilderConfig, function::BuildResult};

/// Flags of the build subcommand that consume the following token
const VALUE_FLAGS: &[&str] = &["-c", "--config", "-p", "--port", "-t", "--timeout", "-b", "--babelrc"];

/// Tokens ending one shell command
const COMMAND_SEPARATORS: &[&str] = &["&&", "||", ";", "|"];

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PackageJson {
  dependencies: BTreeMap<String, serde_json::Value>,
  dev_dependencies: BTreeMap<String, serde_json::Value>,
  scripts: BTreeMap<String, String>,
}

impl PackageJson {
  fn depends_on(&self, package: &str) -> bool {
    self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
  }
}

// ============================================================================
// Builder
// ============================================================================

/// A detected legacy builder, shared by every script function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyBuilder {
  pub project_root: PathBuf,
  /// `package.json` script running the build
  pub script: String,
  /// Output directory named by the script, resolved against the project root
  pub src_dir: PathBuf,
  /// `yarn` when the project has a yarn lockfile, else `npm`
  pub package_manager: &'static str,
}

impl LegacyBuilder {
  pub async fn build(&self) -> Result<BuildResult, BuildError> {
    info!(script = %self.script, manager = self.package_manager, "Running legacy build");

    let output = Command::new(self.package_manager)
      .args(["run", self.script.as_str()])
      .current_dir(&self.project_root)
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| BuildError::spawn(self.package_manager, e))?;

    if !output.status.success() {
      return Err(BuildError::CommandFailed {
        program: format!("{} run {}", self.package_manager, self.script),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    Ok(BuildResult::from_src_files(vec![self.src_dir.clone()]))
  }
}

// ============================================================================
// Detection
// ============================================================================

/// Memoized legacy builder detection for one project
#[derive(Debug, Clone, Default)]
pub struct LegacyBuilderCache {
  project_root: PathBuf,
  config: LegacyBuilderConfig,
  cell: Arc<OnceCell<Option<LegacyBuilder>>>,
}

impl LegacyBuilderCache {
  pub fn new(project_root: PathBuf, config: LegacyBuilderConfig) -> Self {
    Self {
      project_root,
      config,
      cell: Arc::new(OnceCell::new()),
    }
  }

  /// Detected builder, computing it on first use
  pub async fn detect(&self) -> Option<LegacyBuilder> {
    self
      .cell
      .get_or_init(|| async {
        if !self.config.enabled {
          return None;
        }
        match detect_legacy_builder(&self.project_root, &self.config.tool).await {
          Ok(builder) => builder,
          Err(e) => {
            warn!(error = %e, "Legacy builder detection failed");
            None
          }
        }
      })
      .await
      .clone()
  }
}

async fn detect_legacy_builder(project_root: &Path, tool: &str) -> Result<Option<LegacyBuilder>, BuildError> {
  let manifest_path = project_root.join("package.json");
  let content = match tokio::fs::read_to_string(&manifest_path).await {
    Ok(content) => content,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(BuildError::read(&manifest_path, e)),
  };

  let manifest: PackageJson =
    serde_json::from_str(&content).map_err(|e| BuildError::read(&manifest_path, e))?;

  if !manifest.depends_on(tool) {
    return Ok(None);
  }

  let matches: Vec<(&String, String)> = manifest
    .scripts
    .iter()
    .flat_map(|(script, command)| {
      build_directories(command, tool)
        .into_iter()
        .map(move |dir| (script, dir))
    })
    .collect();

  match matches.as_slice() {
    [] => {
      warn!(tool, "Project depends on the legacy builder but no script runs '{} build <dir>'", tool);
      Ok(None)
    }
    [(script, dir)] => {
      let package_manager = if project_root.join("yarn.lock").exists() {
        "yarn"
      } else {
        "npm"
      };
      debug!(script = %script, dir = %dir, "Detected legacy builder");
      Ok(Some(LegacyBuilder {
        project_root: project_root.to_path_buf(),
        script: (*script).clone(),
        src_dir: project_root.join(dir),
        package_manager,
      }))
    }
    _ => {
      let scripts: Vec<&str> = matches.iter().map(|(script, _)| script.as_str()).collect();
      warn!(?scripts, "Multiple legacy build directories found, not using the legacy builder");
      Ok(None)
    }
  }
}

/// Positional directories passed to `<tool> build` in one script command
fn build_directories(command: &str, tool: &str) -> Vec<String> {
  let tokens: Vec<&str> = command.split_whitespace().collect();
  let mut dirs = Vec::new();
  let mut i = 0;

  while i < tokens.len() {
    let is_tool = tokens[i] == tool || tokens[i].ends_with(&format!("/{tool}"));
    if !(is_tool && tokens.get(i + 1) == Some(&"build")) {
      i += 1;
      continue;
    }

    i += 2;
    while i < tokens.len() && !COMMAND_SEPARATORS.contains(&tokens[i]) {
      let token = tokens[i];
      if token.starts_with('-') {
        if VALUE_FLAGS.contains(&token) {
          i += 1;
        }
      } else {
        dirs.push(token.to_string());
      }
      i += 1;
    }
  }

  dirs
}
