//! CLI command implementations

mod config;
mod invoke;
mod list;
mod serve;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context, Result};
use lambdev::{FunctionsRegistry, RegistryOptions, ScanSummary, config::Config};
use tracing::warn;

pub use config::{cmd_config_init, cmd_config_show};
pub use invoke::{InvokeArgs, cmd_invoke};
pub use list::cmd_list;
pub use serve::cmd_serve;

/// Project root and its effective configuration
pub struct Project {
  pub root: PathBuf,
  pub config: Config,
  /// Explicit config file, when one was given
  pub config_file: Option<PathBuf>,
}

impl Project {
  /// Resolve the project root (default: current directory) and load its config.
  ///
  /// An explicit `config_file` must load; otherwise project and user configs
  /// are tried in turn, falling back to defaults.
  pub fn load(root: Option<PathBuf>, config_file: Option<PathBuf>) -> Result<Self> {
    let root = match root {
      Some(root) => root,
      None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let root = std::fs::canonicalize(&root).with_context(|| format!("Project directory {:?} not found", root))?;

    let config = match &config_file {
      Some(path) => Config::load_file(path)?,
      None => Config::load_for_project(&root),
    };

    Ok(Self {
      root,
      config,
      config_file,
    })
  }

  /// Functions directories to scan, `override_dir` replacing the configured ones
  pub fn functions_directories(&self, override_dir: Option<&Path>) -> Vec<PathBuf> {
    match override_dir {
      Some(dir) if dir.is_absolute() => vec![dir.to_path_buf()],
      Some(dir) => vec![self.root.join(dir)],
      None => self.config.resolved_functions_directories(&self.root),
    }
  }

  /// Build a registry over the project and run the first scan
  pub async fn open_registry(
    &self,
    directories: &[PathBuf],
    watch: bool,
  ) -> Result<(Arc<FunctionsRegistry>, ScanSummary)> {
    let mut options = RegistryOptions::new(self.root.clone(), &self.config);
    if !watch {
      options = options.without_watch();
    }

    let registry = FunctionsRegistry::new(options);
    let summary = registry
      .scan(directories)
      .await
      .context("Failed to scan functions directories")?;

    for (name, error) in &summary.failed {
      warn!(function = %name, "Build failed: {}", error);
    }

    Ok((registry, summary))
  }

  /// `path` relative to the project root when it lies inside it
  pub fn display_path<'a>(&self, path: &'a Path) -> std::path::Display<'a> {
    path.strip_prefix(&self.root).unwrap_or(path).display()
  }
}
