//! Builder strategy selection for managed-script functions.
//!
//! Strategies are an ordered list of detectors. Each detector inspects a
//! [`BuildInput`] and either claims the function by returning a [`Builder`] or
//! passes. The first claim wins:
//!
//! 1. [`legacy`]: project-wide builder, detected once per cache and shared
//! 2. [`metadata`]: packaging tool driven by in-source metadata and config
//! 3. fallback: the function's own file or folder is its source set
//!
//! The fallback always claims, so selection never comes back empty.

pub mod legacy;
pub mod metadata;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use self::{
  legacy::{LegacyBuilder, LegacyBuilderCache},
  metadata::{FunctionMetadata, PackagingTool},
};
use crate::domain::{
  config::FunctionConfig,
  function::{BuildResult, FunctionDescriptor},
};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while detecting or running a builder
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
  #[error("Failed to read {path}: {message}")]
  Read { path: PathBuf, message: String },

  #[error("Failed to run {program}: {message}")]
  Spawn { program: String, message: String },

  #[error("{program} exited with code {code}: {stderr}")]
  CommandFailed { program: String, code: i32, stderr: String },

  #[error("Invalid included_files pattern '{pattern}': {message}")]
  Pattern { pattern: String, message: String },

  #[error("Runtime {0} cannot build this function")]
  Unsupported(String),

  #[error("Build actor for '{0}' has shut down")]
  ActorGone(String),
}

impl BuildError {
  pub(crate) fn read(path: &Path, err: impl std::fmt::Display) -> Self {
    Self::Read {
      path: path.to_path_buf(),
      message: err.to_string(),
    }
  }

  pub(crate) fn spawn(program: &str, err: impl std::fmt::Display) -> Self {
    Self::Spawn {
      program: program.to_string(),
      message: err.to_string(),
    }
  }
}

// ============================================================================
// Build Input
// ============================================================================

/// Everything a detector may look at for one function
pub struct BuildInput {
  pub name: String,
  pub main_file: PathBuf,
  /// Scanned directory the function was found in
  pub directory: PathBuf,
  /// Settings resolved from the `[functions]` subsection
  pub config: FunctionConfig,
  pub project_root: PathBuf,
  legacy: LegacyBuilderCache,
  packaging: Arc<dyn PackagingTool>,
  metadata: OnceCell<Option<Arc<FunctionMetadata>>>,
}

impl BuildInput {
  pub fn new(
    function: &FunctionDescriptor,
    project_root: PathBuf,
    legacy: LegacyBuilderCache,
    packaging: Arc<dyn PackagingTool>,
  ) -> Self {
    Self {
      name: function.name.clone(),
      main_file: function.main_file.clone(),
      directory: function.directory.clone(),
      config: function.config.clone(),
      project_root,
      legacy,
      packaging,
      metadata: OnceCell::new(),
    }
  }

  /// Folder of the main file when it differs from the scanned directory
  pub fn own_directory(&self) -> Option<&Path> {
    self.main_file.parent().filter(|parent| *parent != self.directory)
  }

  /// In-source metadata with config overrides applied, computed at most once
  ///
  /// Unreadable sources yield `None`; the build that follows reports the error.
  pub async fn metadata(&self) -> Option<Arc<FunctionMetadata>> {
    self
      .metadata
      .get_or_init(|| async {
        match self.packaging.get_metadata(&self.main_file).await {
          Ok(metadata) => Some(Arc::new(metadata.with_config(&self.config))),
          Err(e) => {
            warn!(function = %self.name, error = %e, "Failed to read function metadata");
            None
          }
        }
      })
      .await
      .clone()
  }
}

// ============================================================================
// Builders
// ============================================================================

/// A strategy that claimed a function
#[derive(Debug, Clone)]
pub enum Builder {
  Legacy(LegacyBuilder),
  Metadata(Option<Arc<FunctionMetadata>>),
  Fallback(BuildResult),
}

impl Builder {
  pub fn name(&self) -> &'static str {
    match self {
      Builder::Legacy(_) => "legacy",
      Builder::Metadata(_) => "metadata",
      Builder::Fallback(_) => "fallback",
    }
  }

  pub async fn build(&self, input: &BuildInput) -> Result<BuildResult, BuildError> {
    match self {
      Builder::Legacy(builder) => builder.build().await,
      Builder::Metadata(metadata) => input.packaging.build(input, metadata.as_deref()).await,
      Builder::Fallback(result) => Ok(result.clone()),
    }
  }
}

type Detector = for<'a> fn(&'a BuildInput) -> BoxFuture<'a, Result<Option<Builder>, BuildError>>;

/// Detectors in priority order
const STRATEGIES: &[Detector] = &[detect_legacy, detect_metadata, detect_fallback];

fn detect_legacy(input: &BuildInput) -> BoxFuture<'_, Result<Option<Builder>, BuildError>> {
  Box::pin(async move { Ok(input.legacy.detect().await.map(Builder::Legacy)) })
}

fn detect_metadata(input: &BuildInput) -> BoxFuture<'_, Result<Option<Builder>, BuildError>> {
  Box::pin(async move {
    let metadata = input.metadata().await;
    if input.packaging.detect(input, metadata.as_deref()) {
      Ok(Some(Builder::Metadata(metadata)))
    } else {
      Ok(None)
    }
  })
}

fn detect_fallback(input: &BuildInput) -> BoxFuture<'_, Result<Option<Builder>, BuildError>> {
  Box::pin(async move {
    let src = match input.own_directory() {
      Some(dir) => dir.to_path_buf(),
      None => input.main_file.clone(),
    };

    // Schedule comes from the metadata step even though it did not claim
    let schedule = input.metadata().await.and_then(|m| m.schedule.clone());
    let included_files =
      metadata::resolve_included_files(input.project_root.clone(), input.config.included_files.clone()).await?;

    Ok(Some(Builder::Fallback(BuildResult {
      schedule,
      included_files,
      ..BuildResult::from_src_files(vec![src])
    })))
  })
}

/// Pick the first strategy that claims `input`
pub async fn select_builder(input: &BuildInput) -> Result<Builder, BuildError> {
  select_strategy(input).await.map(|(_, builder)| builder)
}

async fn select_strategy(input: &BuildInput) -> Result<(usize, Builder), BuildError> {
  for (index, detect) in STRATEGIES.iter().enumerate() {
    if let Some(builder) = detect(input).await? {
      debug!(function = %input.name, builder = builder.name(), "Selected builder");
      return Ok((index, builder));
    }
  }

  Err(BuildError::Unsupported(input.name.clone()))
}

/// Strategy chosen per main file, held until the next scan cycle
///
/// Rebuilds re-run only the chosen detector so its output reflects the
/// current source. A detector that stops claiming triggers a full selection.
#[derive(Default)]
pub struct StrategySelections {
  chosen: DashMap<PathBuf, usize>,
}

impl StrategySelections {
  pub fn new() -> Self {
    Self::default()
  }

  /// Forget every choice; called when a scan cycle starts
  pub fn clear(&self) {
    self.chosen.clear();
  }

  pub async fn select(&self, input: &BuildInput) -> Result<Builder, BuildError> {
    let cached = self.chosen.get(&input.main_file).map(|entry| *entry);
    if let Some(index) = cached {
      if let Some(builder) = STRATEGIES[index](input).await? {
        return Ok(builder);
      }
    }

    let (index, builder) = select_strategy(input).await?;
    self.chosen.insert(input.main_file.clone(), index);
    Ok(builder)
  }
}
