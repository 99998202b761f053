//! Function descriptors and build outputs.
//!
//! A [`FunctionDescriptor`] is created by discovery and shared as `Arc` between the
//! registry, the function's build actor and invocation callers. Its build state is
//! held in a `watch` channel so an update replaces the whole `Arc<BuildData>` at once:
//! readers observe either the previous build or the new one.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
  sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::config::{FunctionConfig, TimeoutsConfig};

/// Suffix marking asynchronous (background) functions
pub const BACKGROUND_SUFFIX: &str = "-background";

// ============================================================================
// Runtime Name
// ============================================================================

/// Tag of the runtime that handles a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeName {
  /// Managed-script runtime
  Js,
  /// Compiled-binary runtime
  Go,
}

impl RuntimeName {
  pub fn as_str(&self) -> &'static str {
    match self {
      RuntimeName::Js => "js",
      RuntimeName::Go => "go",
    }
  }
}

impl std::fmt::Display for RuntimeName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl std::str::FromStr for RuntimeName {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "js" => Ok(RuntimeName::Js),
      "go" => Ok(RuntimeName::Go),
      _ => Err(()),
    }
  }
}

// ============================================================================
// Build Result / Build Data
// ============================================================================

/// Output of a builder strategy. Immutable once produced.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
  /// Source paths contributing to the function, in order, without duplicates
  pub src_files: Vec<PathBuf>,
  /// Extra bundled paths, also watched
  #[serde(default)]
  pub included_files: Vec<PathBuf>,
  pub schedule: Option<String>,
  /// Protocol version as reported by the builder. Anything but the number 2 means v1.
  pub runtime_api_version: Option<serde_json::Value>,
  /// Compiled output, when it differs from the main file
  pub build_path: Option<PathBuf>,
}

impl BuildResult {
  /// Result whose only content is a source set
  pub fn from_src_files(src_files: Vec<PathBuf>) -> Self {
    Self {
      src_files: dedup_ordered(src_files),
      ..Default::default()
    }
  }
}

/// Build data attached to a descriptor after a successful build
pub type BuildData = BuildResult;

/// Paths added and removed between two consecutive builds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SrcFilesDiff {
  pub added: Vec<PathBuf>,
  pub deleted: Vec<PathBuf>,
}

impl SrcFilesDiff {
  pub fn between(previous: &[PathBuf], current: &[PathBuf]) -> Self {
    let previous_set: HashSet<&PathBuf> = previous.iter().collect();
    let current_set: HashSet<&PathBuf> = current.iter().collect();

    Self {
      added: current.iter().filter(|p| !previous_set.contains(p)).cloned().collect(),
      deleted: previous.iter().filter(|p| !current_set.contains(p)).cloned().collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.deleted.is_empty()
  }
}

/// Remove duplicates while keeping first-seen order
pub fn dedup_ordered(paths: Vec<PathBuf>) -> Vec<PathBuf> {
  let mut seen = HashSet::new();
  paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

/// Current build state of a function
#[derive(Debug, Clone, Default)]
pub struct BuildState {
  /// Last successful build
  pub data: Option<Arc<BuildData>>,
  /// Error of the most recent build attempt, cleared on success
  pub error: Option<String>,
  /// Sources changed since the last build
  pub stale: bool,
  /// Number of completed build attempts
  pub attempts: u64,
}

// ============================================================================
// Function Descriptor
// ============================================================================

/// Registry record of one discovered function
#[derive(Debug)]
pub struct FunctionDescriptor {
  pub name: String,
  /// Primary source file
  pub main_file: PathBuf,
  /// Scanned directory containing the function
  pub directory: PathBuf,
  pub runtime: RuntimeName,
  /// Settings resolved from the `[functions]` subsection
  pub config: FunctionConfig,
  timeout_secs: u64,
  build: watch::Sender<BuildState>,
}

impl FunctionDescriptor {
  pub fn new(
    name: impl Into<String>,
    main_file: PathBuf,
    directory: PathBuf,
    runtime: RuntimeName,
    config: FunctionConfig,
    timeouts: &TimeoutsConfig,
  ) -> Self {
    let name = name.into();
    let default_timeout = if name.ends_with(BACKGROUND_SUFFIX) {
      timeouts.background_functions
    } else {
      timeouts.sync_functions
    };
    let timeout_secs = config.timeout.unwrap_or(default_timeout);
    let (build, _) = watch::channel(BuildState::default());

    Self {
      name,
      main_file,
      directory,
      runtime,
      config,
      timeout_secs,
      build,
    }
  }

  /// Latest successful build, if any
  pub fn build_data(&self) -> Option<Arc<BuildData>> {
    self.build.borrow().data.clone()
  }

  pub fn build_state(&self) -> BuildState {
    self.build.borrow().clone()
  }

  /// Receiver notified on every build state change
  pub fn subscribe(&self) -> watch::Receiver<BuildState> {
    self.build.subscribe()
  }

  /// Replace the build data in one step
  pub fn set_build_data(&self, data: BuildData) -> Arc<BuildData> {
    let data = Arc::new(data);
    self.build.send_modify(|state| {
      state.data = Some(data.clone());
      state.error = None;
      state.stale = false;
      state.attempts += 1;
    });
    data
  }

  /// Record a failed build. The last good build data stays in place.
  pub fn set_build_error(&self, error: impl Into<String>) {
    let error = error.into();
    self.build.send_modify(|state| {
      state.error = Some(error);
      state.attempts += 1;
    });
  }

  /// Flag sources as changed since the last build
  pub fn mark_stale(&self) {
    self.build.send_if_modified(|state| {
      let changed = !state.stale;
      state.stale = true;
      changed
    });
  }

  /// Built output if present, otherwise the main file
  pub fn entry_path(&self) -> PathBuf {
    self
      .build_data()
      .and_then(|data| data.build_path.clone())
      .unwrap_or_else(|| self.main_file.clone())
  }

  /// Whether the main file lives in its own folder inside the scanned directory
  pub fn has_own_directory(&self) -> bool {
    self.main_file.parent().is_some_and(|parent| parent != self.directory)
  }

  /// Folder holding the main file
  pub fn function_directory(&self) -> &Path {
    self.main_file.parent().unwrap_or(&self.directory)
  }

  pub fn is_background(&self) -> bool {
    self.name.ends_with(BACKGROUND_SUFFIX)
  }

  pub fn is_scheduled(&self) -> bool {
    self.schedule().is_some()
  }

  pub fn schedule(&self) -> Option<String> {
    self.build_data().and_then(|data| data.schedule.clone())
  }

  /// Main file uses one of the secondary script extensions
  pub fn is_typescript(&self) -> bool {
    matches!(
      self.main_file.extension().and_then(|e| e.to_str()),
      Some("ts" | "mts" | "cts")
    )
  }

  /// Invocation timeout in seconds
  pub fn timeout_secs(&self) -> u64 {
    self.timeout_secs
  }
}
