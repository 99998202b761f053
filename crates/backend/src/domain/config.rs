//! Configuration for lambdev with per-project overrides.
//!
//! Config priority: project-relative (lambdev.toml) > user (~/.config/lambdev/config.toml)
//!
//! Only the `[functions]` subsection ever reaches discovery and builds. Everything
//! else (plugins, log settings) stays with the registry or the CLI.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// File name of the project-level config, relative to the project root
pub const PROJECT_CONFIG_FILE: &str = "lambdev.toml";

// ============================================================================
// Functions Configuration
// ============================================================================

/// Bundler hint for managed-script functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeBundler {
  Esbuild,
  Zisi,
  Nft,
}

/// Settings for one function (or a glob of functions)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
  /// Extra files bundled with the function, relative to the project root.
  /// Entries starting with `!` exclude matches.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub included_files: Vec<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub node_bundler: Option<NodeBundler>,

  /// Cron expression; overrides any schedule declared in source
  #[serde(skip_serializing_if = "Option::is_none")]
  pub schedule: Option<String>,

  /// Invocation timeout in seconds; overrides `[timeouts]`
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout: Option<u64>,
}

impl FunctionConfig {
  /// Layer `other` on top of `self`. Set fields in `other` win.
  fn merged(mut self, other: &FunctionConfig) -> Self {
    if !other.included_files.is_empty() {
      self.included_files = other.included_files.clone();
    }
    self.node_bundler = other.node_bundler.or(self.node_bundler);
    self.schedule = other.schedule.clone().or(self.schedule);
    self.timeout = other.timeout.or(self.timeout);
    self
  }
}

/// The `[functions]` subsection, keyed by function name or glob
///
/// ```toml
/// [functions."*"]
/// included_files = ["include/*", "!include/a.txt"]
///
/// [functions.hello]
/// schedule = "@daily"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionsConfig(BTreeMap<String, FunctionConfig>);

impl FunctionsConfig {
  pub fn new(entries: BTreeMap<String, FunctionConfig>) -> Self {
    Self(entries)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn entries(&self) -> &BTreeMap<String, FunctionConfig> {
    &self.0
  }

  /// Resolve the effective settings for `name`.
  ///
  /// Every matching key applies: `*` first, then other globs, then the exact
  /// name. Later layers override earlier ones field by field.
  pub fn resolve(&self, name: &str) -> FunctionConfig {
    let mut layers: Vec<(u8, &str, &FunctionConfig)> = self
      .0
      .iter()
      .filter_map(|(key, config)| {
        let rank = if key == name {
          2
        } else if key == "*" {
          0
        } else if glob::Pattern::new(key).is_ok_and(|p| p.matches(name)) {
          1
        } else {
          return None;
        };
        Some((rank, key.as_str(), config))
      })
      .collect();

    layers.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    layers
      .into_iter()
      .fold(FunctionConfig::default(), |acc, (_, _, config)| acc.merged(config))
  }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Default invocation timeouts in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
  /// Synchronous functions (default: 30)
  pub sync_functions: u64,
  /// Functions whose name ends in `-background` (default: 900)
  pub background_functions: u64,
}

impl Default for TimeoutsConfig {
  fn default() -> Self {
    Self {
      sync_functions: 30,
      background_functions: 900,
    }
  }
}

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Managed-script runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsRuntimeConfig {
  /// Interpreter used by the built-in launch shims
  pub node: String,

  /// Replaces the built-in direct launcher. `{entry}` expands to the entry path.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub direct_command: Option<Vec<String>>,

  /// Replaces the built-in worker launcher. `{entry}` expands to the entry path.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub worker_command: Option<Vec<String>>,
}

impl Default for JsRuntimeConfig {
  fn default() -> Self {
    Self {
      node: "node".to_string(),
      direct_command: None,
      worker_command: None,
    }
  }
}

/// Compiled-binary runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoRuntimeConfig {
  /// Toolchain binary used for `build`
  pub toolchain: String,
}

impl Default for GoRuntimeConfig {
  fn default() -> Self {
    Self {
      toolchain: "go".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimesConfig {
  pub js: JsRuntimeConfig,
  pub go: GoRuntimeConfig,
}

/// Detection settings for the project-wide legacy builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyBuilderConfig {
  /// Disable detection entirely
  pub enabled: bool,
  /// Package name whose `build` script takes over every script function
  pub tool: String,
}

impl Default for LegacyBuilderConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      tool: "netlify-lambda".to_string(),
    }
  }
}

// ============================================================================
// Watcher / Log Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
  /// Debounce window in milliseconds (default: 100)
  pub debounce_ms: u64,
  /// Poll interval for backends that poll (default: 2)
  pub poll_secs: u64,
  /// Extra gitignore-style patterns ignored by every watch
  pub ignored: Vec<String>,
}

impl Default for WatcherSettings {
  fn default() -> Self {
    Self {
      debounce_ms: 100,
      poll_secs: 2,
      ignored: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Log level: error, warn, info, debug, trace (default: info)
  pub level: String,
  /// Log file rotation: daily, hourly, never (default: daily)
  pub rotation: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Config
// ============================================================================

/// Project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Directories scanned for functions, relative to the project root
  pub functions_directories: Vec<PathBuf>,

  /// Build plugins. Never forwarded to function builds.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub plugins: Vec<String>,

  /// Per-function settings keyed by name or glob
  pub functions: FunctionsConfig,

  pub timeouts: TimeoutsConfig,
  pub runtimes: RuntimesConfig,
  pub legacy_builder: LegacyBuilderConfig,
  pub watcher: WatcherSettings,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      functions_directories: vec![PathBuf::from("functions")],
      plugins: Vec::new(),
      functions: FunctionsConfig::default(),
      timeouts: TimeoutsConfig::default(),
      runtimes: RuntimesConfig::default(),
      legacy_builder: LegacyBuilderConfig::default(),
      watcher: WatcherSettings::default(),
      log: LogConfig::default(),
    }
  }
}

/// Errors loading an explicit config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

impl Config {
  /// Load config for a project, with fallback to user config
  pub fn load_for_project(project_path: &Path) -> Self {
    let project_config = Self::project_config_path(project_path);
    if project_config.exists()
      && let Ok(config) = Self::load_file(&project_config)
    {
      return config;
    }

    if let Some(user_config_path) = Self::user_config_path()
      && user_config_path.exists()
      && let Ok(config) = Self::load_file(&user_config_path)
    {
      return config;
    }

    Self::default()
  }

  /// Load a single config file, surfacing read and parse errors
  pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    Some(crate::dirs::default_config_dir().join("config.toml"))
  }

  /// Get the project-relative config path
  pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(PROJECT_CONFIG_FILE)
  }

  /// Functions directories resolved against the project root
  pub fn resolved_functions_directories(&self, project_root: &Path) -> Vec<PathBuf> {
    self
      .functions_directories
      .iter()
      .map(|dir| if dir.is_absolute() { dir.clone() } else { project_root.join(dir) })
      .collect()
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# lambdev configuration
# Place in ./{project_file} (project) or ~/.config/lambdev/config.toml (user)

# Directories scanned for functions, relative to this file
functions_directories = ["functions"]

# ============================================================================
# Per-function settings (keys are function names or globs)
# ============================================================================

# [functions."*"]
# included_files = ["include/*", "!include/secret.txt"]
# node_bundler = "esbuild"

# [functions.hello]
# schedule = "@daily"
# timeout = 10

# ============================================================================
# Timeouts (seconds)
# ============================================================================

[timeouts]
sync_functions = {sync}
background_functions = {background}

# ============================================================================
# Runtimes
# ============================================================================

[runtimes.js]
node = "{node}"
# direct_command = ["node", "my-shim.mjs", "{{entry}}"]
# worker_command = ["node", "my-worker.mjs", "{{entry}}"]

[runtimes.go]
toolchain = "{go}"

[legacy_builder]
enabled = true
tool = "{legacy_tool}"

# ============================================================================
# Watcher / logging
# ============================================================================

[watcher]
debounce_ms = {debounce}
# ignored = ["*.tmp"]

[log]
level = "{level}"
rotation = "{rotation}"
"#,
      project_file = PROJECT_CONFIG_FILE,
      sync = defaults.timeouts.sync_functions,
      background = defaults.timeouts.background_functions,
      node = defaults.runtimes.js.node,
      go = defaults.runtimes.go.toolchain,
      legacy_tool = defaults.legacy_builder.tool,
      debounce = defaults.watcher.debounce_ms,
      level = defaults.log.level,
      rotation = defaults.log.rotation,
    )
  }
}
