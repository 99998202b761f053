//! Runtimes: how functions of each language are built and launched.
//!
//! A [`Runtime`] owns three concerns for its functions:
//! - work done once per directory scan (e.g. a project-wide build)
//! - building one function into a [`BuildResult`]
//! - the command line that runs a built function under a given protocol

pub mod builder;
pub mod cache;
pub mod discovery;
pub mod go;
pub mod js;

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
use tokio::process::Command;

use self::builder::BuildError;
use crate::{
  domain::function::{BuildResult, FunctionDescriptor, RuntimeName},
  invoke::{InvokeError, Protocol},
};

/// Placeholder replaced by the entry path in configured commands
pub const ENTRY_PLACEHOLDER: &str = "{entry}";

// ============================================================================
// Launcher
// ============================================================================

/// Command line of a function process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
  pub program: String,
  pub args: Vec<String>,
  /// Extra environment on top of what the invoker sets
  pub env: Vec<(String, String)>,
}

impl Launcher {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      env: Vec::new(),
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  /// Build from a configured command, expanding [`ENTRY_PLACEHOLDER`]
  pub fn from_template(command: &[String], entry: &Path) -> Option<Self> {
    let entry = entry.to_string_lossy();
    let mut parts = command.iter().map(|part| part.replace(ENTRY_PLACEHOLDER, &entry));
    let program = parts.next()?;
    Some(Self {
      program,
      args: parts.collect(),
      env: Vec::new(),
    })
  }

  /// Command inheriting the parent environment
  pub fn command(&self) -> Command {
    let mut command = Command::new(&self.program);
    command.args(&self.args);
    command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    command
  }

  /// Command whose environment is exactly `base` plus the launcher's own variables
  pub fn command_with_env<'a>(&self, base: impl IntoIterator<Item = (&'a String, &'a String)>) -> Command {
    let mut command = Command::new(&self.program);
    command.args(&self.args).env_clear().envs(base);
    command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    command
  }
}

// ============================================================================
// Runtime Trait
// ============================================================================

#[async_trait]
pub trait Runtime: Send + Sync {
  fn name(&self) -> RuntimeName;

  /// Called before each scan of `directories`
  async fn on_directory_scan(&self, _directories: &[PathBuf]) -> Result<(), BuildError> {
    Ok(())
  }

  async fn build(&self, function: &FunctionDescriptor) -> Result<BuildResult, BuildError>;

  /// Command that runs `entry` speaking `protocol`
  fn launcher(&self, function: &FunctionDescriptor, entry: &Path, protocol: Protocol) -> Result<Launcher, InvokeError>;
}

/// Runtimes available to the registry, keyed by name
#[derive(Clone, Default)]
pub struct Runtimes {
  entries: HashMap<RuntimeName, Arc<dyn Runtime>>,
}

impl Runtimes {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, runtime: Arc<dyn Runtime>) -> Self {
    self.entries.insert(runtime.name(), runtime);
    self
  }

  pub fn get(&self, name: RuntimeName) -> Option<Arc<dyn Runtime>> {
    self.entries.get(&name).cloned()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Runtime>> {
    self.entries.values()
  }
}

impl std::fmt::Debug for Runtimes {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut names: Vec<&str> = self.entries.keys().map(|name| name.as_str()).collect();
    names.sort_unstable();
    f.debug_struct("Runtimes").field("entries", &names).finish()
  }
}
