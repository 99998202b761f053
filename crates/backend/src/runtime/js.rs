//! Managed-script runtime.
//!
//! Builds go through the strategy chain in [`super::builder`]. Processes run
//! under small launch shims: the direct shim answers one v1 event over
//! stdin/stdout, the worker shim handles a v2 request and may stream its body.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
use tracing::info;

use super::{
  Launcher, Runtime,
  builder::{BuildError, BuildInput, StrategySelections, legacy::LegacyBuilderCache, metadata::PackagingTool},
};
use crate::{
  domain::{
    config::JsRuntimeConfig,
    function::{BuildResult, FunctionDescriptor, RuntimeName},
  },
  invoke::{InvokeError, Protocol},
};

const DIRECT_SHIM: &str = include_str!("../../shims/direct.mjs");
const WORKER_SHIM: &str = include_str!("../../shims/worker.mjs");

pub struct JsRuntime {
  project_root: PathBuf,
  config: JsRuntimeConfig,
  legacy: LegacyBuilderCache,
  packaging: Arc<dyn PackagingTool>,
  selections: StrategySelections,
}

impl JsRuntime {
  pub fn new(
    project_root: PathBuf,
    config: JsRuntimeConfig,
    legacy: LegacyBuilderCache,
    packaging: Arc<dyn PackagingTool>,
  ) -> Self {
    Self {
      project_root,
      config,
      legacy,
      packaging,
      selections: StrategySelections::new(),
    }
  }

  fn shim_launcher(&self, shim: &str) -> Launcher {
    Launcher::new(self.config.node.clone())
      .arg("--input-type=module")
      .arg("-e")
      .arg(shim)
  }
}

#[async_trait]
impl Runtime for JsRuntime {
  fn name(&self) -> RuntimeName {
    RuntimeName::Js
  }

  /// Start a new selection cycle and run the project-wide legacy build so its
  /// output exists before discovery
  async fn on_directory_scan(&self, _directories: &[PathBuf]) -> Result<(), BuildError> {
    self.selections.clear();
    if let Some(builder) = self.legacy.detect().await {
      info!(script = %builder.script, "Building functions with the legacy builder");
      builder.build().await?;
    }
    Ok(())
  }

  async fn build(&self, function: &FunctionDescriptor) -> Result<BuildResult, BuildError> {
    let input = BuildInput::new(
      function,
      self.project_root.clone(),
      self.legacy.clone(),
      self.packaging.clone(),
    );
    let builder = self.selections.select(&input).await?;
    builder.build(&input).await
  }

  fn launcher(&self, _function: &FunctionDescriptor, entry: &Path, protocol: Protocol) -> Result<Launcher, InvokeError> {
    let (configured, shim) = match protocol {
      Protocol::V1 => (self.config.direct_command.as_deref(), DIRECT_SHIM),
      Protocol::V2 => (self.config.worker_command.as_deref(), WORKER_SHIM),
    };

    match configured {
      Some(command) => Launcher::from_template(command, entry)
        .ok_or_else(|| InvokeError::Launcher(format!("empty {} command for js runtime", protocol.as_str()))),
      None => Ok(self.shim_launcher(shim)),
    }
  }
}
