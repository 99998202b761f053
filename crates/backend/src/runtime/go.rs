//! Compiled-binary runtime.
//!
//! A function is compiled with the configured toolchain into the project cache
//! and the binary is launched directly. Binaries speak the direct protocol:
//! event JSON on stdin, one result envelope line on stdout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Launcher, Runtime, builder::BuildError};
use crate::{
  domain::{
    config::GoRuntimeConfig,
    function::{BuildResult, FunctionDescriptor, RuntimeName},
  },
  invoke::{InvokeError, Protocol},
};

pub struct GoRuntime {
  config: GoRuntimeConfig,
  /// Binaries are written to `<cache_dir>/functions/<name>`
  cache_dir: PathBuf,
}

impl GoRuntime {
  pub fn new(config: GoRuntimeConfig, cache_dir: PathBuf) -> Self {
    Self { config, cache_dir }
  }

  pub fn binary_path(&self, name: &str) -> PathBuf {
    self.cache_dir.join("functions").join(name)
  }
}

#[async_trait]
impl Runtime for GoRuntime {
  fn name(&self) -> RuntimeName {
    RuntimeName::Go
  }

  async fn build(&self, function: &FunctionDescriptor) -> Result<BuildResult, BuildError> {
    let binary = self.binary_path(&function.name);
    if let Some(parent) = binary.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| BuildError::read(parent, e))?;
    }

    // Folder layouts build the whole package, flat files build just themselves
    let (src, target) = if function.has_own_directory() {
      (function.function_directory().to_path_buf(), ".".to_string())
    } else {
      (function.main_file.clone(), function.main_file.to_string_lossy().into_owned())
    };

    debug!(function = %function.name, binary = %binary.display(), "Compiling function");

    let output = Command::new(&self.config.toolchain)
      .arg("build")
      .arg("-o")
      .arg(&binary)
      .arg(&target)
      .current_dir(function.function_directory())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| BuildError::spawn(&self.config.toolchain, e))?;

    if !output.status.success() {
      return Err(BuildError::CommandFailed {
        program: format!("{} build", self.config.toolchain),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    Ok(BuildResult {
      build_path: Some(binary),
      ..BuildResult::from_src_files(vec![src])
    })
  }

  fn launcher(&self, _function: &FunctionDescriptor, entry: &Path, _protocol: Protocol) -> Result<Launcher, InvokeError> {
    Ok(Launcher::new(entry.to_string_lossy()))
  }
}
