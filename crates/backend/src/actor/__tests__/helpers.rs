//! Test helpers for actor tests.
//!
//! Provides `TestProject` for laying out function sources in a temp dir,
//! a `StubRuntime` with scripted build results, and a `RecordingWatchFactory`
//! that records watch installations instead of touching the filesystem.

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use filetime::FileTime;
use tempfile::TempDir;

use crate::{
  actor::watcher::{WatchFactory, WatchHandle, WatchOptions, WatcherError},
  domain::{
    config::{FunctionConfig, TimeoutsConfig},
    function::{BuildResult, FunctionDescriptor, RuntimeName},
  },
  invoke::{InvokeError, Protocol},
  runtime::{Launcher, Runtime, builder::BuildError},
};

// ============================================================================
// Project layout
// ============================================================================

/// Temporary project with a `functions/` directory.
pub struct TestProject {
  pub dir: TempDir,
}

impl TestProject {
  pub fn new() -> Self {
    let dir = TempDir::new().expect("create project temp dir");
    std::fs::create_dir_all(dir.path().join("functions")).expect("create functions dir");
    Self { dir }
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }

  pub fn functions_dir(&self) -> PathBuf {
    self.dir.path().join("functions")
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.dir.path().join(relative)
  }

  /// Write a file relative to the project root, creating parents.
  pub fn write(&self, relative: &str, content: &str) -> PathBuf {
    let full_path = self.path(relative);
    if let Some(parent) = full_path.parent() {
      std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&full_path, content).expect("write file");
    full_path
  }

  pub fn remove(&self, relative: &str) {
    let _ = std::fs::remove_file(self.path(relative));
  }

  /// Update file mtime without changing content.
  pub fn touch(&self, relative: &str) {
    filetime::set_file_mtime(self.path(relative), FileTime::now()).expect("set mtime");
  }

  /// Descriptor for a flat JS function in `functions/`
  pub fn descriptor(&self, name: &str) -> Arc<FunctionDescriptor> {
    Arc::new(FunctionDescriptor::new(
      name,
      self.functions_dir().join(format!("{name}.js")),
      self.functions_dir(),
      RuntimeName::Js,
      FunctionConfig::default(),
      &TimeoutsConfig::default(),
    ))
  }
}

// ============================================================================
// Stub runtime
// ============================================================================

/// Runtime whose build result is set by the test.
pub struct StubRuntime {
  result: Mutex<Result<BuildResult, BuildError>>,
  delay: Duration,
  builds: AtomicUsize,
}

impl StubRuntime {
  pub fn new(result: BuildResult) -> Arc<Self> {
    Self::with_delay(result, Duration::ZERO)
  }

  pub fn with_delay(result: BuildResult, delay: Duration) -> Arc<Self> {
    Arc::new(Self {
      result: Mutex::new(Ok(result)),
      delay,
      builds: AtomicUsize::new(0),
    })
  }

  pub fn set_result(&self, result: Result<BuildResult, BuildError>) {
    *self.result.lock().expect("lock stub result") = result;
  }

  pub fn builds(&self) -> usize {
    self.builds.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Runtime for StubRuntime {
  fn name(&self) -> RuntimeName {
    RuntimeName::Js
  }

  async fn build(&self, _function: &FunctionDescriptor) -> Result<BuildResult, BuildError> {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.builds.fetch_add(1, Ordering::SeqCst);
    self.result.lock().expect("lock stub result").clone()
  }

  fn launcher(&self, _function: &FunctionDescriptor, entry: &Path, _protocol: Protocol) -> Result<Launcher, InvokeError> {
    Ok(Launcher::new("sh").arg(entry.to_string_lossy()))
  }
}

// ============================================================================
// Recording watch factory
// ============================================================================

/// One recorded call to [`WatchFactory::watch`]
#[derive(Clone)]
pub struct WatchCall {
  pub targets: Vec<PathBuf>,
  pub options: WatchOptions,
}

/// Records every watch request and returns an inert handle.
#[derive(Default)]
pub struct RecordingWatchFactory {
  calls: Mutex<Vec<WatchCall>>,
}

impl RecordingWatchFactory {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn calls(&self) -> Vec<WatchCall> {
    self.calls.lock().expect("lock watch calls").clone()
  }

  /// Calls whose targets include `path`
  pub fn calls_for(&self, path: &Path) -> Vec<WatchCall> {
    self
      .calls()
      .into_iter()
      .filter(|call| call.targets.iter().any(|t| t == path))
      .collect()
  }
}

#[async_trait]
impl WatchFactory for RecordingWatchFactory {
  async fn watch(&self, targets: Vec<PathBuf>, options: WatchOptions) -> Result<WatchHandle, WatcherError> {
    self.calls.lock().expect("lock watch calls").push(WatchCall {
      targets,
      options,
    });
    Ok(WatchHandle::noop())
  }
}

// ============================================================================
// Waiting
// ============================================================================

/// Wait for a condition to become true, with timeout.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> bool,
{
  let start = std::time::Instant::now();
  let poll_interval = Duration::from_millis(20);

  while start.elapsed() < timeout {
    if check() {
      return true;
    }
    tokio::time::sleep(poll_interval).await;
  }

  check()
}
