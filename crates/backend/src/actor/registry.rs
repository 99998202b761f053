//! FunctionsRegistry - the catalog of discovered functions
//!
//! The registry owns one [`BuildActor`] per function and a depth-1 watch over
//! every scanned directory. Scans rebuild the catalog from scratch each time:
//! functions that disappeared (or changed runtime or main file) are dropped,
//! new ones are registered and built concurrently.
//!
//! # Concurrency
//!
//! - Scans are serialized by `scan_lock`, which also holds the known directories
//! - The `functions` map is the only shared state and is read lock-free
//! - Each function's builds are serialized by its own actor

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Weak},
};

use dashmap::DashMap;
use futures::future::{BoxFuture, join_all};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  builder::BuildActor,
  handle::BuildHandle,
  message::BuildReason,
  watcher::{FileWatcher, WatchCallback, WatchFactory, WatchHandle, WatchOptions},
};
use crate::{
  dirs,
  domain::{
    config::{Config, FunctionsConfig, TimeoutsConfig, WatcherSettings},
    function::{BuildData, FunctionDescriptor, RuntimeName},
  },
  invoke::{
    Dispatcher, InvocationRequest, InvocationResult, InvokeError,
    worker::{ProcessSpawner, WorkerSpawner},
  },
  runtime::{
    Runtimes,
    builder::{BuildError, legacy::LegacyBuilderCache, metadata::SourcePackager},
    cache::ModuleCache,
    discovery::{FunctionCandidate, list_functions_async},
    go::GoRuntime,
    js::JsRuntime,
  },
};

// ============================================================================
// Options / Errors
// ============================================================================

/// Everything a registry is assembled from
///
/// [`RegistryOptions::new`] wires the default runtimes from a project config.
/// Fields are public so callers can swap in their own collaborators.
#[derive(Clone)]
pub struct RegistryOptions {
  pub project_root: PathBuf,
  /// The only configuration discovery and builds ever see
  pub functions: FunctionsConfig,
  pub timeouts: TimeoutsConfig,
  pub watcher: WatcherSettings,
  pub runtimes: Runtimes,
  /// `None` disables every watch (no live reload, no rescans)
  pub watch_factory: Option<Arc<dyn WatchFactory>>,
  pub spawner: Arc<dyn WorkerSpawner>,
  pub cache: Arc<ModuleCache>,
}

impl RegistryOptions {
  pub fn new(project_root: PathBuf, config: &Config) -> Self {
    let cache = Arc::new(ModuleCache::new());
    let legacy = LegacyBuilderCache::new(project_root.clone(), config.legacy_builder.clone());

    let runtimes = Runtimes::new()
      .with(Arc::new(JsRuntime::new(
        project_root.clone(),
        config.runtimes.js.clone(),
        legacy,
        Arc::new(SourcePackager::new(cache.clone())),
      )))
      .with(Arc::new(GoRuntime::new(
        config.runtimes.go.clone(),
        dirs::project_cache_dir(&project_root),
      )));

    Self {
      project_root,
      functions: config.functions.clone(),
      timeouts: config.timeouts,
      watcher: config.watcher.clone(),
      runtimes,
      watch_factory: Some(Arc::new(FileWatcher)),
      spawner: Arc::new(ProcessSpawner),
      cache,
    }
  }

  /// Same options without any filesystem watching
  pub fn without_watch(mut self) -> Self {
    self.watch_factory = None;
    self
  }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("Pre-scan hook of the {runtime} runtime failed: {source}")]
  DirectoryScan {
    runtime: RuntimeName,
    #[source]
    source: BuildError,
  },

  #[error("Function not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Build(#[from] BuildError),
}

/// What one scan changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
  pub added: Vec<String>,
  pub removed: Vec<String>,
  /// Functions registered this scan whose first build failed, with the error
  pub failed: Vec<(String, String)>,
}

// ============================================================================
// Registry
// ============================================================================

struct RegisteredFunction {
  descriptor: Arc<FunctionDescriptor>,
  builder: BuildHandle,
  cancel: CancellationToken,
}

pub struct FunctionsRegistry {
  project_root: PathBuf,
  functions_config: FunctionsConfig,
  timeouts: TimeoutsConfig,
  watcher: WatcherSettings,
  runtimes: Runtimes,
  watch_factory: Option<Arc<dyn WatchFactory>>,
  cache: Arc<ModuleCache>,
  dispatcher: Dispatcher,
  functions: DashMap<String, RegisteredFunction>,
  directory_watchers: DashMap<PathBuf, WatchHandle>,
  /// Held for the length of a scan; holds every directory scanned so far
  scan_lock: Mutex<Vec<PathBuf>>,
  cancel: CancellationToken,
}

impl FunctionsRegistry {
  pub fn new(options: RegistryOptions) -> Arc<Self> {
    Arc::new(Self {
      dispatcher: Dispatcher::new(options.runtimes.clone(), options.spawner),
      project_root: options.project_root,
      functions_config: options.functions,
      timeouts: options.timeouts,
      watcher: options.watcher,
      runtimes: options.runtimes,
      watch_factory: options.watch_factory,
      cache: options.cache,
      functions: DashMap::new(),
      directory_watchers: DashMap::new(),
      scan_lock: Mutex::new(Vec::new()),
      cancel: CancellationToken::new(),
    })
  }

  pub fn project_root(&self) -> &Path {
    &self.project_root
  }

  /// The `[functions]` subsection handed to discovery and builds
  pub fn functions_config(&self) -> &FunctionsConfig {
    &self.functions_config
  }

  /// Every registered function, sorted by name
  pub fn list_functions(&self) -> Vec<Arc<FunctionDescriptor>> {
    let mut functions: Vec<Arc<FunctionDescriptor>> =
      self.functions.iter().map(|entry| entry.descriptor.clone()).collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    functions
  }

  pub fn get(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
    self.functions.get(name).map(|entry| entry.descriptor.clone())
  }

  /// Build `name` now, coalescing with any build already queued for it
  pub async fn build(&self, name: &str) -> Result<Arc<BuildData>, RegistryError> {
    let builder = self
      .functions
      .get(name)
      .map(|entry| entry.builder.clone())
      .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

    Ok(builder.build(BuildReason::Requested).await?)
  }

  pub async fn invoke(&self, name: &str, request: InvocationRequest) -> Result<InvocationResult, InvokeError> {
    let function = self.get(name).ok_or_else(|| InvokeError::NotFound(name.to_string()))?;
    self.dispatcher.invoke(&function, request).await
  }

  /// Add `directories` to the scanned set and scan everything known
  pub async fn scan(self: &Arc<Self>, directories: &[PathBuf]) -> Result<ScanSummary, RegistryError> {
    let mut known = self.scan_lock.lock().await;
    for directory in directories {
      if !known.contains(directory) {
        known.push(directory.clone());
      }
    }
    self.scan_locked(&known).await
  }

  /// Scan the directories from previous scans again
  pub async fn rescan(self: &Arc<Self>) -> Result<ScanSummary, RegistryError> {
    let known = self.scan_lock.lock().await;
    self.scan_locked(&known).await
  }

  async fn scan_locked(self: &Arc<Self>, directories: &[PathBuf]) -> Result<ScanSummary, RegistryError> {
    for directory in directories {
      if let Err(e) = tokio::fs::create_dir_all(directory).await {
        warn!(directory = %directory.display(), error = %e, "Failed to create functions directory");
      }
    }

    // Pre-scan hooks run to completion before anything is enumerated
    for runtime in self.runtimes.iter() {
      runtime
        .on_directory_scan(directories)
        .await
        .map_err(|source| RegistryError::DirectoryScan {
          runtime: runtime.name(),
          source,
        })?;
    }

    let candidates = list_functions_async(directories.to_vec(), self.functions_config.clone()).await;
    let by_name: HashMap<&str, &FunctionCandidate> = candidates.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut summary = ScanSummary::default();

    // Drop functions that disappeared or now resolve to a different file
    let stale: Vec<String> = self
      .functions
      .iter()
      .filter(|entry| {
        by_name.get(entry.key().as_str()).is_none_or(|candidate| {
          candidate.runtime != entry.descriptor.runtime || candidate.main_file != entry.descriptor.main_file
        })
      })
      .map(|entry| entry.key().clone())
      .collect();
    for name in stale {
      self.unregister(&name);
      summary.removed.push(name);
    }

    let mut registered = Vec::new();
    for candidate in candidates {
      if self.functions.contains_key(&candidate.name) {
        continue;
      }
      if let Some(entry) = self.register(candidate) {
        registered.push(entry);
      }
    }

    let builds = registered.into_iter().map(|(name, builder)| async move {
      let result = builder.build(BuildReason::Initial).await;
      (name, result)
    });
    for (name, result) in join_all(builds).await {
      match result {
        Ok(_) => info!(function = %name, "Loaded function"),
        Err(e) => {
          warn!(function = %name, error = %e, "Failed to build function");
          summary.failed.push((name.clone(), e.to_string()));
        }
      }
      summary.added.push(name);
    }

    for directory in directories {
      self.watch_directory(directory).await;
    }

    debug!(
      added = summary.added.len(),
      removed = summary.removed.len(),
      total = self.functions.len(),
      "Scan complete"
    );
    Ok(summary)
  }

  fn register(&self, candidate: FunctionCandidate) -> Option<(String, BuildHandle)> {
    let Some(runtime) = self.runtimes.get(candidate.runtime) else {
      warn!(function = %candidate.name, runtime = %candidate.runtime, "No runtime available, skipping function");
      return None;
    };

    let descriptor = Arc::new(FunctionDescriptor::new(
      candidate.name.clone(),
      candidate.main_file,
      candidate.directory,
      candidate.runtime,
      candidate.config,
      &self.timeouts,
    ));

    let cancel = self.cancel.child_token();
    let builder = BuildActor::spawn(
      descriptor.clone(),
      runtime,
      self.watch_factory.clone(),
      self.watch_options(),
      cancel.clone(),
    );

    debug!(function = %candidate.name, main_file = %descriptor.main_file.display(), "Registered function");
    self.functions.insert(
      candidate.name.clone(),
      RegisteredFunction {
        descriptor,
        builder: builder.clone(),
        cancel,
      },
    );
    Some((candidate.name, builder))
  }

  fn unregister(&self, name: &str) {
    if let Some((_, entry)) = self.functions.remove(name) {
      // Stops the actor, which drops the function's watch
      entry.cancel.cancel();
      info!(function = %name, "Removed function");
    }
  }

  fn watch_options(&self) -> WatchOptions {
    WatchOptions {
      ignored: self.watcher.ignored.clone(),
      debounce: std::time::Duration::from_millis(self.watcher.debounce_ms),
      poll_interval: std::time::Duration::from_secs(self.watcher.poll_secs),
      cache: Some(self.cache.clone()),
      ..Default::default()
    }
  }

  /// Rescan whenever entries appear in or vanish from `directory`
  async fn watch_directory(self: &Arc<Self>, directory: &Path) {
    let Some(factory) = self.watch_factory.clone() else {
      return;
    };
    if self.directory_watchers.contains_key(directory) {
      return;
    }

    let weak: Weak<Self> = Arc::downgrade(self);
    let rescan: WatchCallback = Arc::new(move |paths: Vec<PathBuf>| {
      let Some(registry) = weak.upgrade() else {
        return;
      };
      debug!(changed = paths.len(), "Functions directory changed, rescanning");
      tokio::spawn(rescan_task(registry));
    });

    let options = WatchOptions {
      on_add: Some(rescan.clone()),
      on_unlink: Some(rescan),
      depth: Some(1),
      ..self.watch_options()
    };

    match factory.watch(vec![directory.to_path_buf()], options).await {
      Ok(handle) => {
        self.directory_watchers.insert(directory.to_path_buf(), handle);
      }
      Err(e) => warn!(directory = %directory.display(), error = %e, "Failed to watch functions directory"),
    }
  }

  /// Stop every build actor and watch
  pub fn shutdown(&self) {
    self.cancel.cancel();
    self.functions.clear();
    self.directory_watchers.clear();
    info!("Functions registry shut down");
  }
}

/// Rescan as a boxed future, so a scan's future never contains itself
fn rescan_task(registry: Arc<FunctionsRegistry>) -> BoxFuture<'static, ()> {
  Box::pin(async move {
    if let Err(e) = registry.rescan().await {
      warn!(error = %e, "Rescan failed");
    }
  })
}

impl Drop for FunctionsRegistry {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
