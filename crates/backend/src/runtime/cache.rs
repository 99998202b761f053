//! Per-path cache of parsed function sources.
//!
//! Builders consult the cache instead of re-reading a main file on every build.
//! The file watcher purges an entry for each raw filesystem event, before
//! debouncing, so the next build always parses fresh content.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use dashmap::DashMap;
use tracing::trace;

use super::builder::metadata::FunctionMetadata;

#[derive(Debug, Default)]
pub struct ModuleCache {
  entries: DashMap<PathBuf, Arc<FunctionMetadata>>,
}

impl ModuleCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, path: &Path) -> Option<Arc<FunctionMetadata>> {
    self.entries.get(path).map(|entry| entry.value().clone())
  }

  pub fn insert(&self, path: PathBuf, metadata: Arc<FunctionMetadata>) {
    self.entries.insert(path, metadata);
  }

  /// Drop the entry for `path` and for anything cached below it
  pub fn purge(&self, path: &Path) {
    if self.entries.remove(path).is_some() {
      trace!(path = %path.display(), "Purged cached module");
    }
    self.entries.retain(|cached, _| !cached.starts_with(path));
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
