//! Debounced file watching for build sources and functions directories.
//!
//! # Design
//!
//! The watcher bridges the sync notify callbacks with the async side:
//! 1. notify's sync callback uses `blocking_send` to forward events to a channel
//! 2. An async task consumes events from that channel
//! 3. Each raw event purges the module cache for its paths, then is mapped to
//!    an add, change or unlink of the paths the caller asked about
//! 4. Each kind has its own batch. A batch flushes once no event of that kind
//!    arrived for the debounce window, as one callback with deduplicated paths
//!
//! # Targets
//!
//! - a file: its parent is watched non-recursively, events filtered to the file
//! - a directory: watched up to `depth` levels below it (`None` is unlimited)
//! - a glob (`include/*`): its literal base directory is watched and events are
//!   filtered through the pattern
//!
//! `node_modules/` and `.git/` are always ignored, along with any caller
//! gitignore-style patterns.
//!
//! # Lifecycle
//!
//! [`watch`] returns once every watch is registered. The task runs until the
//! [`WatchHandle`] is dropped or closed.

use std::{
  collections::BTreeMap,
  path::{Component, Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use async_trait::async_trait;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{
  Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
  event::{CreateKind, ModifyKind, RenameMode},
};
use tokio::{
  sync::mpsc,
  time::{Instant, sleep_until},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::runtime::cache::ModuleCache;

/// Patterns ignored by every watch
const DEFAULT_IGNORED: &[&str] = &["node_modules/", ".git/"];

/// Callback receiving one debounced batch of paths
pub type WatchCallback = Arc<dyn Fn(Vec<PathBuf>) + Send + Sync>;

// ============================================================================
// Options / Errors
// ============================================================================

#[derive(Clone)]
pub struct WatchOptions {
  pub on_add: Option<WatchCallback>,
  pub on_change: Option<WatchCallback>,
  pub on_unlink: Option<WatchCallback>,
  /// Extra gitignore-style patterns
  pub ignored: Vec<String>,
  /// Levels below a directory target to watch
  pub depth: Option<usize>,
  pub debounce: Duration,
  pub poll_interval: Duration,
  /// Cache purged for every raw event path
  pub cache: Option<Arc<ModuleCache>>,
}

impl Default for WatchOptions {
  fn default() -> Self {
    Self {
      on_add: None,
      on_change: None,
      on_unlink: None,
      ignored: Vec::new(),
      depth: None,
      debounce: Duration::from_millis(100),
      poll_interval: Duration::from_secs(2),
      cache: None,
    }
  }
}

impl std::fmt::Debug for WatchOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WatchOptions")
      .field("on_add", &self.on_add.is_some())
      .field("on_change", &self.on_change.is_some())
      .field("on_unlink", &self.on_unlink.is_some())
      .field("ignored", &self.ignored)
      .field("depth", &self.depth)
      .field("debounce", &self.debounce)
      .finish()
  }
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch {path}: {source}")]
  Watch {
    path: PathBuf,
    #[source]
    source: notify::Error,
  },

  #[error("Failed to build ignore patterns: {0}")]
  Gitignore(#[source] ignore::Error),

  #[error("Invalid watch pattern '{0}'")]
  Pattern(String),
}

// ============================================================================
// Handle / Factory
// ============================================================================

/// A running watch. Dropping it stops the watch.
#[derive(Debug)]
pub struct WatchHandle {
  _guard: Option<DropGuard>,
}

impl WatchHandle {
  /// Handle that watches nothing, for factories that only record calls
  #[cfg(test)]
  pub fn noop() -> Self {
    Self { _guard: None }
  }

  /// Stop the watch now rather than when the handle goes out of scope
  pub fn close(self) {}
}

/// Creates watches. Swappable so callers can observe watch installation.
#[async_trait]
pub trait WatchFactory: Send + Sync {
  async fn watch(&self, targets: Vec<PathBuf>, options: WatchOptions) -> Result<WatchHandle, WatcherError>;
}

/// Watches the real filesystem through notify
#[derive(Debug, Default, Clone)]
pub struct FileWatcher;

#[async_trait]
impl WatchFactory for FileWatcher {
  async fn watch(&self, targets: Vec<PathBuf>, options: WatchOptions) -> Result<WatchHandle, WatcherError> {
    watch(targets, options).await
  }
}

// ============================================================================
// Targets
// ============================================================================

#[derive(Debug)]
enum Filter {
  Exact(PathBuf),
  Tree { root: PathBuf, depth: Option<usize> },
  Glob(glob::Pattern),
}

#[derive(Debug)]
struct Target {
  /// Directory registered with notify
  base: PathBuf,
  mode: RecursiveMode,
  filter: Filter,
  ignore: Gitignore,
}

fn is_glob(component: &str) -> bool {
  component.contains(['*', '?', '[', '{'])
}

/// Closest existing directory at or above `path`
fn existing_ancestor(path: &Path) -> PathBuf {
  path
    .ancestors()
    .find(|p| p.is_dir())
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("/"))
}

impl Target {
  fn new(path: &Path, options: &WatchOptions) -> Result<Self, WatcherError> {
    let raw = path.to_string_lossy();

    let (base, mode, filter) = if path
      .components()
      .any(|c| matches!(c, Component::Normal(s) if is_glob(&s.to_string_lossy())))
    {
      let literal: PathBuf = path
        .components()
        .take_while(|c| !matches!(c, Component::Normal(s) if is_glob(&s.to_string_lossy())))
        .collect();
      let pattern = glob::Pattern::new(&raw).map_err(|_| WatcherError::Pattern(raw.to_string()))?;
      (existing_ancestor(&literal), RecursiveMode::Recursive, Filter::Glob(pattern))
    } else if path.is_dir() {
      let mode = if options.depth == Some(0) {
        RecursiveMode::NonRecursive
      } else {
        RecursiveMode::Recursive
      };
      let filter = Filter::Tree {
        root: path.to_path_buf(),
        depth: options.depth,
      };
      (path.to_path_buf(), mode, filter)
    } else {
      let parent = path.parent().unwrap_or(path);
      let (base, mode) = if parent.is_dir() {
        (parent.to_path_buf(), RecursiveMode::NonRecursive)
      } else {
        (existing_ancestor(parent), RecursiveMode::Recursive)
      };
      (base, mode, Filter::Exact(path.to_path_buf()))
    };

    let ignore = build_gitignore(&base, &options.ignored)?;
    Ok(Self {
      base,
      mode,
      filter,
      ignore,
    })
  }

  fn matches(&self, path: &Path) -> bool {
    let selected = match &self.filter {
      Filter::Exact(target) => path == target,
      Filter::Glob(pattern) => pattern.matches_path(path),
      Filter::Tree { root, depth } => match path.strip_prefix(root) {
        Ok(relative) => depth.is_none_or(|d| relative.components().count() <= d + 1),
        Err(_) => false,
      },
    };
    selected && !self.is_ignored(path)
  }

  fn is_ignored(&self, path: &Path) -> bool {
    path.starts_with(&self.base)
      && path != self.base
      && self
        .ignore
        .matched_path_or_any_parents(path, path.is_dir())
        .is_ignore()
  }
}

fn build_gitignore(root: &Path, extra: &[String]) -> Result<Gitignore, WatcherError> {
  let mut builder = GitignoreBuilder::new(root);
  for pattern in DEFAULT_IGNORED.iter().copied().chain(extra.iter().map(String::as_str)) {
    builder
      .add_line(None, pattern)
      .map_err(WatcherError::Gitignore)?;
  }
  builder.build().map_err(WatcherError::Gitignore)
}

// ============================================================================
// Batching
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ChangeKind {
  Add,
  Change,
  Unlink,
}

/// Paths of one kind waiting for the debounce window to pass
#[derive(Debug, Default)]
struct Batch {
  paths: Vec<PathBuf>,
  deadline: Option<Instant>,
}

impl Batch {
  fn push(&mut self, path: PathBuf, debounce: Duration) {
    if !self.paths.contains(&path) {
      self.paths.push(path);
    }
    self.deadline = Some(Instant::now() + debounce);
  }

  fn touch(&mut self, debounce: Duration) {
    self.deadline = Some(Instant::now() + debounce);
  }

  fn is_due(&self, now: Instant) -> bool {
    self.deadline.is_some_and(|deadline| deadline <= now)
  }

  fn take(&mut self) -> Vec<PathBuf> {
    self.deadline = None;
    std::mem::take(&mut self.paths)
  }
}

struct WatchTask {
  targets: Vec<Target>,
  options: WatchOptions,
  batches: BTreeMap<ChangeKind, Batch>,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
  cancel: CancellationToken,
  // Keeps notify alive for as long as the task runs
  _watcher: RecommendedWatcher,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

impl WatchTask {
  async fn run(mut self) {
    loop {
      let next_deadline = self.batches.values().filter_map(|b| b.deadline).min();

      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          trace!("Watch closed");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.process_event(event),
            Some(Err(e)) => warn!(error = %e, "Watcher error"),
            None => break,
          }
        }

        _ = sleep_until_deadline(next_deadline) => {
          self.flush_due();
        }
      }
    }
  }

  fn is_relevant(&self, path: &Path) -> bool {
    self.targets.iter().any(|target| target.matches(path))
  }

  fn queue(&mut self, kind: ChangeKind, path: &Path) {
    if !self.is_relevant(path) {
      return;
    }
    let debounce = self.options.debounce;

    // A change to a path still waiting as an add stays an add
    if kind == ChangeKind::Change
      && let Some(add) = self.batches.get_mut(&ChangeKind::Add)
      && add.paths.iter().any(|p| p == path)
    {
      add.touch(debounce);
      return;
    }

    trace!(?kind, path = %path.display(), "Queued watch event");
    self.batches.entry(kind).or_default().push(path.to_path_buf(), debounce);
  }

  fn process_event(&mut self, event: Event) {
    if let Some(cache) = &self.options.cache {
      for path in &event.paths {
        cache.purge(path);
      }
    }

    match event.kind {
      EventKind::Create(CreateKind::Folder) => {}
      EventKind::Create(_) => {
        for path in &event.paths {
          if !path.is_dir() {
            self.queue(ChangeKind::Add, path);
          }
        }
      }
      EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
        self.queue(ChangeKind::Unlink, &event.paths[0]);
        self.queue(ChangeKind::Add, &event.paths[1]);
      }
      EventKind::Modify(ModifyKind::Name(mode)) => {
        for path in &event.paths {
          let kind = match mode {
            RenameMode::From => ChangeKind::Unlink,
            RenameMode::To => ChangeKind::Add,
            _ if path.exists() => ChangeKind::Add,
            _ => ChangeKind::Unlink,
          };
          self.queue(kind, path);
        }
      }
      EventKind::Modify(_) => {
        for path in &event.paths {
          if !path.is_dir() {
            self.queue(ChangeKind::Change, path);
          }
        }
      }
      EventKind::Remove(_) => {
        for path in &event.paths {
          self.queue(ChangeKind::Unlink, path);
        }
      }
      EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
  }

  /// Deliver every batch whose window has passed, adds before changes before unlinks
  fn flush_due(&mut self) {
    let now = Instant::now();
    let due: Vec<(ChangeKind, Vec<PathBuf>)> = self
      .batches
      .iter_mut()
      .filter(|(_, batch)| batch.is_due(now))
      .map(|(kind, batch)| (*kind, batch.take()))
      .collect();

    for (kind, paths) in due {
      if paths.is_empty() {
        continue;
      }
      let callback = match kind {
        ChangeKind::Add => &self.options.on_add,
        ChangeKind::Change => &self.options.on_change,
        ChangeKind::Unlink => &self.options.on_unlink,
      };
      debug!(?kind, count = paths.len(), "Delivering watch events");
      if let Some(callback) = callback {
        callback(paths);
      }
    }
  }
}

/// Watch `targets`, resolving once every watch is registered
pub async fn watch(targets: Vec<PathBuf>, options: WatchOptions) -> Result<WatchHandle, WatcherError> {
  let compiled = targets
    .iter()
    .map(|path| Target::new(path, &options))
    .collect::<Result<Vec<_>, _>>()?;

  // One registration per base, recursive if any target needs it
  let mut bases: BTreeMap<PathBuf, RecursiveMode> = BTreeMap::new();
  for target in &compiled {
    let mode = bases.entry(target.base.clone()).or_insert(target.mode);
    if target.mode == RecursiveMode::Recursive {
      *mode = RecursiveMode::Recursive;
    }
  }

  let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
  let notify_config = Config::default().with_poll_interval(options.poll_interval);
  let mut watcher = RecommendedWatcher::new(
    move |res| {
      // Runs on notify's thread. A closed channel means the watch was dropped.
      let _ = event_tx.blocking_send(res);
    },
    notify_config,
  )
  .map_err(WatcherError::Init)?;

  for (base, mode) in &bases {
    watcher.watch(base, *mode).map_err(|source| WatcherError::Watch {
      path: base.clone(),
      source,
    })?;
  }

  debug!(targets = targets.len(), bases = bases.len(), "Watch ready");

  let cancel = CancellationToken::new();
  let task = WatchTask {
    targets: compiled,
    options,
    batches: BTreeMap::new(),
    event_rx,
    cancel: cancel.clone(),
    _watcher: watcher,
  };
  tokio::spawn(task.run());

  Ok(WatchHandle {
    _guard: Some(cancel.drop_guard()),
  })
}

/// Drop paths already covered by an ancestor directory in the same set
pub fn prune_covered(paths: Vec<PathBuf>) -> Vec<PathBuf> {
  let dirs: Vec<PathBuf> = paths.iter().filter(|p| p.is_dir()).cloned().collect();
  paths
    .into_iter()
    .filter(|path| !dirs.iter().any(|dir| path != dir && path.starts_with(dir)))
    .collect()
}
