//! BuildActor - serializes builds of one function and keeps its sources watched
//!
//! Each registered function owns one BuildActor. Builds run one at a time:
//! jobs arriving while a build runs wait in the mailbox and are drained into
//! the next single build, whose outcome is sent to every waiting caller.
//!
//! After a successful build the actor makes sure the function's watch covers
//! `src_files ∪ included_files`. The watch is only replaced when the source set
//! changed, or when none is installed yet. A build that fails before any
//! watch exists watches the function's own file or folder instead.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
  handle::BuildHandle,
  message::{BuildJob, BuildOutcome, BuildReason},
  watcher::{WatchCallback, WatchFactory, WatchHandle, WatchOptions, prune_covered},
};
use crate::{
  domain::function::{FunctionDescriptor, SrcFilesDiff, dedup_ordered},
  runtime::Runtime,
};

/// Mailbox capacity. A full mailbox already holds a pending build.
const MAILBOX_SIZE: usize = 16;

pub struct BuildActor {
  function: Arc<FunctionDescriptor>,
  runtime: Arc<dyn Runtime>,
  /// `None` disables live reload
  watch_factory: Option<Arc<dyn WatchFactory>>,
  /// Template for the function's watch, without callbacks
  watch_options: WatchOptions,
  handle: BuildHandle,
  rx: mpsc::Receiver<BuildJob>,
  cancel: CancellationToken,
  watch: Option<WatchHandle>,
  src_files: Vec<PathBuf>,
}

impl BuildActor {
  /// Spawn the actor and return its handle
  pub fn spawn(
    function: Arc<FunctionDescriptor>,
    runtime: Arc<dyn Runtime>,
    watch_factory: Option<Arc<dyn WatchFactory>>,
    watch_options: WatchOptions,
    cancel: CancellationToken,
  ) -> BuildHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
    let handle = BuildHandle::new(&function.name, tx);

    let actor = Self {
      function,
      runtime,
      watch_factory,
      watch_options,
      handle: handle.clone(),
      rx,
      cancel,
      watch: None,
      src_files: Vec::new(),
    };
    tokio::spawn(actor.run());

    handle
  }

  async fn run(mut self) {
    debug!(function = %self.function.name, "BuildActor started");
    let cancel = self.cancel.clone();

    loop {
      let job = tokio::select! {
        biased;

        _ = cancel.cancelled() => break,

        job = self.rx.recv() => job,
      };

      let (reason, reply) = match job {
        Some(BuildJob::Build { reason, reply }) => (reason, reply),
        Some(BuildJob::Shutdown) | None => break,
      };

      let mut replies: Vec<oneshot::Sender<BuildOutcome>> = reply.into_iter().collect();
      let mut reasons = vec![reason];
      let mut shutdown = false;

      // Drain everything already queued into this build
      while let Ok(job) = self.rx.try_recv() {
        match job {
          BuildJob::Build { reason, reply } => {
            reasons.push(reason);
            replies.extend(reply);
          }
          BuildJob::Shutdown => {
            shutdown = true;
            break;
          }
        }
      }

      if reasons.len() > 1 {
        trace!(function = %self.function.name, coalesced = reasons.len(), "Coalesced build requests");
      }

      let outcome = tokio::select! {
        biased;

        _ = cancel.cancelled() => break,

        outcome = self.build(&reasons) => outcome,
      };

      for reply in replies {
        let _ = reply.send(outcome.clone());
      }

      if shutdown {
        break;
      }
    }

    debug!(function = %self.function.name, "BuildActor stopped");
  }

  async fn build(&mut self, reasons: &[BuildReason]) -> BuildOutcome {
    let reason = reasons.first().map(BuildReason::as_str).unwrap_or("requested");
    info!(function = %self.function.name, reason, runtime = %self.runtime.name(), "Building function");

    let result = match self.runtime.build(&self.function).await {
      Ok(result) => result,
      Err(e) => {
        warn!(function = %self.function.name, error = %e, "Build failed");
        self.function.set_build_error(e.to_string());
        // Without a source set yet, watch the function itself so a fix rebuilds it
        if self.watch.is_none() {
          let own_source = if self.function.has_own_directory() {
            self.function.function_directory().to_path_buf()
          } else {
            self.function.main_file.clone()
          };
          self.install_watch(vec![own_source], &SrcFilesDiff::default()).await;
        }
        return Err(e);
      }
    };

    let diff = SrcFilesDiff::between(&self.src_files, &result.src_files);
    let watch_set = prune_covered(dedup_ordered(
      result
        .src_files
        .iter()
        .chain(result.included_files.iter())
        .cloned()
        .collect(),
    ));

    self.src_files = result.src_files.clone();
    let data = self.function.set_build_data(result);

    if self.watch.is_none() || !diff.is_empty() {
      self.install_watch(watch_set, &diff).await;
    }

    Ok(data)
  }

  async fn install_watch(&mut self, targets: Vec<PathBuf>, diff: &SrcFilesDiff) {
    let Some(factory) = self.watch_factory.clone() else {
      return;
    };

    // Replace, never stack, watches
    self.watch = None;
    if targets.is_empty() {
      return;
    }

    let handle = self.handle.clone();
    let function = self.function.clone();
    let on_change: WatchCallback = Arc::new(move |paths: Vec<PathBuf>| {
      debug!(function = %function.name, changed = paths.len(), "Sources changed, rebuilding");
      function.mark_stale();
      if !handle.trigger(BuildReason::SourceChanged(paths)) {
        trace!(function = %function.name, "Rebuild already queued");
      }
    });

    let options = WatchOptions {
      on_add: Some(on_change.clone()),
      on_change: Some(on_change),
      on_unlink: None,
      ..self.watch_options.clone()
    };

    debug!(
      function = %self.function.name,
      targets = targets.len(),
      added = diff.added.len(),
      deleted = diff.deleted.len(),
      "Watching function sources"
    );

    match factory.watch(targets, options).await {
      Ok(watch) => self.watch = Some(watch),
      Err(e) => warn!(function = %self.function.name, error = %e, "Live reload disabled for function"),
    }
  }
}
