//! Actor handles for communicating with actors
//!
//! Handles are cheap to clone and provide a way to send messages to actors.
//! They encapsulate the channel sender and provide convenient methods for
//! request/response patterns.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::message::{BuildJob, BuildReason};
use crate::{domain::function::BuildData, runtime::builder::BuildError};

// ============================================================================
// Build Handle
// ============================================================================

/// Handle to communicate with a BuildActor
#[derive(Clone, Debug)]
pub struct BuildHandle {
  name: Arc<str>,
  tx: mpsc::Sender<BuildJob>,
}

impl BuildHandle {
  /// Create a new handle from a sender
  pub fn new(name: &str, tx: mpsc::Sender<BuildJob>) -> Self {
    Self { name: name.into(), tx }
  }

  /// Send a job to the actor
  pub async fn send(&self, job: BuildJob) -> Result<(), SendError> {
    self.tx.send(job).await.map_err(|_| SendError::ActorGone)
  }

  /// Request a build and wait for the build it gets coalesced into
  pub async fn build(&self, reason: BuildReason) -> Result<Arc<BuildData>, BuildError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .send(BuildJob::Build {
        reason,
        reply: Some(reply_tx),
      })
      .await
      .map_err(|_| BuildError::ActorGone(self.name.to_string()))?;

    reply_rx
      .await
      .map_err(|_| BuildError::ActorGone(self.name.to_string()))?
  }

  /// Queue a build without waiting, from sync contexts such as watch callbacks
  ///
  /// Returns false when the mailbox is full, in which case a queued build
  /// already covers this request.
  pub fn trigger(&self, reason: BuildReason) -> bool {
    self.tx.try_send(BuildJob::Build { reason, reply: None }).is_ok()
  }

  /// Request the actor to shutdown
  pub async fn shutdown(&self) -> Result<(), SendError> {
    self.send(BuildJob::Shutdown).await
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Error when sending to an actor
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Actor has shut down")]
  ActorGone,
}
