//! Message types for actor communication

use std::{path::PathBuf, sync::Arc};

use tokio::sync::oneshot;

use crate::{domain::function::BuildData, runtime::builder::BuildError};

/// Why a build was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildReason {
  /// First build after registration
  Initial,
  /// Watched sources changed
  SourceChanged(Vec<PathBuf>),
  /// Explicit request from a caller
  Requested,
}

impl BuildReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      BuildReason::Initial => "initial",
      BuildReason::SourceChanged(_) => "source_changed",
      BuildReason::Requested => "requested",
    }
  }
}

/// Result delivered to every caller coalesced into one build
pub type BuildOutcome = Result<Arc<BuildData>, BuildError>;

/// Jobs accepted by a BuildActor
#[derive(Debug)]
pub enum BuildJob {
  Build {
    reason: BuildReason,
    /// Receives the outcome of the build this job ends up in
    reply: Option<oneshot::Sender<BuildOutcome>>,
  },
  Shutdown,
}
