//! Actor-based concurrency for the function registry
//!
//! Instead of locking shared build state, every registered function is owned
//! by a long-lived task that serializes its builds and keeps its sources
//! watched. Callers talk to it through a cheap, cloneable handle.
//!
//! # Actors
//!
//! - [`FunctionsRegistry`]: catalog of functions, scans directories and spawns one actor per function
//! - [`BuildActor`](builder::BuildActor): builds one function, coalescing queued requests into a single build
//! - [`watcher`]: debounced file watches feeding rebuilds and rescans
//!
//! # Flow
//!
//! ```text
//! scan ─→ discovery ─→ register ─→ BuildActor ─→ Runtime::build
//!                                      ↑               │
//!                     watch callback ──┘   watch(src ∪ included)
//! ```

pub mod builder;
pub mod handle;
pub mod message;
pub mod registry;
pub mod watcher;

#[cfg(test)]
mod __tests__;

pub use registry::{FunctionsRegistry, RegistryError, RegistryOptions, ScanSummary};
