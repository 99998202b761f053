//! Domain types - core entities
//!
//! Canonical types shared by discovery, builds, the registry and invocation.
//! They carry no I/O of their own.

pub mod config;
pub mod function;
