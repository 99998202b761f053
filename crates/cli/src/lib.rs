//! lambdev CLI library - request synthesis shared by the commands

pub mod payload;

pub use payload::{EventOptions, build_invocation};
