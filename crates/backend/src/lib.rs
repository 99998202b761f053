mod actor;
mod invoke;
mod runtime;

mod domain;
pub use domain::{config, function};

pub mod dirs;

pub use actor::{FunctionsRegistry, RegistryError, RegistryOptions, ScanSummary};
pub use invoke::{InvocationRequest, InvocationResult, InvokeError, LambdaResponse, Protocol, worker::StreamBody};
