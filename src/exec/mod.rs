//! Named external command tasks: rendering, execution and per-command
//! serialization.

pub mod dispatcher;
pub mod error;
pub mod runner;
pub mod template;
pub mod values;

pub use dispatcher::{ExecDispatcher, ExecResult, ExecTaskConfig};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use values::{FormValues, JsonValues, TemplateValues};
