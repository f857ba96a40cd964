//! Command-line interface.
//!
//! The command tree lives in `commands`; `output` renders engine results as
//! tables or JSON.

mod commands;
mod output;

pub use commands::{Cli, Commands, CreateFlags, FilterArgs, LogFormat, OutputFormat};
pub use output::OutputFormatter;
