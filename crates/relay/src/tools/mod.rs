//! A set of built-in tools that models can use.

mod calculator;
mod write_file;

pub use calculator::CalculatorTool;
pub use write_file::{LAST_WRITTEN_FILE, WriteFileTool};

/// Names of the built-in tools, in registration order.
pub const BUILTIN_TOOLS: &[&str] = &["calculator", "write_file"];
