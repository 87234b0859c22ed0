//! Core logic of the tool-augmented conversation loop: the tool contract
//! and registry, the per-run context, history compaction and the agent
//! loop itself.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod context;
pub mod history;
mod model_client;
pub mod tool;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, AgentError, LoopState, RunStream,
    StreamEvent,
};
pub use context::{ContextError, RunContext};
pub use history::{HistoryConfig, HistoryManager};
pub use model_client::{ModelClient, ModelClientError, ModelClientResponse};
pub use tool::{
    BlockingTool, ExecuteResult, Tool, ToolOutput, ToolRegistry, ToolResult,
};
