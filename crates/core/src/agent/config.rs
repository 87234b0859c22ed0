use serde::{Deserialize, Serialize};

use crate::history::HistoryConfig;

/// Settings of an [`Agent`](super::Agent).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound of model calls per run.
    pub max_iterations: usize,
    /// System instructions sent with every request.
    pub system_prompt: Option<String>,
    /// Whether to append the run context summary to tool results.
    pub context_summary: bool,
    /// History budget and compaction settings.
    pub history: HistoryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            system_prompt: None,
            context_summary: true,
            history: HistoryConfig::default(),
        }
    }
}
