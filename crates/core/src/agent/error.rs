use relay_model::ErrorKind;

use crate::model_client::ModelClientError;

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The model request failed.
    #[error("model request failed: {0}")]
    Model(#[from] ModelClientError),
    /// The model kept requesting tools until the iteration budget ran out.
    #[error("no final answer after {max_iterations} iterations")]
    IterationBudgetExceeded {
        /// The configured budget.
        max_iterations: usize,
    },
    /// The model stopped for tool use without requesting any tool.
    #[error("model requested tools but sent no tool call")]
    MissingToolCalls,
    /// The model ended its turn, or was cut off, without any text.
    #[error("model returned an empty answer")]
    EmptyResponse,
}

impl AgentError {
    /// Returns the provider's error kind if the model request failed.
    #[inline]
    pub fn model_error_kind(&self) -> Option<ErrorKind> {
        match self {
            AgentError::Model(err) => err.kind(),
            _ => None,
        }
    }
}
