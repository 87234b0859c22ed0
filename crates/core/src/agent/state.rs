/// Where the agent loop currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoopState {
    /// No run has started since creation or the last reset.
    #[default]
    Idle,
    /// Waiting for the model to respond.
    AwaitingModel,
    /// Waiting for a batch of tool calls to finish.
    AwaitingTools,
    /// The last run produced an answer.
    Done,
    /// The last run failed.
    Failed,
}

impl LoopState {
    /// Returns `true` if a run is in progress, or was cancelled while in
    /// progress.
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, LoopState::AwaitingModel | LoopState::AwaitingTools)
    }
}
