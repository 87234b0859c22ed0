mod builder;
mod config;
mod error;
mod state;
mod stream;
#[cfg(test)]
mod tests;

use futures_util::FutureExt;
use relay_model::{ContentBlock, Message, ModelRequest, Role, StopReason};
use tokio::sync::mpsc;
use tracing::{Instrument, Span};

use crate::context::RunContext;
use crate::history::HistoryManager;
use crate::model_client::{ModelClient, ModelClientResponse};
use crate::tool::{ToolRegistry, ToolResult};
pub use builder::AgentBuilder;
pub use config::AgentConfig;
pub use error::AgentError;
pub use state::LoopState;
use stream::EventSender;
pub use stream::{RunStream, StreamEvent};

/// An agent instance, which owns a conversation history, a toolset and a
/// model client, and drives the request/respond/act cycle.
///
/// A run stages the messages of each step and commits them to the history
/// only as complete groups: the user input together with the first
/// answer or tool round, then every further tool round (assistant turn
/// plus all of its results) as one unit. Cancelling a run by dropping its
/// future therefore never leaves a tool request without its results in
/// the history.
pub struct Agent {
    model_client: ModelClient,
    registry: ToolRegistry,
    history: HistoryManager,
    config: AgentConfig,
    state: LoopState,
    span: Span,
}

impl Agent {
    /// Runs the loop for `input` and returns the final answer.
    ///
    /// A response cut off by the output limit is returned as is.
    pub async fn run(
        &mut self,
        input: impl Into<String>,
    ) -> Result<String, AgentError> {
        let span = debug_span!(parent: &self.span, "run");
        self.run_inner(input.into(), None).instrument(span).await
    }

    /// Like [`run`](Self::run), but yields text deltas and tool results as
    /// they happen.
    pub fn run_stream(&mut self, input: impl Into<String>) -> RunStream<'_> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let span = debug_span!(parent: &self.span, "run", streaming = true);
        let run = self
            .run_inner(input.into(), Some(events_tx))
            .instrument(span)
            .boxed();
        RunStream::new(run, events_rx)
    }

    /// Clears the history. Registered tools are kept.
    pub fn reset(&mut self) {
        debug!(parent: &self.span, "reset");
        self.history.reset();
        self.state = LoopState::Idle;
    }

    /// Returns the conversation history.
    #[inline]
    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    /// Returns the tool registry.
    #[inline]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Gives access to the registry, e.g. to enter and exit the tool scope.
    #[inline]
    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Returns the agent configuration.
    #[inline]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Returns the state the loop is in, or ended in.
    #[inline]
    pub fn state(&self) -> LoopState {
        self.state
    }

    async fn run_inner(
        &mut self,
        input: String,
        events: Option<EventSender>,
    ) -> Result<String, AgentError> {
        let result = self.drive(input, events.as_ref()).await;
        self.state = match &result {
            Ok(_) => LoopState::Done,
            Err(err) => {
                warn!("run failed: {err}");
                LoopState::Failed
            }
        };
        result
    }

    async fn drive(
        &mut self,
        input: String,
        events: Option<&EventSender>,
    ) -> Result<String, AgentError> {
        self.history.maybe_trim().await;

        // One context per run, shared by every tool round.
        let ctx = RunContext::new();
        let mut staged = vec![Message::user(input)];
        let max_iterations = self.config.max_iterations;

        for iteration in 1..=max_iterations {
            self.state = LoopState::AwaitingModel;
            debug!("iteration {iteration}/{max_iterations}");

            let req = self.build_request(&staged);
            let on_text = {
                let events = events.cloned();
                move |delta: String| {
                    if let Some(events) = &events {
                        events.send(StreamEvent::TextDelta(delta)).ok();
                    }
                }
            };
            let resp = self.model_client.send_request(req, on_text).await?;
            if let Some(usage) = resp.usage {
                self.history.update_token_count(usage.total());
            }

            match resp.stop_reason {
                StopReason::EndOfTurn => {
                    let text = resp.text();
                    if text.trim().is_empty() {
                        return Err(AgentError::EmptyResponse);
                    }
                    staged.push(answer_message(&resp));
                    self.history.extend(staged);
                    return Ok(text);
                }
                StopReason::LengthLimit => {
                    let text = resp.text();
                    if text.trim().is_empty() {
                        return Err(AgentError::EmptyResponse);
                    }
                    warn!("response was cut off, returning partial text");
                    staged.push(answer_message(&resp));
                    self.history.extend(staged);
                    return Ok(text);
                }
                StopReason::ToolRequested => {
                    let calls = resp.tool_calls();
                    if calls.is_empty() {
                        return Err(AgentError::MissingToolCalls);
                    }

                    self.state = LoopState::AwaitingTools;
                    debug!("running {} tool calls", calls.len());
                    let results =
                        self.registry.run_many(calls, Some(&ctx)).await;
                    if let Some(events) = events {
                        for result in &results {
                            events.send(tool_result_event(result)).ok();
                        }
                    }

                    staged.push(resp.to_message());
                    staged.push(self.results_message(&results, &ctx));
                    self.history.extend(staged.drain(..));
                    self.history.maybe_trim().await;
                }
            }
        }

        Err(AgentError::IterationBudgetExceeded { max_iterations })
    }

    fn build_request(&self, staged: &[Message]) -> ModelRequest {
        let mut messages = self.history.to_wire_format();
        messages.extend_from_slice(staged);
        ModelRequest {
            system: self.config.system_prompt.clone(),
            messages,
            tools: self.registry.model_tools(),
            max_tokens: None,
        }
    }

    /// Groups the results of one tool round into a single user message,
    /// in request order.
    fn results_message(
        &self,
        results: &[ToolResult],
        ctx: &RunContext,
    ) -> Message {
        let ctx_line = (self.config.context_summary && !ctx.is_empty())
            .then(|| ctx.summary_line());
        let blocks = results
            .iter()
            .map(|result| {
                let mut content = result.to_model_content();
                if let Some(line) = &ctx_line {
                    content.push('\n');
                    content.push_str(line);
                }
                ContentBlock::tool_result(result.invocation_id(), content)
            })
            .collect();
        Message::with_blocks(Role::User, blocks)
    }
}

/// Builds the assistant message of a final answer. Tool calls in it are
/// dropped, since they will never get results.
fn answer_message(resp: &ModelClientResponse) -> Message {
    let blocks: Vec<_> = resp
        .content
        .iter()
        .filter(|block| !matches!(block, ContentBlock::ToolUse { .. }))
        .cloned()
        .collect();
    if blocks.len() != resp.content.len() {
        warn!("ignoring tool calls in a final answer");
    }
    Message::with_blocks(Role::Assistant, blocks)
}

#[inline]
fn tool_result_event(result: &ToolResult) -> StreamEvent {
    StreamEvent::ToolResult {
        invocation_id: result.invocation_id().to_owned(),
        tool_name: result.tool_name().to_owned(),
        success: result.is_success(),
    }
}
