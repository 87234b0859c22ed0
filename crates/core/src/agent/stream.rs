use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use super::AgentError;

pub(crate) type EventSender = UnboundedSender<StreamEvent>;

/// An incremental output of a streaming run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A piece of model text, in arrival order.
    TextDelta(String),
    /// A tool invocation finished.
    ToolResult {
        /// The invocation this result answers.
        invocation_id: String,
        /// The invoked tool.
        tool_name: String,
        /// Whether the invocation succeeded.
        success: bool,
    },
    /// The run produced its final answer. Always the last event.
    Finished(String),
}

/// A single-pass stream of [`StreamEvent`]s for one run.
///
/// The run only makes progress while the stream is polled. Dropping the
/// stream cancels the run; the history keeps every turn that was fully
/// completed and nothing of the interrupted one. An error ends the
/// stream.
pub struct RunStream<'a> {
    run: Option<BoxFuture<'a, Result<String, AgentError>>>,
    outcome: Option<Result<String, AgentError>>,
    events: UnboundedReceiver<StreamEvent>,
}

impl<'a> RunStream<'a> {
    pub(crate) fn new(
        run: BoxFuture<'a, Result<String, AgentError>>,
        events: UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self {
            run: Some(run),
            outcome: None,
            events,
        }
    }
}

impl Stream for RunStream<'_> {
    type Item = Result<StreamEvent, AgentError>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(run) = &mut this.run {
            if let Poll::Ready(outcome) = run.as_mut().poll(cx) {
                this.run = None;
                this.outcome = Some(outcome);
            }
        }

        // Events are only sent while the run is polled, so everything
        // queued so far precedes the outcome.
        if let Ok(event) = this.events.try_recv() {
            return Poll::Ready(Some(Ok(event)));
        }
        match this.outcome.take() {
            Some(Ok(text)) => Poll::Ready(Some(Ok(StreamEvent::Finished(text)))),
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None if this.run.is_some() => Poll::Pending,
            None => Poll::Ready(None),
        }
    }
}
