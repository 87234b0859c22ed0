use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;

use relay_model::{
    ContentBlock, ErrorKind, Message, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent, Role, StopReason,
    ToolCallRequest, Usage,
};
use tracing::Instrument;

type SendRequestResult = Result<ModelClientResponse, ModelClientError>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(ModelRequest, Box<dyn Fn(String) + Send + 'static>)
        -> BoxedSendRequestFuture + Send + Sync
>;

/// Errors raised while talking to the model.
#[derive(Debug, thiserror::Error)]
pub enum ModelClientError {
    /// The provider rejected the request or failed mid-response.
    #[error("model provider error: {0}")]
    Provider(Box<dyn ModelProviderError>),
    /// The response ended without telling why.
    #[error("model response ended without a stop reason")]
    MissingStopReason,
}

impl ModelClientError {
    /// Returns the provider's error kind, if the provider failed.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ModelClientError::Provider(err) => Some(err.kind()),
            ModelClientError::MissingStopReason => None,
        }
    }
}

/// A wrapper around a model provider that maintains an execution
/// environment for the provider and provides a type-erased interface
/// for the other modules.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
}

impl ModelClient {
    /// Creates a model client from a provider.
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req, on_text| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!(
                        "sending {} messages, {} tools",
                        req.messages.len(),
                        req.tools.len()
                    );
                    let resp_or_err = fut.await;
                    handle_response::<P>(resp_or_err, on_text).await
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self { handler_fn }
    }

    /// Sends a request and collects the whole response, calling `on_text`
    /// for every text delta as it arrives.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    #[inline]
    pub async fn send_request(
        &self,
        req: ModelRequest,
        on_text: impl Fn(String) + Send + 'static,
    ) -> SendRequestResult {
        (self.handler_fn)(req, Box::new(on_text)).await
    }
}

/// A completely received response from the model client.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelClientResponse {
    /// Text and tool use blocks in the order they arrived. Adjacent text
    /// deltas are merged into one block.
    pub content: Vec<ContentBlock>,
    /// The reason the model finished generating.
    pub stop_reason: StopReason,
    /// Token usage, if the provider reported it.
    pub usage: Option<Usage>,
}

impl ModelClientResponse {
    /// Returns all text of the response, one line per text block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Returns the tool calls requested by the model, in order.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some(ToolCallRequest {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Converts the response into an assistant message for the history.
    #[inline]
    pub fn to_message(&self) -> Message {
        Message::with_blocks(Role::Assistant, self.content.clone())
    }
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    on_text: Box<dyn Fn(String) + Send + 'static>,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            error!("got an error: {err:?}");
            return Err(ModelClientError::Provider(Box::new(err)));
        }
    };

    let mut content: Vec<ContentBlock> = vec![];
    let mut stop_reason = None;
    let mut usage = None;

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => {
                error!("got an error: {err:?}");
                return Err(ModelClientError::Provider(Box::new(err)));
            }
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::TextDelta(delta) => {
                match content.last_mut() {
                    Some(ContentBlock::Text { text }) => text.push_str(&delta),
                    _ => content.push(ContentBlock::text(delta.clone())),
                }
                on_text(delta);
            }
            ModelResponseEvent::ToolCall(req) => {
                content.push(ContentBlock::ToolUse {
                    id: req.id,
                    name: req.name,
                    input: req.arguments,
                });
            }
            ModelResponseEvent::Usage(reported) => {
                usage = Some(reported);
            }
            ModelResponseEvent::Completed(reason) => {
                stop_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");

    let Some(stop_reason) = stop_reason else {
        warn!("response ended without a stop reason");
        return Err(ModelClientError::MissingStopReason);
    };
    Ok(ModelClientResponse {
        content,
        stop_reason,
        usage,
    })
}
