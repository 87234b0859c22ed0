//! A local fake model for testing purpose.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use relay_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest,
    ModelResponse, ModelResponseEvent, StopReason, Usage,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: Vec<PresetEvent>,
    usage: Option<Usage>,
    stop_reason: StopReason,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();

        if let Some(sleep) = &mut this.sleep {
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;

            let idx = this.event_idx;
            this.event_idx += 1;
            let event_count = this.events.len();
            if idx < event_count {
                let event = match &this.events[idx] {
                    PresetEvent::TextDelta(text) => {
                        ModelResponseEvent::TextDelta(text.clone())
                    }
                    PresetEvent::ToolCall(req) => {
                        ModelResponseEvent::ToolCall(req.clone())
                    }
                };
                return Poll::Ready(Ok(Some(event)));
            }
            if idx == event_count {
                if let Some(usage) = this.usage {
                    return Poll::Ready(Ok(Some(ModelResponseEvent::Usage(
                        usage,
                    ))));
                }
                this.event_idx += 1;
            }
            if this.event_idx == event_count + 2 {
                return Poll::Ready(Ok(Some(ModelResponseEvent::Completed(
                    this.stop_reason,
                ))));
            }
            // In case this method is called after completion.
            return Poll::Ready(Ok(None));
        }
        this.sleep = Some(Box::pin(sleep(this.delay)));
        Pin::new(this).poll_next_event(cx)
    }
}

#[derive(Default)]
struct Script {
    steps: VecDeque<PresetResponse>,
    fallback: Option<PresetResponse>,
    requests: Vec<ModelRequest>,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the conversation script, which
/// is how the model should respond to each request. Every request consumes
/// the next preset response; once the script runs out, the fallback
/// response (if any) is returned over and over again. Otherwise an error
/// is returned.
///
/// Clones share the same script and request log, so a clone can be kept
/// for assertions after the provider has been handed to an agent.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    /// Creates a provider that plays `responses` in order.
    pub fn with_script(
        responses: impl IntoIterator<Item = PresetResponse>,
    ) -> Self {
        let provider = Self::default();
        for response in responses {
            provider.add_response(response);
        }
        provider
    }

    #[inline]
    pub fn add_response(&self, preset: PresetResponse) {
        self.lock().steps.push_back(preset);
    }

    /// Sets the response returned once the script is exhausted.
    #[inline]
    pub fn set_fallback(&self, preset: PresetResponse) {
        self.lock().fallback = Some(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns how many requests have been sent to this provider.
    #[inline]
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Returns a copy of every request received so far.
    #[inline]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let mut script = self.lock();
        script.requests.push(req.clone());
        let preset = match script.steps.pop_front() {
            Some(preset) => Some(preset),
            None => script.fallback.clone(),
        };
        drop(script);

        let result = match preset {
            None => Err(Error {
                message: "no enough steps",
                kind: ErrorKind::Other,
            }),
            Some(PresetResponse {
                failure: Some(kind),
                ..
            }) => Err(Error {
                message: "scripted failure",
                kind,
            }),
            Some(preset) => Ok(TestModelResponse {
                stop_reason: preset.resolved_stop_reason(),
                usage: preset.usage,
                events: preset.events,
                event_idx: 0,
                delay: self.delay.unwrap_or(Duration::from_millis(1)),
                sleep: None,
            }),
        };
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use relay_model::{Message, ModelTool, ToolCallRequest};
    use serde_json::json;

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Vec<ToolCallRequest>, Option<Usage>, StopReason) {
        let mut resp = pin!(resp);
        let mut text = String::new();
        let mut tool_calls = vec![];
        let mut usage = None;
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
                .await
                .unwrap()
                .unwrap();
            match event {
                ModelResponseEvent::Completed(reason) => {
                    return (text, tool_calls, usage, reason);
                }
                ModelResponseEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                }
                ModelResponseEvent::ToolCall(req) => tool_calls.push(req),
                ModelResponseEvent::Usage(u) => usage = Some(u),
            }
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::TextDelta("Hello, ".to_owned()),
            PresetEvent::TextDelta("world!".to_owned()),
        ]));
        provider.add_response(
            PresetResponse::with_events([
                PresetEvent::TextDelta("Sure, let me take a look.".to_owned()),
                PresetEvent::ToolCall(ToolCallRequest {
                    id: "tool:1".to_owned(),
                    name: "read_file".to_owned(),
                    arguments: json!({ "filename": "todo.txt" }),
                }),
            ])
            .with_usage(Usage {
                input_tokens: 20,
                output_tokens: 5,
            }),
        );

        let req = ModelRequest {
            messages: vec![Message::user("Hi")],
            tools: vec![ModelTool {
                name: "read_file".to_owned(),
                description: "Reads a file".to_owned(),
                parameters: json!({ "type": "object" }),
            }],
            ..Default::default()
        };
        let resp = provider.send_request(&req).await.unwrap();
        let (text, tool_calls, usage, reason) = collect_response(resp).await;
        assert_eq!(text, "Hello, world!");
        assert!(tool_calls.is_empty());
        assert_eq!(usage, None);
        assert_eq!(reason, StopReason::EndOfTurn);

        let resp = provider.send_request(&req).await.unwrap();
        let (text, tool_calls, usage, reason) = collect_response(resp).await;
        assert_eq!(text, "Sure, let me take a look.");
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name, "read_file");
        assert_eq!(usage.unwrap().total(), 25);
        assert_eq!(reason, StopReason::ToolRequested);

        assert_eq!(provider.request_count(), 2);
        assert_eq!(provider.requests()[0], req);
    }

    #[tokio::test]
    async fn test_fallback_and_exhaustion() {
        let provider = TestModelProvider::default();
        assert!(provider.send_request(&ModelRequest::default()).await.is_err());

        provider.set_fallback(PresetResponse::text("again"));
        for _ in 0..3 {
            let resp =
                provider.send_request(&ModelRequest::default()).await.unwrap();
            let (text, ..) = collect_response(resp).await;
            assert_eq!(text, "again");
        }
        assert_eq!(provider.request_count(), 4);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let provider = TestModelProvider::with_script([
            PresetResponse::failure(ErrorKind::Moderated),
        ]);
        let err = provider
            .send_request(&ModelRequest::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Moderated);
    }
}
