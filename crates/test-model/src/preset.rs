use relay_model::{ErrorKind, StopReason, ToolCallRequest, Usage};
use serde::{Deserialize, Serialize};

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresetEvent {
    #[serde(rename = "text_delta")]
    TextDelta(String),
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallRequest),
}

/// The preset response for an assistant step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    #[serde(default)]
    pub events: Vec<PresetEvent>,
    /// The stop reason to report. When unset, it is inferred from the
    /// events: `tool_requested` if any tool call is present, otherwise
    /// `end_of_turn`.
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    /// The usage to report before completion.
    #[serde(default)]
    pub usage: Option<Usage>,
    /// If set, the request fails with this error kind instead of
    /// producing events.
    #[serde(default)]
    pub failure: Option<ErrorKind>,
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            ..Default::default()
        }
    }

    /// Creates a plain text response that ends the turn.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::with_events([PresetEvent::TextDelta(text.into())])
    }

    /// Creates a response that fails with `kind`.
    #[inline]
    pub fn failure(kind: ErrorKind) -> Self {
        Self {
            failure: Some(kind),
            ..Default::default()
        }
    }

    /// Overrides the stop reason.
    #[inline]
    pub fn with_stop_reason(mut self, stop_reason: StopReason) -> Self {
        self.stop_reason = Some(stop_reason);
        self
    }

    /// Sets the reported usage.
    #[inline]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub(crate) fn resolved_stop_reason(&self) -> StopReason {
        if let Some(stop_reason) = self.stop_reason {
            return stop_reason;
        }
        let has_tool_call = self
            .events
            .iter()
            .any(|event| matches!(event, PresetEvent::ToolCall(_)));
        if has_tool_call {
            StopReason::ToolRequested
        } else {
            StopReason::EndOfTurn
        }
    }
}
