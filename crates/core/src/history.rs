//! Conversation history with budget-driven compaction.

use relay_model::{ContentBlock, Message, MessageContent, ModelRequest, Role};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span};

use crate::model_client::ModelClient;

const SUMMARY_PREFIX: &str = "[Summary of earlier conversation]";
const PLACEHOLDER: &str = "[Earlier conversation omitted]";

/// Budget and compaction settings of a [`HistoryManager`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Token budget of the whole log. The primary trigger.
    pub max_tokens: Option<u64>,
    /// Message count ceiling. A secondary trigger.
    pub max_messages: Option<usize>,
    /// Number of most recent turns (user + assistant pairs) that are never
    /// compacted.
    pub keep_recent: usize,
    /// Whether to summarize the compacted prefix with the model.
    pub summarize: bool,
    /// Output cap of the summarization request.
    pub summary_max_tokens: u32,
    /// Characters per token used by the size estimate.
    pub chars_per_token: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_tokens: Some(80_000),
            max_messages: Some(100),
            keep_recent: 10,
            summarize: true,
            summary_max_tokens: 512,
            chars_per_token: 3.5,
        }
    }
}

/// Owns the ordered conversation log and compacts it when it grows past
/// the configured budget.
///
/// The log is append-only. Compaction replaces a contiguous prefix with a
/// single user message, and never cuts between an assistant message that
/// requests tools and the message carrying their results.
pub struct HistoryManager {
    config: HistoryConfig,
    messages: Vec<Message>,
    last_token_count: Option<u64>,
    summarizer: Option<ModelClient>,
    span: Span,
}

impl HistoryManager {
    /// Creates an empty history. Compaction uses the placeholder until a
    /// summarizer is attached with [`with_summarizer`](Self::with_summarizer).
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            messages: vec![],
            last_token_count: None,
            summarizer: None,
            span: Span::none(),
        }
    }

    /// Uses `client` to summarize compacted messages. Without a summarizer
    /// a fixed placeholder is inserted instead.
    #[inline]
    pub fn with_summarizer(mut self, client: ModelClient) -> Self {
        self.summarizer = Some(client);
        self
    }

    /// Nests the history span under `parent`.
    #[inline]
    pub fn with_span(mut self, parent: Span) -> Self {
        self.span = debug_span!(parent: &parent, "history");
        self
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Appends a message.
    #[inline]
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Appends messages in order.
    #[inline]
    pub fn extend<I: IntoIterator<Item = Message>>(&mut self, messages: I) {
        self.messages.extend(messages);
    }

    /// Returns the messages, oldest first.
    #[inline]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the number of messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if there are no messages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the ordered messages to send to the model client.
    #[inline]
    pub fn to_wire_format(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Records the token count the model reported for the last request.
    ///
    /// Until the next compaction it replaces the character estimate when
    /// deciding whether the log is over budget.
    #[inline]
    pub fn update_token_count(&mut self, tokens: u64) {
        self.last_token_count = Some(tokens);
    }

    /// Returns the size of the whole log in tokens.
    ///
    /// This is the count reported through
    /// [`update_token_count`](Self::update_token_count) if there is one,
    /// otherwise an approximation from the character count. The
    /// approximation can be off by a wide margin for code or non-Latin
    /// text.
    pub fn estimated_tokens(&self) -> u64 {
        self.last_token_count.unwrap_or_else(|| {
            estimate_tokens(&self.messages, self.config.chars_per_token)
        })
    }

    /// Clears all messages and the reported token count.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.last_token_count = None;
    }

    /// Compacts the log if it is over budget. Returns `true` if it did.
    ///
    /// Summarization failures degrade to a placeholder and are never
    /// returned. This method is cancel safe: the log is replaced only
    /// after the summary is ready.
    pub async fn maybe_trim(&mut self) -> bool {
        let over_tokens = self
            .config
            .max_tokens
            .is_some_and(|max| self.estimated_tokens() > max);
        let over_messages = self
            .config
            .max_messages
            .is_some_and(|max| self.messages.len() > max);
        if !over_tokens && !over_messages {
            return false;
        }

        let Some(split) = find_split_point(&self.messages, &self.config) else {
            self.span.in_scope(|| {
                debug!("over budget, but no split point was found");
            });
            return false;
        };

        let mut summary = None;
        if self.config.summarize {
            if let Some(client) = &self.summarizer {
                summary = summarize(
                    client,
                    &self.messages[..split],
                    self.config.summary_max_tokens,
                )
                .instrument(self.span.clone())
                .await;
            }
        }
        let head = match summary {
            Some(summary) => Message::user(format!("{SUMMARY_PREFIX} {summary}")),
            None => Message::user(PLACEHOLDER),
        };

        self.messages.splice(..split, [head]);
        self.last_token_count = None;
        self.span.in_scope(|| {
            info!(
                "compacted {split} messages, {} remaining",
                self.messages.len()
            );
        });
        true
    }
}

/// Finds where to cut the log, or `None` if it can't be cut.
///
/// Candidates are user messages that don't directly follow an assistant
/// tool request, outside of the `2 * keep_recent` most recent messages.
/// The latest candidate whose suffix fits the token budget wins; if none
/// fits, the latest candidate is used. Without a token budget, the message
/// ceiling is used the same way.
pub fn find_split_point(
    messages: &[Message],
    config: &HistoryConfig,
) -> Option<usize> {
    let n = messages.len();
    let max_split = n.saturating_sub(config.keep_recent.saturating_mul(2));
    let candidates: Vec<usize> = (1..=max_split)
        .filter(|&i| i < n)
        .filter(|&i| {
            let prev = &messages[i - 1];
            messages[i].role == Role::User
                && !(prev.role == Role::Assistant && prev.has_tool_use())
        })
        .collect();
    let latest = *candidates.last()?;

    let fits = |idx: usize| match (config.max_tokens, config.max_messages) {
        (Some(max), _) => {
            estimate_tokens(&messages[idx..], config.chars_per_token) <= max
        }
        (None, Some(max)) => n - idx <= max,
        (None, None) => true,
    };
    let chosen = candidates
        .iter()
        .rev()
        .copied()
        .find(|&idx| fits(idx))
        .unwrap_or(latest);
    Some(chosen)
}

/// Approximates the token count of `messages` from their character count.
pub fn estimate_tokens(messages: &[Message], chars_per_token: f64) -> u64 {
    let chars: usize = messages.iter().map(message_chars).sum();
    let ratio = if chars_per_token > 0.0 {
        chars_per_token
    } else {
        1.0
    };
    (chars as f64 / ratio) as u64
}

fn message_chars(message: &Message) -> usize {
    match &message.content {
        MessageContent::Text(text) => text.chars().count(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::ToolUse { name, input, .. } => {
                    name.chars().count() + input.to_string().chars().count()
                }
                ContentBlock::ToolResult { content, .. } => {
                    content.chars().count()
                }
            })
            .sum(),
    }
}

fn flatten_transcript(messages: &[Message]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let text = match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        format!("[Tool: {name}({input})]")
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        format!("[ToolResult: {content}]")
                    }
                })
                .collect(),
        };
        lines.push(format!("{role}: {text}"));
    }
    lines.join("\n")
}

async fn summarize(
    client: &ModelClient,
    messages: &[Message],
    max_tokens: u32,
) -> Option<String> {
    let prompt = format!(
        "Summarize the following conversation concisely. Keep only the key \
         facts and context.\n\n{}",
        flatten_transcript(messages)
    );
    let req = ModelRequest {
        system: None,
        messages: vec![Message::user(prompt)],
        tools: vec![],
        max_tokens: Some(max_tokens),
    };
    match client.send_request(req, |_| {}).await {
        Ok(resp) => {
            let summary = resp.text().trim().to_owned();
            if summary.is_empty() {
                warn!("summarization returned nothing, dropping instead");
                None
            } else {
                Some(summary)
            }
        }
        Err(err) => {
            warn!("summarization failed, dropping instead: {err}");
            None
        }
    }
}
