use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The author of a message.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human side of the conversation. Tool results are also sent on
    /// behalf of the user.
    User,
    /// The model.
    Assistant,
}

/// A typed piece of message content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// A request from the model to invoke a tool.
    ToolUse {
        /// The invocation identifier, unique within the conversation.
        id: String,
        /// The name of the requested tool.
        name: String,
        /// The raw arguments produced by the model.
        input: Value,
    },
    /// The result of a previously requested tool invocation.
    ToolResult {
        /// Identifier of the paired [`ContentBlock::ToolUse`] block.
        tool_use_id: String,
        /// The result rendered for the model.
        content: String,
    },
}

impl ContentBlock {
    /// Creates a text block.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates a tool result block paired with `tool_use_id`.
    #[inline]
    pub fn tool_result<S1: Into<String>, S2: Into<String>>(
        tool_use_id: S1,
        content: S2,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
        }
    }
}

/// The content of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// A plain text shortcut.
    Text(String),
    /// An ordered sequence of typed blocks.
    Blocks(Vec<ContentBlock>),
}

/// One turn in the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The author of this message.
    pub role: Role,
    /// The content of this message.
    pub content: MessageContent,
}

impl Message {
    /// Creates a plain text user message.
    #[inline]
    pub fn user<S: Into<String>>(text: S) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Creates a plain text assistant message.
    #[inline]
    pub fn assistant<S: Into<String>>(text: S) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Creates a message made of content blocks.
    #[inline]
    pub fn with_blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Returns the content blocks of this message, or an empty slice for
    /// a plain text message.
    #[inline]
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Returns whether this message requests at least one tool call.
    pub fn has_tool_use(&self) -> bool {
        self.blocks()
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }

    /// Concatenates the text carried by this message, joining text blocks
    /// with a newline.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
