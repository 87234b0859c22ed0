use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Message;

/// A request to be sent to the model provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The system instructions, if any.
    pub system: Option<String>,
    /// The conversation so far, oldest first.
    pub messages: Vec<Message>,
    /// Tools that are available to the model.
    pub tools: Vec<ModelTool>,
    /// An upper bound of tokens the model may generate for this request.
    ///
    /// `None` leaves the decision to the provider.
    pub max_tokens: Option<u32>,
}

/// Describes a tool that can be used by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelTool {
    /// Name of the tool.
    pub name: String,
    /// Description of the tool.
    pub description: String,
    /// Parameters definition of the tool.
    ///
    /// For most model providers, the parameters should typically be
    /// defined by a [JSON schema](https://json-schema.org/).
    pub parameters: Value,
}
