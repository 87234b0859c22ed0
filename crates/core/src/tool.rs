//! Tool call supports.

mod error;
mod object;
mod registry;

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

use relay_model::ModelTool;
use schemars::{JsonSchema, schema_for};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::RunContext;
pub use error::{Error, ErrorKind};
pub use registry::{Lifecycle, RegistryError, ToolRegistry};

/// A payload kept next to a tool result but never sent to the model.
pub type RawPayload = Arc<dyn Any + Send + Sync>;

/// What a tool execution produces.
pub type ExecuteResult<O> = Result<ToolOutput<O>, Error>;

/// A tool that can be called by the model.
///
/// Use this trait for tools that are naturally asynchronous (network, file
/// I/O through tokio). CPU-bound or otherwise blocking tools should
/// implement [`BlockingTool`] instead, so that they run on a worker thread
/// and never stall sibling invocations.
///
/// Implementations of this trait should be stateless during execution.
/// Per-run shared data belongs in the [`RunContext`], which is handed to
/// `execute` only if [`accepts_context`](Tool::accepts_context) returns
/// `true`.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned + JsonSchema + Send + 'static;

    /// The type of output that the tool produces.
    type Output: Serialize + DeserializeOwned + JsonSchema + Send + 'static;

    /// Returns the name of the tool, unique within a registry.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns whether `execute` wants the run context.
    ///
    /// This is read once at registration.
    fn accepts_context(&self) -> bool {
        false
    }

    /// Acquires resources before the first call.
    fn setup(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    /// Releases resources acquired by `setup`.
    fn teardown(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of `self`,
    /// and the future should be cancellation safe.
    fn execute(
        &self,
        input: Self::Input,
        ctx: Option<RunContext>,
    ) -> impl Future<Output = ExecuteResult<Self::Output>> + Send + 'static;
}

/// A tool whose execution blocks the calling thread.
///
/// The registry runs `execute` on tokio's blocking pool.
pub trait BlockingTool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned + JsonSchema + Send + 'static;

    /// The type of output that the tool produces.
    type Output: Serialize + DeserializeOwned + JsonSchema + Send + 'static;

    /// Returns the name of the tool, unique within a registry.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns whether `execute` wants the run context.
    fn accepts_context(&self) -> bool {
        false
    }

    /// Acquires resources before the first call.
    fn setup(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    /// Releases resources acquired by `setup`.
    fn teardown(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    /// Executes the tool on a worker thread.
    fn execute(
        &self,
        input: Self::Input,
        ctx: Option<RunContext>,
    ) -> ExecuteResult<Self::Output>;
}

/// A successful tool execution.
///
/// Any output value converts into a `ToolOutput` with `.into()`.
pub struct ToolOutput<O> {
    value: O,
    raw: Option<RawPayload>,
    summary: Option<String>,
}

impl<O> ToolOutput<O> {
    /// Wraps an output value.
    #[inline]
    pub fn new(value: O) -> Self {
        Self {
            value,
            raw: None,
            summary: None,
        }
    }

    /// Attaches a payload that stays with the result but is never sent to
    /// the model, e.g. a tensor or an image.
    #[inline]
    pub fn with_raw<R: Any + Send + Sync>(mut self, raw: R) -> Self {
        self.raw = Some(Arc::new(raw));
        self
    }

    /// Replaces the JSON output with `summary` when the result is rendered
    /// for the model.
    #[inline]
    pub fn with_summary<S: Into<String>>(mut self, summary: S) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Returns the output value.
    #[inline]
    pub fn value(&self) -> &O {
        &self.value
    }

    /// Unwraps the output value.
    #[inline]
    pub fn into_value(self) -> O {
        self.value
    }
}

impl<O> From<O> for ToolOutput<O> {
    #[inline]
    fn from(value: O) -> Self {
        Self::new(value)
    }
}

/// The outcome of one tool invocation.
#[derive(Clone)]
pub enum ToolOutcome {
    /// The tool succeeded and its output passed validation.
    Success {
        /// The validated output.
        output: Value,
        /// A payload excluded from the model-facing rendering.
        raw: Option<RawPayload>,
        /// A rendering override for the model.
        summary: Option<String>,
    },
    /// The tool failed.
    Failure(Error),
}

impl Debug for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutcome::Success {
                output,
                raw,
                summary,
            } => f
                .debug_struct("Success")
                .field("output", output)
                .field("raw", &raw.as_ref().map(|_| ".."))
                .field("summary", summary)
                .finish(),
            ToolOutcome::Failure(err) => {
                f.debug_tuple("Failure").field(err).finish()
            }
        }
    }
}

/// The result of a tool call.
///
/// Results are created by the registry, exactly once per invocation.
#[derive(Clone, Debug)]
pub struct ToolResult {
    tool_name: String,
    invocation_id: String,
    outcome: ToolOutcome,
}

impl ToolResult {
    pub(crate) fn success(
        tool_name: String,
        invocation_id: String,
        output: Value,
        raw: Option<RawPayload>,
        summary: Option<String>,
    ) -> Self {
        Self {
            tool_name,
            invocation_id,
            outcome: ToolOutcome::Success {
                output,
                raw,
                summary,
            },
        }
    }

    pub(crate) fn failure(
        tool_name: String,
        invocation_id: String,
        error: Error,
    ) -> Self {
        Self {
            tool_name,
            invocation_id,
            outcome: ToolOutcome::Failure(error),
        }
    }

    /// Returns the name of the tool that was called.
    #[inline]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Returns the identifier of the request this result answers.
    #[inline]
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Returns the outcome.
    #[inline]
    pub fn outcome(&self) -> &ToolOutcome {
        &self.outcome
    }

    /// Returns `true` if the tool succeeded.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// Returns the validated output of a successful call.
    #[inline]
    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success { output, .. } => Some(output),
            ToolOutcome::Failure(_) => None,
        }
    }

    /// Returns the error of a failed call.
    #[inline]
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure(err) => Some(err),
        }
    }

    /// Returns the raw payload if it has type `T`.
    pub fn raw<T: Any>(&self) -> Option<&T> {
        match &self.outcome {
            ToolOutcome::Success { raw: Some(raw), .. } => raw.downcast_ref(),
            _ => None,
        }
    }

    /// Renders the result as the text the model will see.
    ///
    /// The raw payload is never included.
    pub fn to_model_content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Failure(err) if err.is_recoverable() => {
                format!("Error: {}", err.reason())
            }
            ToolOutcome::Failure(err) => {
                format!("Error: {} (not recoverable)", err.reason())
            }
            ToolOutcome::Success {
                summary: Some(summary),
                ..
            } => summary.clone(),
            ToolOutcome::Success { output, .. } => output.to_string(),
        }
    }
}

/// Identity and schemas of a registered tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
}

impl ToolDescriptor {
    pub(crate) fn of<I: JsonSchema, O: JsonSchema>(
        name: &str,
        description: &str,
    ) -> Self {
        let mut input_schema = schema_for!(I).to_value();
        strip_schema_noise(&mut input_schema);
        let mut output_schema = schema_for!(O).to_value();
        strip_schema_noise(&mut output_schema);
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            input_schema,
            output_schema,
        }
    }

    /// Returns the tool name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tool description.
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the JSON schema of the input.
    #[inline]
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Returns the JSON schema of the output.
    #[inline]
    pub fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    /// Returns the definition advertised to the model.
    #[inline]
    pub fn to_model_tool(&self) -> ModelTool {
        ModelTool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// Drops `$schema` and `title` keys, which only cost prompt tokens.
fn strip_schema_noise(schema: &mut Value) {
    let Some(root) = schema.as_object_mut() else {
        return;
    };
    root.remove("$schema");
    root.remove("title");
    if let Some(Value::Object(props)) = root.get_mut("properties") {
        for prop in props.values_mut() {
            if let Some(prop) = prop.as_object_mut() {
                prop.remove("title");
            }
        }
    }
}
