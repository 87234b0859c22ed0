use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::spawn_blocking;
use tracing::{Instrument, Span};

use super::{
    BlockingTool, Error, ErrorKind, ExecuteResult, Tool, ToolDescriptor,
    ToolResult,
};
use crate::context::RunContext;

/// Type-erased view of a registered tool.
#[async_trait]
pub(crate) trait ToolObject: Send + Sync + 'static {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn setup(&self) -> Result<(), Error>;

    async fn teardown(&self) -> Result<(), Error>;

    /// Validates `arguments`, runs the tool and wraps whatever happens into
    /// a [`ToolResult`]. The returned future never panics.
    fn invoke(
        self: Arc<Self>,
        arguments: Value,
        invocation_id: String,
        ctx: Option<RunContext>,
    ) -> BoxFuture<'static, ToolResult>;
}

pub(crate) struct AsyncToolObject<T: Tool> {
    tool: T,
    descriptor: ToolDescriptor,
    accepts_context: bool,
}

impl<T: Tool> AsyncToolObject<T> {
    pub fn new(tool: T) -> Self {
        let descriptor = ToolDescriptor::of::<T::Input, T::Output>(
            tool.name(),
            tool.description(),
        );
        let accepts_context = tool.accepts_context();
        Self {
            tool,
            descriptor,
            accepts_context,
        }
    }
}

#[async_trait]
impl<T: Tool> ToolObject for AsyncToolObject<T> {
    #[inline]
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn setup(&self) -> Result<(), Error> {
        self.tool.setup().await
    }

    async fn teardown(&self) -> Result<(), Error> {
        self.tool.teardown().await
    }

    fn invoke(
        self: Arc<Self>,
        arguments: Value,
        invocation_id: String,
        ctx: Option<RunContext>,
    ) -> BoxFuture<'static, ToolResult> {
        let name = self.descriptor.name().to_owned();
        let span =
            debug_span!("tool execute", tool = %name, id = %invocation_id);

        let input: T::Input = match parse_input(arguments) {
            Ok(input) => input,
            Err(err) => {
                span.in_scope(|| debug!("rejected input: {err}"));
                return ready(ToolResult::failure(name, invocation_id, err))
                    .boxed();
            }
        };
        let ctx = ctx.filter(|_| self.accepts_context);

        let fut = match catch_unwind(AssertUnwindSafe(|| {
            self.tool.execute(input, ctx)
        })) {
            Ok(fut) => fut,
            Err(panic) => {
                let err = panic_to_error(&name, panic);
                return ready(ToolResult::failure(name, invocation_id, err))
                    .boxed();
            }
        };

        async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(panic_to_error(&name, panic)),
            };
            finish(name, invocation_id, outcome)
        }
        .instrument(span)
        .boxed()
    }
}

pub(crate) struct BlockingToolObject<T: BlockingTool> {
    tool: T,
    descriptor: ToolDescriptor,
    accepts_context: bool,
}

impl<T: BlockingTool> BlockingToolObject<T> {
    pub fn new(tool: T) -> Self {
        let descriptor = ToolDescriptor::of::<T::Input, T::Output>(
            tool.name(),
            tool.description(),
        );
        let accepts_context = tool.accepts_context();
        Self {
            tool,
            descriptor,
            accepts_context,
        }
    }
}

#[async_trait]
impl<T: BlockingTool> ToolObject for BlockingToolObject<T> {
    #[inline]
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn setup(&self) -> Result<(), Error> {
        self.tool.setup().await
    }

    async fn teardown(&self) -> Result<(), Error> {
        self.tool.teardown().await
    }

    fn invoke(
        self: Arc<Self>,
        arguments: Value,
        invocation_id: String,
        ctx: Option<RunContext>,
    ) -> BoxFuture<'static, ToolResult> {
        let name = self.descriptor.name().to_owned();
        let span = debug_span!(
            "tool execute",
            tool = %name,
            id = %invocation_id,
            blocking = true
        );

        let input: T::Input = match parse_input(arguments) {
            Ok(input) => input,
            Err(err) => {
                span.in_scope(|| debug!("rejected input: {err}"));
                return ready(ToolResult::failure(name, invocation_id, err))
                    .boxed();
            }
        };
        let ctx = ctx.filter(|_| self.accepts_context);

        async move {
            let worker_span = Span::current();
            let joined = spawn_blocking(move || {
                worker_span.in_scope(|| self.tool.execute(input, ctx))
            })
            .await;
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    Err(panic_to_error(&name, err.into_panic()))
                }
                Err(err) => Err(Error::unexpected()
                    .with_reason(format!("Unexpected error: {err}"))),
            };
            finish(name, invocation_id, outcome)
        }
        .instrument(span)
        .boxed()
    }
}

fn parse_input<I: DeserializeOwned>(arguments: Value) -> Result<I, Error> {
    serde_json::from_value(arguments).map_err(|err| {
        Error::invalid_input().with_reason(format!("Invalid input: {err}"))
    })
}

/// Serializes the output and reads it back as the declared type, so a
/// value that can't survive the trip (e.g. a non-finite float) is caught
/// here instead of confusing the model.
fn validate_output<O: Serialize + DeserializeOwned>(
    value: &O,
) -> Result<Value, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    serde_json::from_value::<O>(json.clone())?;
    Ok(json)
}

fn finish<O: Serialize + DeserializeOwned>(
    name: String,
    invocation_id: String,
    outcome: ExecuteResult<O>,
) -> ToolResult {
    let output = match outcome {
        Ok(output) => output,
        Err(err) => {
            if err.kind() == ErrorKind::Unexpected {
                error!("tool `{name}` failed: {}", err.reason());
            } else {
                warn!("tool `{name}` failed: {}", err.reason());
            }
            return ToolResult::failure(name, invocation_id, err);
        }
    };

    match validate_output(&output.value) {
        Ok(value) => {
            debug!("finished");
            ToolResult::success(
                name,
                invocation_id,
                value,
                output.raw,
                output.summary,
            )
        }
        Err(err) => {
            error!("tool `{name}` returned an invalid output: {err}");
            let err = Error::invalid_output()
                .with_reason(format!("Output validation failed: {err}"));
            ToolResult::failure(name, invocation_id, err)
        }
    }
}

fn panic_to_error(name: &str, panic: Box<dyn Any + Send>) -> Error {
    let message = if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    };
    error!("tool `{name}` panicked: {message}");
    Error::unexpected()
        .with_reason(format!("Unexpected error: tool panicked: {message}"))
}
