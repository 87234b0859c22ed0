use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{join_all, ready};
use relay_model::{ModelTool, ToolCallRequest};
use serde_json::Value;
use tracing::{Instrument, Span};

use super::object::{AsyncToolObject, BlockingToolObject, ToolObject};
use super::{BlockingTool, Error, Tool, ToolDescriptor, ToolResult};
use crate::context::RunContext;

/// Lifecycle state of a registered tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Registered, `setup` not called yet.
    Unstarted,
    /// `setup` succeeded.
    Ready,
    /// `teardown` was attempted.
    TornDown,
}

/// Errors raised by [`ToolRegistry`] operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No tool is registered under the requested name.
    #[error("tool `{name}` not found (available: {available:?})")]
    ToolNotFound {
        /// The requested name.
        name: String,
        /// Registered names, in registration order.
        available: Vec<String>,
    },
    /// A tool failed to set up.
    #[error("failed to set up tool `{name}`: {reason}")]
    Setup {
        /// The failing tool.
        name: String,
        /// The reason reported by the tool.
        reason: String,
    },
}

struct Entry {
    tool: Arc<dyn ToolObject>,
    lifecycle: Lifecycle,
}

/// An object that owns the toolset and handles requests from the model.
///
/// Tools are kept in registration order. That order is the order of
/// `setup` calls and of the definitions advertised to the model, and its
/// reverse is the order of `teardown` calls.
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    span: Span,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_span(Span::none())
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry whose logs are nested under `parent`.
    pub fn with_span(parent: Span) -> Self {
        Self {
            entries: vec![],
            index: HashMap::new(),
            span: debug_span!(parent: &parent, "tool registry"),
        }
    }

    /// Nests the logs of this registry under `parent`.
    #[inline]
    pub fn set_parent_span(&mut self, parent: &Span) {
        self.span = debug_span!(parent: parent, "tool registry");
    }

    /// Registers an asynchronous tool, replacing any tool of the same name.
    pub fn register<T: Tool>(&mut self, tool: T) -> &mut Self {
        self.insert(Arc::new(AsyncToolObject::new(tool)))
    }

    /// Registers a blocking tool, replacing any tool of the same name.
    pub fn register_blocking<T: BlockingTool>(&mut self, tool: T) -> &mut Self {
        self.insert(Arc::new(BlockingToolObject::new(tool)))
    }

    fn insert(&mut self, tool: Arc<dyn ToolObject>) -> &mut Self {
        let name = tool.descriptor().name().to_owned();
        let entry = Entry {
            tool,
            lifecycle: Lifecycle::Unstarted,
        };
        if let Some(&idx) = self.index.get(&name) {
            self.span.in_scope(|| {
                warn!("tool `{name}` is already registered, overwriting");
            });
            self.entries[idx] = entry;
        } else {
            self.span.in_scope(|| debug!("tool registered: `{name}`"));
            self.index.insert(name, self.entries.len());
            self.entries.push(entry);
        }
        self
    }

    /// Removes the tool registered under `name`.
    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        let Some(idx) = self.index.remove(name) else {
            return Err(self.not_found(name));
        };
        self.entries.remove(idx);
        for pos in self.index.values_mut() {
            if *pos > idx {
                *pos -= 1;
            }
        }
        Ok(())
    }

    /// Returns the descriptor of the tool registered under `name`.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.lookup(name).map(|entry| entry.tool.descriptor())
    }

    /// Returns the lifecycle state of the tool registered under `name`.
    #[inline]
    pub fn lifecycle(&self, name: &str) -> Option<Lifecycle> {
        self.lookup(name).map(|entry| entry.lifecycle)
    }

    /// Returns registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.tool.descriptor().name().to_owned())
            .collect()
    }

    /// Returns the number of registered tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the descriptors of all tools in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .map(|entry| entry.tool.descriptor().clone())
            .collect()
    }

    /// Returns the tool definitions to advertise to the model.
    #[inline]
    pub fn model_tools(&self) -> Vec<ModelTool> {
        self.entries
            .iter()
            .map(|entry| entry.tool.descriptor().to_model_tool())
            .collect()
    }

    /// Calls `setup` of every tool in registration order.
    ///
    /// If one fails, the tools that are already set up are torn down again
    /// and the error is returned. Tools that are already ready are skipped.
    pub async fn enter_scope(&mut self) -> Result<(), RegistryError> {
        let span = self.span.clone();
        for idx in 0..self.entries.len() {
            let entry = &mut self.entries[idx];
            if entry.lifecycle == Lifecycle::Ready {
                continue;
            }
            let name = entry.tool.descriptor().name().to_owned();
            span.in_scope(|| debug!("setting up tool: `{name}`"));
            let result = entry.tool.setup().instrument(span.clone()).await;
            match result {
                Ok(()) => entry.lifecycle = Lifecycle::Ready,
                Err(err) => {
                    span.in_scope(|| {
                        error!("setup of `{name}` failed: {}", err.reason());
                    });
                    self.exit_scope().await;
                    return Err(RegistryError::Setup {
                        name,
                        reason: err.reason().into_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Calls `teardown` of every ready tool in reverse registration order.
    ///
    /// Failures (and panics) are logged and never stop the remaining tools
    /// from being torn down.
    pub async fn exit_scope(&mut self) {
        let span = self.span.clone();
        for entry in self.entries.iter_mut().rev() {
            if entry.lifecycle != Lifecycle::Ready {
                continue;
            }
            let name = entry.tool.descriptor().name().to_owned();
            span.in_scope(|| debug!("tearing down tool: `{name}`"));
            let result = AssertUnwindSafe(entry.tool.teardown())
                .catch_unwind()
                .instrument(span.clone())
                .await;
            entry.lifecycle = Lifecycle::TornDown;
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(_) => Error::unexpected().with_reason("teardown panicked"),
            };
            span.in_scope(|| {
                error!("error during teardown of `{name}`: {}", err.reason());
            });
        }
    }

    /// Runs one tool call.
    ///
    /// Tool failures are reported in the returned [`ToolResult`]; only an
    /// unknown tool name is an error here.
    pub async fn run_one(
        &self,
        name: &str,
        arguments: Value,
        invocation_id: &str,
        ctx: Option<&RunContext>,
    ) -> Result<ToolResult, RegistryError> {
        let Some(entry) = self.lookup(name) else {
            return Err(self.not_found(name));
        };
        let fut = Arc::clone(&entry.tool).invoke(
            arguments,
            invocation_id.to_owned(),
            ctx.cloned(),
        );
        Ok(fut.instrument(self.span.clone()).await)
    }

    /// Runs a batch of tool calls concurrently against the same context.
    ///
    /// Always returns one result per call, in the order of `calls`. A
    /// failing call, including one naming an unknown tool, never cancels
    /// the others.
    pub async fn run_many(
        &self,
        calls: Vec<ToolCallRequest>,
        ctx: Option<&RunContext>,
    ) -> Vec<ToolResult> {
        let span = debug_span!(parent: &self.span, "run many", calls = calls.len());
        let futs = calls.into_iter().map(|call| {
            let ToolCallRequest {
                id,
                name,
                arguments,
            } = call;
            match self.lookup(&name) {
                Some(entry) => {
                    trace!("spawning a tool ({id}) with args: {arguments:?}");
                    Arc::clone(&entry.tool).invoke(arguments, id, ctx.cloned())
                }
                None => {
                    warn!("tool not found: {name}");
                    let err = Error::not_found()
                        .with_reason(self.not_found(&name).to_string());
                    ready(ToolResult::failure(name, id, err)).boxed()
                }
            }
        });
        let futs: Vec<_> = span.in_scope(|| futs.collect());
        join_all(futs).instrument(span).await
    }

    #[inline]
    fn lookup(&self, name: &str) -> Option<&Entry> {
        self.index.get(name).map(|&idx| &self.entries[idx])
    }

    fn not_found(&self, name: &str) -> RegistryError {
        RegistryError::ToolNotFound {
            name: name.to_owned(),
            available: self.names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Barrier, Mutex};
    use std::time::Duration;

    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::tool::{ErrorKind, ExecuteResult, ToolOutput};

    #[derive(Deserialize, JsonSchema)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
    struct AddOutput {
        result: i64,
    }

    struct AddTool;

    impl Tool for AddTool {
        type Input = AddInput;
        type Output = AddOutput;

        fn name(&self) -> &str {
            "add"
        }

        fn description(&self) -> &str {
            "Adds two integers"
        }

        #[allow(clippy::manual_async_fn)]
        fn execute(
            &self,
            input: AddInput,
            ctx: Option<RunContext>,
        ) -> impl Future<Output = ExecuteResult<AddOutput>> + Send + 'static
        {
            async move {
                assert!(ctx.is_none(), "context must not be injected");
                Ok(AddOutput {
                    result: input.a + input.b,
                }
                .into())
            }
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct ValueInput {
        value: i64,
    }

    #[derive(Serialize, Deserialize, JsonSchema)]
    struct Ratio {
        ratio: f64,
    }

    /// Behaves according to `value`: 0 fails, 1 panics, 2 yields NaN,
    /// 3 stores into the context, anything else divides 1 by it.
    struct QuirkyTool {
        name: &'static str,
    }

    impl BlockingTool for QuirkyTool {
        type Input = ValueInput;
        type Output = Ratio;

        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Misbehaves on purpose"
        }

        fn accepts_context(&self) -> bool {
            true
        }

        fn execute(
            &self,
            input: ValueInput,
            ctx: Option<RunContext>,
        ) -> ExecuteResult<Ratio> {
            match input.value {
                0 => Err(Error::execution_error()
                    .with_reason("zero is not allowed")
                    .unrecoverable()),
                1 => panic!("boom"),
                2 => Ok(Ratio { ratio: f64::NAN }.into()),
                3 => {
                    let ctx = ctx.ok_or_else(Error::execution_error)?;
                    ctx.set("seen", 3i64, self.name);
                    Ok(ToolOutput::new(Ratio { ratio: 1.0 / 3.0 })
                        .with_raw(vec![3u8; 8])
                        .with_summary("stored"))
                }
                v => Ok(Ratio {
                    ratio: 1.0 / v as f64,
                }
                .into()),
            }
        }
    }

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct LifecycleTool {
        name: &'static str,
        log: EventLog,
        fail_setup: bool,
        fail_teardown: bool,
    }

    impl LifecycleTool {
        fn new(name: &'static str, log: &EventLog) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail_setup: false,
                fail_teardown: false,
            }
        }
    }

    impl Tool for LifecycleTool {
        type Input = ValueInput;
        type Output = i64;

        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Records its lifecycle"
        }

        async fn setup(&self) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("setup:{}", self.name));
            if self.fail_setup {
                return Err(Error::execution_error().with_reason("no gpu"));
            }
            Ok(())
        }

        async fn teardown(&self) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("teardown:{}", self.name));
            if self.fail_teardown {
                return Err(Error::execution_error().with_reason("stuck"));
            }
            Ok(())
        }

        #[allow(clippy::manual_async_fn)]
        fn execute(
            &self,
            input: ValueInput,
            _ctx: Option<RunContext>,
        ) -> impl Future<Output = ExecuteResult<i64>> + Send + 'static {
            async move { Ok(input.value.into()) }
        }
    }

    struct RendezvousTool {
        name: &'static str,
        barrier: Arc<Barrier>,
    }

    impl BlockingTool for RendezvousTool {
        type Input = ValueInput;
        type Output = i64;

        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Waits for its siblings"
        }

        fn execute(
            &self,
            input: ValueInput,
            _ctx: Option<RunContext>,
        ) -> ExecuteResult<i64> {
            self.barrier.wait();
            Ok(input.value.into())
        }
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_owned(),
            name: name.to_owned(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_run_one() {
        let mut registry = ToolRegistry::new();
        registry.register(AddTool);

        let result = registry
            .run_one("add", json!({ "a": 3, "b": 5 }), "call_1", None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.invocation_id(), "call_1");
        assert_eq!(result.tool_name(), "add");
        assert_eq!(result.output(), Some(&json!({ "result": 8 })));

        let err = registry
            .run_one("sub", json!({}), "call_2", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::ToolNotFound {
                name: "sub".to_owned(),
                available: vec!["add".to_owned()],
            }
        );
    }

    #[tokio::test]
    async fn test_missing_field_is_reported() {
        let mut registry = ToolRegistry::new();
        registry.register_blocking(QuirkyTool { name: "quirky" });

        let result = registry
            .run_one("quirky", json!({}), "call_1", None)
            .await
            .unwrap();
        let err = result.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.reason().contains("missing field `value`"));
        assert!(result.to_model_content().starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_failures_become_results() {
        let mut registry = ToolRegistry::new();
        registry.register_blocking(QuirkyTool { name: "quirky" });

        let declared = registry
            .run_one("quirky", json!({ "value": 0 }), "1", None)
            .await
            .unwrap();
        let err = declared.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert!(!err.is_recoverable());
        assert_eq!(
            declared.to_model_content(),
            "Error: zero is not allowed (not recoverable)"
        );

        let panicked = registry
            .run_one("quirky", json!({ "value": 1 }), "2", None)
            .await
            .unwrap();
        let err = panicked.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(err.reason().contains("boom"));

        let invalid = registry
            .run_one("quirky", json!({ "value": 2 }), "3", None)
            .await
            .unwrap();
        assert_eq!(invalid.error().unwrap().kind(), ErrorKind::InvalidOutput);

        let fine = registry
            .run_one("quirky", json!({ "value": 4 }), "4", None)
            .await
            .unwrap();
        assert_eq!(fine.output(), Some(&json!({ "ratio": 0.25 })));
    }

    #[tokio::test]
    async fn test_context_injection() {
        let mut registry = ToolRegistry::new();
        registry
            .register(AddTool)
            .register_blocking(QuirkyTool { name: "quirky" });
        let ctx = RunContext::new();

        let results = registry
            .run_many(
                vec![
                    call("1", "quirky", json!({ "value": 3 })),
                    call("2", "add", json!({ "a": 1, "b": 1 })),
                ],
                Some(&ctx),
            )
            .await;
        assert!(results.iter().all(ToolResult::is_success));
        assert_eq!(*ctx.get::<i64>("seen").unwrap(), 3);
        assert_eq!(ctx.summary()["seen"], "type=i64, source=quirky");
        assert_eq!(results[0].to_model_content(), "stored");
        assert_eq!(results[0].raw::<Vec<u8>>().map(Vec::len), Some(8));

        // Without a run context the tool sees `None` and reports it.
        let result = registry
            .run_one("quirky", json!({ "value": 3 }), "3", None)
            .await
            .unwrap();
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_run_many_keeps_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(AddTool)
            .register_blocking(QuirkyTool { name: "quirky" });

        let calls = vec![
            call("a", "quirky", json!({ "value": 1 })),
            call("b", "add", json!({ "a": 2, "b": 2 })),
            call("c", "missing", json!({})),
            call("d", "add", json!({ "a": "x" })),
            call("e", "quirky", json!({ "value": 5 })),
        ];
        let results = registry.run_many(calls, None).await;

        let ids: Vec<_> = results.iter().map(|r| r.invocation_id()).collect();
        assert_eq!(ids, ["a", "b", "c", "d", "e"]);
        let successes: Vec<_> =
            results.iter().map(ToolResult::is_success).collect();
        assert_eq!(successes, [false, true, false, false, true]);
        assert_eq!(results[2].error().unwrap().kind(), ErrorKind::NotFound);
        assert!(results[2].to_model_content().contains("quirky"));
    }

    #[tokio::test]
    async fn test_blocking_tools_run_in_parallel() {
        let barrier = Arc::new(Barrier::new(3));
        let mut registry = ToolRegistry::new();
        for name in ["r1", "r2", "r3"] {
            registry.register_blocking(RendezvousTool {
                name,
                barrier: Arc::clone(&barrier),
            });
        }

        let calls = ["r1", "r2", "r3"]
            .into_iter()
            .enumerate()
            .map(|(i, name)| call(&i.to_string(), name, json!({ "value": i })))
            .collect();
        // Each tool blocks until all three are running at the same time.
        let batch = registry.run_many(calls, None);
        let results = timeout(Duration::from_secs(5), batch)
            .await
            .expect("blocking tools must not run one after another");
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(ToolResult::is_success));
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let log = EventLog::default();
        let mut registry = ToolRegistry::new();
        let mut flaky = LifecycleTool::new("b", &log);
        flaky.fail_teardown = true;
        registry
            .register(LifecycleTool::new("a", &log))
            .register(flaky)
            .register(LifecycleTool::new("c", &log));
        assert_eq!(registry.lifecycle("a"), Some(Lifecycle::Unstarted));

        registry.enter_scope().await.unwrap();
        assert_eq!(registry.lifecycle("c"), Some(Lifecycle::Ready));
        registry.exit_scope().await;

        assert_eq!(
            *log.lock().unwrap(),
            [
                "setup:a",
                "setup:b",
                "setup:c",
                "teardown:c",
                "teardown:b",
                "teardown:a"
            ]
        );
        for name in ["a", "b", "c"] {
            assert_eq!(registry.lifecycle(name), Some(Lifecycle::TornDown));
        }
    }

    #[tokio::test]
    async fn test_setup_failure_rolls_back() {
        let log = EventLog::default();
        let mut registry = ToolRegistry::new();
        let mut broken = LifecycleTool::new("b", &log);
        broken.fail_setup = true;
        registry
            .register(LifecycleTool::new("a", &log))
            .register(broken)
            .register(LifecycleTool::new("c", &log));

        let err = registry.enter_scope().await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::Setup {
                name: "b".to_owned(),
                reason: "no gpu".to_owned(),
            }
        );
        assert_eq!(*log.lock().unwrap(), ["setup:a", "setup:b", "teardown:a"]);
        assert_eq!(registry.lifecycle("a"), Some(Lifecycle::TornDown));
        assert_eq!(registry.lifecycle("b"), Some(Lifecycle::Unstarted));
        assert_eq!(registry.lifecycle("c"), Some(Lifecycle::Unstarted));
    }

    #[test]
    fn test_overwrite_and_unregister() {
        let log = EventLog::default();
        let mut registry = ToolRegistry::new();
        registry
            .register(LifecycleTool::new("a", &log))
            .register(AddTool)
            .register(LifecycleTool::new("c", &log))
            .register_blocking(QuirkyTool { name: "add" });
        assert_eq!(registry.names(), ["a", "add", "c"]);
        assert_eq!(
            registry.get("add").unwrap().description(),
            "Misbehaves on purpose"
        );

        registry.unregister("a").unwrap();
        assert_eq!(registry.names(), ["add", "c"]);
        assert!(registry.get("c").is_some());
        assert!(registry.unregister("a").is_err());

        let tools = registry.model_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "add");
    }
}
