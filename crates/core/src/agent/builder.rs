use relay_model::ModelProvider;
use tracing::Span;

use super::{Agent, AgentConfig, LoopState};
use crate::history::HistoryManager;
use crate::model_client::ModelClient;
use crate::tool::{BlockingTool, Tool, ToolRegistry};

/// [`Agent`] builder.
pub struct AgentBuilder {
    model_client: ModelClient,
    registry: ToolRegistry,
    config: AgentConfig,
    span: Span,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            registry: ToolRegistry::new(),
            config: AgentConfig::default(),
            span: Span::current(),
        }
    }

    /// Replaces the whole configuration.
    #[inline]
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the maximum number of model calls per run.
    #[inline]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.registry.register(tool);
        self
    }

    /// Registers a tool that blocks while executing.
    #[inline]
    pub fn with_blocking_tool<T: BlockingTool>(mut self, tool: T) -> Self {
        self.registry.register_blocking(tool);
        self
    }

    /// Uses an already populated registry, dropping tools registered so
    /// far.
    #[inline]
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Nests the agent's logs under `parent` instead of the span that was
    /// current when the builder was created.
    #[inline]
    pub fn with_span(mut self, parent: Span) -> Self {
        self.span = parent;
        self
    }

    /// Builds the agent.
    pub fn build(self) -> Agent {
        let AgentBuilder {
            model_client,
            mut registry,
            config,
            span: parent,
        } = self;

        let span = debug_span!(parent: &parent, "agent");
        registry.set_parent_span(&span);
        let mut history =
            HistoryManager::new(config.history.clone()).with_span(span.clone());
        if config.history.summarize {
            history = history.with_summarizer(model_client.clone());
        }

        Agent {
            model_client,
            registry,
            history,
            config,
            state: LoopState::Idle,
            span,
        }
    }
}
