use std::path::PathBuf;

use relay_core::tool::RegistryError;
use relay_core::{Agent, AgentBuilder, AgentError, RunStream};
use relay_model::ModelProvider;

use crate::config::RelayConfig;
use crate::tools::*;

/// A session builder.
///
/// See [`Session`].
pub struct SessionBuilder {
    agent_builder: AgentBuilder,
    output_dir: PathBuf,
    tools: Option<Vec<String>>,
}

impl SessionBuilder {
    /// Creates a session builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(
        provider: M,
    ) -> Self {
        let agent_builder = AgentBuilder::with_model_provider(provider);
        Self {
            agent_builder,
            output_dir: PathBuf::from("."),
            tools: None,
        }
    }

    /// Applies a loaded configuration. A system prompt set before is
    /// replaced by the configured one.
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        if let Some(output_dir) = config.output_dir {
            self.output_dir = output_dir;
        }
        if config.tools.is_some() {
            self.tools = config.tools;
        }
        self.agent_builder = self.agent_builder.with_config(config.agent);
        self
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.agent_builder = self.agent_builder.with_system_prompt(prompt);
        self
    }

    /// Sets the directory the `write_file` tool writes into.
    #[inline]
    pub fn with_output_dir<P: Into<PathBuf>>(mut self, output_dir: P) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Selects the built-in tools to register, by name. Unknown names are
    /// skipped; see [`RelayConfig::validate`].
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Builds a new session.
    pub fn build(self) -> Session {
        if let Some(tools) = &self.tools {
            for name in tools {
                if !BUILTIN_TOOLS.contains(&name.as_str()) {
                    warn!("skipping unknown tool `{name}`");
                }
            }
        }
        let enabled = |name: &str| {
            self.tools
                .as_ref()
                .is_none_or(|tools| tools.iter().any(|tool| tool == name))
        };

        let mut agent_builder = self.agent_builder;
        if enabled("calculator") {
            agent_builder =
                agent_builder.with_blocking_tool(CalculatorTool::new());
        }
        if enabled("write_file") {
            agent_builder =
                agent_builder.with_tool(WriteFileTool::new(self.output_dir));
        }

        Session {
            agent: agent_builder.build(),
        }
    }
}

/// A chat session, like a window that displays messages and has a input box.
///
/// The session holds a fully configured agent that you can use directly, and
/// it is basically a wrapper around [`Agent`]. Call [`start`](Self::start)
/// before the first message and [`close`](Self::close) after the last one.
pub struct Session {
    agent: Agent,
}

impl Session {
    /// Sets up the tools.
    pub async fn start(&mut self) -> Result<(), RegistryError> {
        self.agent.registry_mut().enter_scope().await
    }

    /// Tears down the tools.
    pub async fn close(&mut self) {
        self.agent.registry_mut().exit_scope().await;
    }

    /// Sends a message to the session and streams the reply.
    #[inline]
    pub fn send_message(&mut self, message: &str) -> RunStream<'_> {
        self.agent.run_stream(message)
    }

    /// Sends a message to the session and waits for the final answer.
    #[inline]
    pub async fn ask(&mut self, message: &str) -> Result<String, AgentError> {
        self.agent.run(message).await
    }

    /// Forgets the conversation so far.
    #[inline]
    pub fn reset(&mut self) {
        self.agent.reset();
    }

    /// Returns the underlying agent.
    #[inline]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}
