//! Loading of configuration and model scripts from JSON files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use relay_core::AgentConfig;
use relay_test_model::PresetResponse;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tools::BUILTIN_TOOLS;

/// Errors raised while loading a file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read `{}`: {source}", path.display())]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// The file is not valid JSON of the expected shape.
    #[error("failed to parse `{}`: {source}", path.display())]
    Parse {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: serde_json::Error,
    },
    /// The configuration names a tool that is not built in.
    #[error("unknown tool `{name}` (available: {available:?})")]
    UnknownTool {
        /// The configured name.
        name: String,
        /// Names of the built-in tools.
        available: &'static [&'static str],
    },
}

/// Settings of a [`Session`](crate::Session). Every field is optional in
/// the file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Settings of the agent loop.
    pub agent: AgentConfig,
    /// Directory the `write_file` tool writes into. Defaults to the
    /// working directory.
    pub output_dir: Option<PathBuf>,
    /// Built-in tools to register, by name. All of them when absent.
    pub tools: Option<Vec<String>>,
}

impl RelayConfig {
    /// Checks that every configured tool is a built-in one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unknown = self
            .tools
            .iter()
            .flatten()
            .find(|name| !BUILTIN_TOOLS.contains(&name.as_str()));
        match unknown {
            Some(name) => Err(ConfigError::UnknownTool {
                name: name.clone(),
                available: BUILTIN_TOOLS,
            }),
            None => Ok(()),
        }
    }
}

/// Loads a [`RelayConfig`] from a JSON file and validates it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig, ConfigError> {
    let config: RelayConfig = load_json(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

/// Loads a list of scripted model responses from a JSON file.
pub fn load_script<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<PresetResponse>, ConfigError> {
    load_json(path.as_ref())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}
