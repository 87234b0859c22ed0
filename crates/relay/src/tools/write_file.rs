use std::path::{Path, PathBuf};

use relay_core::RunContext;
use relay_core::tool::{Error as ToolError, ExecuteResult, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// The run context key under which the last written path is stored.
pub const LAST_WRITTEN_FILE: &str = "last_written_file";

#[derive(Deserialize, JsonSchema)]
pub struct WriteFileInput {
    #[schemars(description = "Name of the file. Directories are ignored.")]
    filename: String,
    #[schemars(description = "Content to write.")]
    content: String,
    #[schemars(description = "Whether to replace an existing file.")]
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct WriteFileOutput {
    #[schemars(description = "Path of the written file.")]
    pub filepath: String,
}

/// A tool for creating files inside one output directory.
///
/// Only the file name component of the requested name is used, so the
/// model can't write outside of the directory.
pub struct WriteFileTool {
    output_dir: PathBuf,
}

impl WriteFileTool {
    /// Creates a tool writing into `output_dir`. The directory is created
    /// on setup.
    #[inline]
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl Tool for WriteFileTool {
    type Input = WriteFileInput;
    type Output = WriteFileOutput;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Creates a file in the output directory with the given content and \
         returns its path. Existing files are kept unless `overwrite` is set."
    }

    fn accepts_context(&self) -> bool {
        true
    }

    async fn setup(&self) -> Result<(), ToolError> {
        fs::create_dir_all(&self.output_dir).await.map_err(|err| {
            ToolError::execution_error().with_reason(format!(
                "Failed to create `{}`: {err}",
                self.output_dir.display()
            ))
        })
    }

    #[allow(clippy::manual_async_fn)]
    fn execute(
        &self,
        input: WriteFileInput,
        ctx: Option<RunContext>,
    ) -> impl Future<Output = ExecuteResult<WriteFileOutput>> + Send + 'static
    {
        let output_dir = self.output_dir.clone();
        async move {
            let Some(name) = Path::new(&input.filename).file_name() else {
                return Err(ToolError::invalid_input().with_reason(format!(
                    "`{}` has no file name",
                    input.filename
                )));
            };
            let path = output_dir.join(name);

            if !input.overwrite && fs::try_exists(&path).await? {
                return Err(ToolError::execution_error().with_reason(format!(
                    "File already exists: {}. Set `overwrite` to replace it.",
                    name.to_string_lossy()
                )));
            }
            fs::write(&path, input.content).await?;
            debug!("wrote {}", path.display());

            if let Some(ctx) = ctx {
                ctx.set(LAST_WRITTEN_FILE, path.clone(), "write_file");
            }
            Ok(WriteFileOutput {
                filepath: path.display().to_string(),
            }
            .into())
        }
    }
}
