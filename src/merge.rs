use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::MergeCommand;
use crate::error::MergeError;

#[async_trait]
pub trait PdfMerger: Send + Sync {
    /// Combines `inputs` in order into `output`.
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

/// Runs an external merge utility as `program args... inputs... output`.
pub struct CommandMerger {
    command: MergeCommand,
}

impl CommandMerger {
    pub fn new(command: MergeCommand) -> Self {
        Self { command }
    }

    fn build(&self, inputs: &[PathBuf], output: &Path) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args).args(inputs).arg(output);
        cmd
    }
}

#[async_trait]
impl PdfMerger for CommandMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        if let Some(missing) = inputs.iter().find(|path| !path.is_file()) {
            return Err(MergeError::MissingInput(missing.clone()));
        }

        let result = self
            .build(inputs, output)
            .output()
            .await
            .map_err(|source| MergeError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(MergeError::Failed {
                program: self.command.program.clone(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
