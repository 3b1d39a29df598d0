//! Checksum finalizer seam
//!
//! The manifest checksum covers the file with its own checksum field
//! cleared, so it can only be computed after a first materialization
//! exists on disk. The computation itself is delegated to an external
//! utility; this module owns only the obligation to run it and parse its
//! output. The seam is a trait so tests can stub the provider without
//! spawning a process.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Default checksum utility name, resolved via `PATH`.
pub const DEFAULT_CRC_TOOL: &str = "calc_crc_clear";

/// Errors from the checksum utility. All of these are terminal for the
/// task being fetched: a tool failure is an environment problem, not a
/// transient network condition, so it is never retried.
#[derive(Debug, thiserror::Error)]
pub enum CrcError {
    #[error("Failed to execute checksum tool {tool:?}: {source}")]
    Spawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum tool exited with {status}: {stderr}")]
    Failed {
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Checksum tool printed unparsable output {output:?}")]
    Parse { output: String },
}

/// Capability that computes the cleared-manifest checksum of a file.
#[async_trait]
pub trait CrcProvider: Send + Sync {
    async fn crc_clear(&self, path: &Path) -> Result<u32, CrcError>;
}

/// Checksum provider backed by an external subprocess.
///
/// Invokes `<tool> <path>` and parses a single integer from stdout.
pub struct ExternalCrcTool {
    tool: PathBuf,
}

impl ExternalCrcTool {
    /// Use a specific tool binary.
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }
}

impl Default for ExternalCrcTool {
    fn default() -> Self {
        Self::new(DEFAULT_CRC_TOOL)
    }
}

#[async_trait]
impl CrcProvider for ExternalCrcTool {
    async fn crc_clear(&self, path: &Path) -> Result<u32, CrcError> {
        let output = Command::new(&self.tool)
            .arg(path)
            .output()
            .await
            .map_err(|e| CrcError::Spawn {
                tool: self.tool.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(CrcError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        trimmed.parse().map_err(|_| CrcError::Parse {
            output: trimmed.to_string(),
        })
    }
}
