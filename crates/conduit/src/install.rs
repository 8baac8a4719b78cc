//! Requirement installer
//!
//! Writes the declared requirements to a temporary file and hands it to an
//! external install command. Failures are reported to the caller, which logs
//! them and carries on loading.

use std::io::Write;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

/// Errors from a requirement install
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to write requirements file: {0}")]
    TempFile(std::io::Error),

    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Failed to install some requirements ({status}): {stderr}")]
    Failed { status: String, stderr: String },
}

/// Runs an install command over a requirements file
#[derive(Debug, Clone, Default)]
pub struct RequirementInstaller {
    command: Vec<String>,
}

impl RequirementInstaller {
    /// Build from a whitespace-separated command line; the requirements file path is appended
    pub fn from_command_line(line: &str) -> Self {
        Self {
            command: line.split_whitespace().map(String::from).collect(),
        }
    }

    /// An installer that does nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.command.is_empty()
    }

    /// Install `requirements`. Blank entries and `#` comments are skipped.
    pub async fn install(&self, plugin_id: &str, requirements: &[String]) -> Result<(), InstallError> {
        let requirements = clean_requirements(requirements);
        if requirements.is_empty() {
            return Ok(());
        }
        let Some((program, args)) = self.command.split_first() else {
            debug!(plugin_id = %plugin_id, "Requirement installation disabled, skipping");
            return Ok(());
        };

        info!(plugin_id = %plugin_id, requirements = ?requirements, "Installing requirements");

        let mut file = tempfile::Builder::new()
            .prefix("requirements-")
            .suffix(".txt")
            .tempfile()
            .map_err(InstallError::TempFile)?;
        file.write_all(requirements.join("\n").as_bytes())
            .and_then(|_| file.flush())
            .map_err(InstallError::TempFile)?;

        let output = Command::new(program)
            .args(args)
            .arg(file.path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| InstallError::Spawn {
                command: self.command.join(" "),
                source,
            })?;

        if !output.status.success() {
            return Err(InstallError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(plugin_id = %plugin_id, "Requirements installed successfully");
        Ok(())
    }
}

fn clean_requirements(requirements: &[String]) -> Vec<String> {
    requirements
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && !r.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_clean_requirements() {
        let cleaned = clean_requirements(&reqs(&["  numpy ", "", "# comment", "opencv-python"]));
        assert_eq!(cleaned, vec!["numpy", "opencv-python"]);
    }

    #[tokio::test]
    async fn test_disabled_installer_is_noop() {
        let installer = RequirementInstaller::disabled();
        assert!(!installer.is_enabled());
        installer.install("p", &reqs(&["numpy"])).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_runs_command_with_file() {
        // `test -s FILE` succeeds when the requirements file is non-empty
        let installer = RequirementInstaller::from_command_line("test -s");
        installer.install("p", &reqs(&["numpy"])).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_reported() {
        let installer = RequirementInstaller::from_command_line("false");
        let err = installer.install("p", &reqs(&["numpy"])).await.unwrap_err();
        assert!(matches!(err, InstallError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_command_is_reported() {
        let installer = RequirementInstaller::from_command_line("conduit-no-such-installer");
        let err = installer.install("p", &reqs(&["numpy"])).await.unwrap_err();
        assert!(matches!(err, InstallError::Spawn { .. }));
    }
}
