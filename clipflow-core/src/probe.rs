use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ProbeSection;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run probe command {command}: {source}")]
    Spawn {
        source: std::io::Error,
        command: String,
    },
    #[error("probe command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("probe timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("failed to parse probe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("probe reported no usable duration for {path}")]
    MissingDuration { path: PathBuf },
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Measures the duration of a local artifact in seconds.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn measure(&self, path: &Path) -> ProbeResult<f64>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    tool: String,
    timeout: Duration,
}

impl FfprobeDurationProbe {
    pub fn new(section: &ProbeSection) -> Self {
        Self {
            tool: section.tool.clone(),
            timeout: Duration::from_secs(section.timeout_seconds),
        }
    }
}

#[async_trait]
impl DurationProbe for FfprobeDurationProbe {
    async fn measure(&self, path: &Path) -> ProbeResult<f64> {
        let command_line = format!("{} {}", self.tool, path.display());
        let mut command = Command::new(&self.tool);
        command
            .kill_on_drop(true)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg(path);

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ProbeError::Spawn {
                    source,
                    command: command_line,
                })
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        };
        if !output.status.success() {
            return Err(ProbeError::CommandFailure {
                command: command_line,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_duration(&output.stdout, path)
    }
}

fn parse_duration(stdout: &[u8], path: &Path) -> ProbeResult<f64> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    parsed
        .format
        .and_then(|format| format.duration)
        .and_then(|raw| raw.parse::<f64>().ok())
        // "nan" and "inf" parse as floats; neither is a duration.
        .filter(|duration| duration.is_finite() && *duration > 0.0)
        .ok_or_else(|| ProbeError::MissingDuration {
            path: path.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_read_from_the_format_block() {
        let stdout = br#"{"format": {"filename": "clip.mp4", "duration": "53.408000"}}"#;
        let duration = parse_duration(stdout, Path::new("clip.mp4")).unwrap();
        assert!((duration - 53.408).abs() < 1e-9);
    }

    #[test]
    fn missing_duration_is_an_error() {
        let stdout = br#"{"format": {"filename": "clip.mp4"}}"#;
        let err = parse_duration(stdout, Path::new("clip.mp4")).unwrap_err();
        assert!(matches!(err, ProbeError::MissingDuration { .. }));
    }

    #[test]
    fn unparsable_duration_is_an_error() {
        let stdout = br#"{"format": {"duration": "N/A"}}"#;
        assert!(parse_duration(stdout, Path::new("clip.mp4")).is_err());
    }

    #[test]
    fn non_finite_and_non_positive_durations_are_errors() {
        for raw in ["nan", "inf", "-inf", "0.0", "-3.5"] {
            let stdout = format!(r#"{{"format": {{"duration": "{raw}"}}}}"#);
            let err = parse_duration(stdout.as_bytes(), Path::new("clip.mp4")).unwrap_err();
            assert!(matches!(err, ProbeError::MissingDuration { .. }), "raw {raw}");
        }
    }
}
