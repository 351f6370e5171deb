use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::TransformSection;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to run transform command {command}: {source}")]
    Spawn {
        source: std::io::Error,
        command: String,
    },
    #[error("transform command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("transform timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("speed factor {0} is not usable")]
    InvalidFactor(f64),
}

pub type TransformResult<T> = Result<T, TransformError>;

/// Applies the time-stretch that brings an artifact to the target duration.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(
        &self,
        input: &Path,
        output: &Path,
        speed_factor: f64,
        target_duration_s: f64,
    ) -> TransformResult<()>;
}

/// Decomposes a playback-rate factor into steps the audio tempo filter
/// accepts (each within [0.5, 2.0]); the product of the steps equals the
/// requested factor. Non-finite and non-positive factors have no
/// decomposition and yield an empty chain.
pub fn atempo_chain(factor: f64) -> Vec<f64> {
    if !factor.is_finite() || factor <= 0.0 {
        return Vec::new();
    }
    let mut steps = Vec::new();
    let mut remaining = factor;
    while remaining < 0.5 {
        steps.push(0.5);
        remaining /= 0.5;
    }
    while remaining > 2.0 {
        steps.push(2.0);
        remaining /= 2.0;
    }
    steps.push(remaining);
    steps
}

#[derive(Debug, Clone)]
pub struct FfmpegTransformer {
    tool: String,
    fps: u32,
    preset: String,
    timeout: Duration,
}

impl FfmpegTransformer {
    pub fn new(section: &TransformSection) -> Self {
        Self {
            tool: section.tool.clone(),
            fps: section.fps,
            preset: section.preset.clone(),
            timeout: Duration::from_secs(section.timeout_seconds),
        }
    }

    fn transform_args(
        &self,
        input: &Path,
        output: &Path,
        speed_factor: f64,
        target_duration_s: f64,
    ) -> Vec<String> {
        let audio_filter = atempo_chain(speed_factor)
            .into_iter()
            .map(|step| format!("atempo={step}"))
            .collect::<Vec<_>>()
            .join(",");
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-vf".to_string(),
            format!("setpts=PTS/{speed_factor}"),
            "-af".to_string(),
            audio_filter,
            "-r".to_string(),
            self.fps.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.preset.clone(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-t".to_string(),
            target_duration_s.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.display().to_string(),
        ]
    }
}

#[async_trait]
impl Transformer for FfmpegTransformer {
    async fn transform(
        &self,
        input: &Path,
        output: &Path,
        speed_factor: f64,
        target_duration_s: f64,
    ) -> TransformResult<()> {
        if !speed_factor.is_finite() || speed_factor <= 0.0 {
            return Err(TransformError::InvalidFactor(speed_factor));
        }

        let args = self.transform_args(input, output, speed_factor, target_duration_s);
        let command_line = format!("{} {}", self.tool, args.join(" "));
        let mut command = Command::new(&self.tool);
        command.kill_on_drop(true).args(&args);

        let result = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(TransformError::Spawn {
                    source,
                    command: command_line,
                })
            }
            Err(_) => {
                return Err(TransformError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        };
        if !result.status.success() {
            return Err(TransformError::CommandFailure {
                command: command_line,
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        debug!(
            input = %input.display(),
            output = %output.display(),
            speed_factor,
            "transform completed"
        );
        Ok(())
    }
}
