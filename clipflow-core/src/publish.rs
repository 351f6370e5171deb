use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::info;

use crate::config::PublishSection;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to run publish command {command}: {source}")]
    Spawn {
        source: std::io::Error,
        command: String,
    },
    #[error("publish command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("publish timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

pub type PublishResult<T> = Result<T, PublishError>;

/// Proof that the upload tool accepted an artifact.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub published_at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// Hands a finished artifact to the destination platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, artifact: &Path, caption: &str) -> PublishResult<PublishReceipt>;
}

pub struct UploadCommandPublisher {
    tool: String,
    base_args: Vec<String>,
    account: String,
    timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for UploadCommandPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCommandPublisher")
            .field("tool", &self.tool)
            .field("base_args", &self.base_args)
            .field("account", &self.account)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl UploadCommandPublisher {
    pub fn new(section: &PublishSection, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            tool: section.tool.clone(),
            base_args: section.base_args.clone(),
            account: section.account.clone(),
            timeout: Duration::from_secs(section.timeout_seconds),
            executor,
        }
    }

    fn upload_args(&self, artifact: &Path, caption: &str) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--user".to_string());
        args.push(self.account.clone());
        args.push("-v".to_string());
        args.push(artifact.display().to_string());
        args.push("-t".to_string());
        args.push(caption.to_string());
        args
    }
}

#[async_trait]
impl Publisher for UploadCommandPublisher {
    async fn publish(&self, artifact: &Path, caption: &str) -> PublishResult<PublishReceipt> {
        let args = self.upload_args(artifact, caption);
        let command_line = format!("{} {}", self.tool, args.join(" "));
        let mut command = Command::new(&self.tool);
        command.kill_on_drop(true).args(&args);

        let output = match timeout(self.timeout, self.executor.run(&mut command)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(PublishError::Spawn {
                    source,
                    command: command_line,
                })
            }
            Err(_) => {
                return Err(PublishError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        // The exit status alone decides success; tool output is recorded
        // on the receipt, never interpreted.
        if !output.status.success() {
            return Err(PublishError::CommandFailure {
                command: command_line,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(artifact = %artifact.display(), account = %self.account, "publish accepted");
        Ok(PublishReceipt {
            published_at: Utc::now(),
            detail: if stdout.is_empty() { None } else { Some(stdout) },
        })
    }
}
