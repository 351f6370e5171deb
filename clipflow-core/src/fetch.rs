use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::FetchSection;
use crate::poller::ItemDescriptor;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to run fetch command {command}: {source}")]
    Spawn {
        source: std::io::Error,
        command: String,
    },
    #[error("fetch command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("fetch timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Materializes one source item as a local artifact. Progress output of the
/// underlying tool is advisory only; correctness is decided by the exit
/// status and the artifact on disk.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, item: &ItemDescriptor, dest: &Path) -> FetchResult<()>;
}

/// Subprocess fetcher with the anti-rate-limit pacing and credential
/// pass-through options the source tends to require.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    tool: String,
    format: String,
    cookies_file: Option<PathBuf>,
    sleep_interval_s: u32,
    max_sleep_interval_s: u32,
    sleep_requests_s: u32,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(section: &FetchSection) -> Self {
        Self {
            tool: section.tool.clone(),
            format: section.format.clone(),
            cookies_file: section.cookies_file.as_ref().map(PathBuf::from),
            sleep_interval_s: section.sleep_interval_s,
            max_sleep_interval_s: section.max_sleep_interval_s,
            sleep_requests_s: section.sleep_requests_s,
            timeout: Duration::from_secs(section.timeout_seconds),
        }
    }

    fn fetch_args(&self, source_url: &str, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.format.clone(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "-o".to_string(),
            dest.display().to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--sleep-interval".to_string(),
            self.sleep_interval_s.to_string(),
            "--max-sleep-interval".to_string(),
            self.max_sleep_interval_s.to_string(),
            "--sleep-requests".to_string(),
            self.sleep_requests_s.to_string(),
        ];
        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
        args.push(source_url.to_string());
        args
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, item: &ItemDescriptor, dest: &Path) -> FetchResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }

        let args = self.fetch_args(&item.source_url, dest);
        let command_line = format!("{} {}", self.tool, args.join(" "));
        let mut command = Command::new(&self.tool);
        command.kill_on_drop(true).args(&args);

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(FetchError::Spawn {
                    source,
                    command: command_line,
                })
            }
            Err(_) => {
                return Err(FetchError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        };
        if !output.status.success() {
            return Err(FetchError::CommandFailure {
                command: command_line,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(item_id = %item.id, dest = %dest.display(), "fetch completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_section() -> FetchSection {
        FetchSection {
            tool: "yt-dlp".to_string(),
            format: "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/bv*+ba/b".to_string(),
            cookies_file: None,
            sleep_interval_s: 5,
            max_sleep_interval_s: 10,
            sleep_requests_s: 3,
            timeout_seconds: 600,
        }
    }

    #[test]
    fn fetch_args_cover_format_output_and_pacing() {
        let fetcher = YtDlpFetcher::new(&fetch_section());
        let args = fetcher.fetch_args(
            "https://www.youtube.com/shorts/abc123",
            Path::new("/tmp/work/raw-abc123.mp4"),
        );
        let format_at = args.iter().position(|arg| arg == "-f").unwrap();
        assert!(args[format_at + 1].contains("ext=mp4"));
        let output_at = args.iter().position(|arg| arg == "-o").unwrap();
        assert_eq!(args[output_at + 1], "/tmp/work/raw-abc123.mp4");
        let sleep_at = args.iter().position(|arg| arg == "--sleep-interval").unwrap();
        assert_eq!(args[sleep_at + 1], "5");
        assert!(args.contains(&"--merge-output-format".to_string()));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/shorts/abc123");
        assert!(!args.contains(&"--cookies".to_string()));
    }

    #[test]
    fn fetch_args_pass_cookies_through() {
        let mut section = fetch_section();
        section.cookies_file = Some("cookies.txt".to_string());
        let fetcher = YtDlpFetcher::new(&section);
        let args = fetcher.fetch_args("https://example.com/v/1", Path::new("/tmp/out.mp4"));
        let cookies_at = args.iter().position(|arg| arg == "--cookies").unwrap();
        assert_eq!(args[cookies_at + 1], "cookies.txt");
    }
}
