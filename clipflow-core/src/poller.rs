use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::SourceSection;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to run listing command {command}: {source}")]
    Spawn {
        source: std::io::Error,
        command: String,
    },
    #[error("listing command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("listing command timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("failed to parse listing output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("feed request failed: {0}")]
    Feed(#[from] reqwest::Error),
    #[error("http client setup failed: {0}")]
    Client(String),
}

pub type PollResult<T> = Result<T, PollError>;

/// One discovered source item. Immutable; lives for a single poll cycle and
/// only its id outlives it, via the history ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    pub id: String,
    pub title: String,
    pub source_url: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Enumerates the most recent items of the content source. Stateless: the
/// ledger, not the poller, decides what is new.
#[async_trait]
pub trait SourcePoller: Send + Sync {
    async fn latest_items(&self, limit: usize) -> PollResult<Vec<ItemDescriptor>>;
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<Option<FlatEntry>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    upload_date: Option<String>,
}

/// Primary poller: flat-playlist enumeration through the configured listing
/// tool, one JSON document on stdout.
#[derive(Debug, Clone)]
pub struct YtDlpPoller {
    tool: String,
    channel_url: String,
    cookies_file: Option<PathBuf>,
    timeout: Duration,
}

impl YtDlpPoller {
    pub fn new(source: &SourceSection) -> Self {
        Self {
            tool: source.list_tool.clone(),
            channel_url: source.channel_url.clone(),
            cookies_file: None,
            timeout: Duration::from_secs(source.list_timeout_seconds),
        }
    }

    pub fn with_cookies(mut self, path: Option<PathBuf>) -> Self {
        self.cookies_file = path;
        self
    }

    fn list_args(&self, limit: usize) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            "--flat-playlist".to_string(),
            "--playlist-end".to_string(),
            limit.to_string(),
            "--no-warnings".to_string(),
        ];
        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
        args.push(self.channel_url.clone());
        args
    }
}

#[async_trait]
impl SourcePoller for YtDlpPoller {
    async fn latest_items(&self, limit: usize) -> PollResult<Vec<ItemDescriptor>> {
        let args = self.list_args(limit);
        let command_line = format!("{} {}", self.tool, args.join(" "));
        let mut command = Command::new(&self.tool);
        command.kill_on_drop(true).args(&args);

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(PollError::Spawn {
                    source,
                    command: command_line,
                })
            }
            Err(_) => {
                return Err(PollError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        };
        if !output.status.success() {
            return Err(PollError::CommandFailure {
                command: command_line,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let playlist: FlatPlaylist = serde_json::from_slice(&output.stdout)?;
        let items = parse_flat_entries(playlist, limit);
        debug!(items = items.len(), "listing poll completed");
        Ok(items)
    }
}

fn parse_flat_entries(playlist: FlatPlaylist, limit: usize) -> Vec<ItemDescriptor> {
    playlist
        .entries
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let id = entry.id?;
            let source_url = entry
                .url
                .unwrap_or_else(|| format!("https://www.youtube.com/shorts/{id}"));
            Some(ItemDescriptor {
                title: entry.title.unwrap_or_else(|| "Untitled".to_string()),
                source_url,
                published_at: entry.upload_date.as_deref().and_then(parse_upload_date),
                id,
            })
        })
        .take(limit)
        .collect()
}

fn parse_upload_date(raw: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}

/// Fallback poller: fetches the channel's XML feed and extracts entries
/// without a full XML parser. Used when the primary listing errors.
#[derive(Debug, Clone)]
pub struct FeedPoller {
    feed_url: String,
    client: Client,
    entry_regex: Regex,
    id_regex: Regex,
    title_regex: Regex,
    link_regex: Regex,
    published_regex: Regex,
}

impl FeedPoller {
    pub fn new(feed_url: impl Into<String>, timeout: Duration) -> PollResult<Self> {
        let client = Client::builder()
            .user_agent("clipflow/0.1")
            .timeout(timeout)
            .build()
            .map_err(|err| PollError::Client(err.to_string()))?;
        Ok(Self {
            feed_url: feed_url.into(),
            client,
            entry_regex: Regex::new(r"(?s)<entry>(.*?)</entry>").expect("valid regex"),
            id_regex: Regex::new(r"<yt:videoId>([^<]+)</yt:videoId>").expect("valid regex"),
            title_regex: Regex::new(r"<title>([^<]*)</title>").expect("valid regex"),
            link_regex: Regex::new(r#"<link rel="alternate" href="([^"]+)""#)
                .expect("valid regex"),
            published_regex: Regex::new(r"<published>([^<]+)</published>").expect("valid regex"),
        })
    }

    fn parse_feed(&self, body: &str, limit: usize) -> Vec<ItemDescriptor> {
        self.entry_regex
            .captures_iter(body)
            .filter_map(|entry| {
                let block = entry.get(1)?.as_str();
                let id = self.id_regex.captures(block)?.get(1)?.as_str().to_string();
                let title = self
                    .title_regex
                    .captures(block)
                    .and_then(|cap| cap.get(1))
                    .map(|m| unescape_xml(m.as_str()))
                    .unwrap_or_else(|| "Untitled".to_string());
                let source_url = self
                    .link_regex
                    .captures(block)
                    .and_then(|cap| cap.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}"));
                let published_at = self
                    .published_regex
                    .captures(block)
                    .and_then(|cap| cap.get(1))
                    .and_then(|m| DateTime::parse_from_rfc3339(m.as_str()).ok())
                    .map(|stamp| stamp.with_timezone(&Utc));
                Some(ItemDescriptor {
                    id,
                    title,
                    source_url,
                    published_at,
                })
            })
            .take(limit)
            .collect()
    }
}

#[async_trait]
impl SourcePoller for FeedPoller {
    async fn latest_items(&self, limit: usize) -> PollResult<Vec<ItemDescriptor>> {
        let response = self.client.get(&self.feed_url).send().await?;
        let body = response.error_for_status()?.text().await?;
        let items = self.parse_feed(&body, limit);
        debug!(items = items.len(), "feed poll completed");
        Ok(items)
    }
}

// `&amp;` goes last so a literal `&amp;lt;` comes out as `&lt;`, not `<`.
fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
