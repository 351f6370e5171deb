use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClipflowConfig {
    pub source: SourceSection,
    pub routing: RoutingSection,
    pub fetch: FetchSection,
    pub probe: ProbeSection,
    pub transform: TransformSection,
    pub publish: PublishSection,
    pub scheduler: SchedulerSection,
    pub paths: PathsSection,
}

impl ClipflowConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.work_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.history_file)
    }

    /// Startup validation. Violations abort the process before any
    /// collaborator is touched.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.source.channel_url).map_err(|err| {
            ConfigError::Invalid(format!(
                "source.channel_url is not a valid URL ({}): {err}",
                self.source.channel_url
            ))
        })?;
        if let Some(feed) = &self.source.fallback_feed_url {
            Url::parse(feed).map_err(|err| {
                ConfigError::Invalid(format!(
                    "source.fallback_feed_url is not a valid URL ({feed}): {err}"
                ))
            })?;
        }

        let routing = &self.routing;
        if routing.min_duration_s < 0.0 {
            return Err(ConfigError::Invalid(
                "routing.min_duration_s must not be negative".to_string(),
            ));
        }
        if routing.max_duration_s < routing.min_duration_s {
            return Err(ConfigError::Invalid(format!(
                "routing.max_duration_s ({}) must be >= routing.min_duration_s ({})",
                routing.max_duration_s, routing.min_duration_s
            )));
        }
        if routing.target_duration_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "routing.target_duration_s must be positive".to_string(),
            ));
        }
        if routing.direct_tolerance_s < 0.0 {
            return Err(ConfigError::Invalid(
                "routing.direct_tolerance_s must not be negative".to_string(),
            ));
        }

        if self.fetch.max_sleep_interval_s < self.fetch.sleep_interval_s {
            return Err(ConfigError::Invalid(
                "fetch.max_sleep_interval_s must be >= fetch.sleep_interval_s".to_string(),
            ));
        }

        if self.publish.caption_limit == 0 {
            return Err(ConfigError::Invalid(
                "publish.caption_limit must be at least 1".to_string(),
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.batch_size must be at least 1".to_string(),
            ));
        }
        if scheduler.item_delay_seconds[0] > scheduler.item_delay_seconds[1] {
            return Err(ConfigError::Invalid(format!(
                "scheduler.item_delay_seconds bounds are out of order: [{}, {}]",
                scheduler.item_delay_seconds[0], scheduler.item_delay_seconds[1]
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    pub channel_url: String,
    pub fallback_feed_url: Option<String>,
    pub list_tool: String,
    pub list_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    pub min_duration_s: f64,
    pub max_duration_s: f64,
    pub target_duration_s: f64,
    pub direct_tolerance_s: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    pub tool: String,
    pub format: String,
    pub cookies_file: Option<String>,
    pub sleep_interval_s: u32,
    pub max_sleep_interval_s: u32,
    pub sleep_requests_s: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    pub tool: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformSection {
    pub tool: String,
    pub fps: u32,
    pub preset: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishSection {
    pub tool: String,
    pub base_args: Vec<String>,
    pub account: String,
    pub caption_limit: usize,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    pub poll_interval_seconds: u64,
    pub batch_size: usize,
    pub item_delay_seconds: [u64; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub work_dir: String,
    pub history_file: String,
}

pub fn load_clipflow_config<P: AsRef<Path>>(path: P) -> Result<ClipflowConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
