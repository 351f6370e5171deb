use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clipflow_core::{
    load_clipflow_config, ClipflowConfig, CycleStats, FeedPoller, FfmpegTransformer,
    FfprobeDurationProbe, HistoryStore, Pipeline, Scheduler, SourcePoller,
    UploadCommandPublisher, YtDlpFetcher, YtDlpPoller,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] clipflow_core::ConfigError),
    #[error("history error: {0}")]
    History(#[from] clipflow_core::HistoryError),
    #[error("source error: {0}")]
    Source(#[from] clipflow_core::PollError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Clipflow command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main clipflow.toml
    #[arg(long, default_value = "configs/clipflow.toml")]
    pub config: PathBuf,
    /// Override for the artifact work directory (replaces paths.work_dir)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
    /// Override for the history ledger file (replaces paths.history_file)
    #[arg(long)]
    pub history_file: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the source and process new items
    Run(RunArgs),
    /// Inspect the durable processing history
    #[command(subcommand)]
    History(HistoryCommands),
    /// Executes integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Process a single poll cycle, print its stats and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    /// Lists handled item ids, newest first
    List(HistoryListArgs),
}

#[derive(Args, Debug)]
pub struct HistoryListArgs {
    /// Maximum entries returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Runs basic checks
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();

    match &cli.command {
        Commands::Run(args) => {
            let context = AppContext::new(&cli)?;
            context.run_pipeline(args, cli.format)?;
        }
        Commands::History(HistoryCommands::List(args)) => {
            let context = AppContext::new(&cli)?;
            let list = context.history_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let context = AppContext::new(&cli)?;
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(args) => {
            let mut command = Cli::command();
            clap_complete::generate(args.shell, &mut command, "clipflowctl", &mut io::stdout());
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ClipflowConfig,
    config_path: PathBuf,
    work_dir: PathBuf,
    history_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_clipflow_config(&config_path)?;

        if let Some(dir) = &cli.work_dir {
            config.paths.work_dir = dir.display().to_string();
        }
        if let Some(file) = &cli.history_file {
            config.paths.history_file = file.display().to_string();
        }
        config.validate()?;

        let work_dir = config.work_dir();
        let history_path = config.history_path();

        Ok(Self {
            config,
            config_path,
            work_dir,
            history_path,
        })
    }

    fn run_pipeline(&self, args: &RunArgs, format: OutputFormat) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let (stop_tx, stop_rx) = watch::channel(false);
            let mut scheduler = self.build_scheduler(stop_rx)?;

            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        let _ = stop_tx.send(true);
                    }
                    Err(error) => {
                        warn!(%error, "ctrl-c handler unavailable; the run cannot be interrupted");
                        // Hold the stop handle open; dropping it reads
                        // as a stop request.
                        std::future::pending::<()>().await;
                    }
                }
            });

            if args.once {
                let stats = scheduler.run_cycle().await?;
                render(&stats, format)?;
            } else {
                info!(config = %self.config_path.display(), "starting continuous run");
                scheduler.run().await?;
                info!("stopped cleanly");
            }
            Ok(())
        })
    }

    /// Startup wiring. Failures here (unreadable ledger, unwritable work
    /// dir) are fatal; an unreachable source is not checked and shows up
    /// later as a soft listing error.
    fn build_scheduler(&self, stop: watch::Receiver<bool>) -> Result<Scheduler> {
        std::fs::create_dir_all(&self.work_dir)?;
        let history = HistoryStore::builder().path(&self.history_path).open()?;

        let config = &self.config;
        let poller: Arc<dyn SourcePoller> = Arc::new(
            YtDlpPoller::new(&config.source)
                .with_cookies(config.fetch.cookies_file.as_ref().map(PathBuf::from)),
        );
        let fallback: Option<Arc<dyn SourcePoller>> = match &config.source.fallback_feed_url {
            Some(url) => Some(Arc::new(FeedPoller::new(
                url.clone(),
                Duration::from_secs(config.source.list_timeout_seconds),
            )?)),
            None => None,
        };

        let pipeline = Pipeline::new(
            config,
            history,
            Arc::new(YtDlpFetcher::new(&config.fetch)),
            Arc::new(FfprobeDurationProbe::new(&config.probe)),
            Arc::new(FfmpegTransformer::new(&config.transform)),
            Arc::new(UploadCommandPublisher::new(&config.publish, None)),
        );

        Ok(Scheduler::new(
            poller,
            fallback,
            pipeline,
            &config.scheduler,
            stop,
        ))
    }

    fn history_list(&self, args: &HistoryListArgs) -> Result<HistoryList> {
        let store = HistoryStore::builder()
            .path(&self.history_path)
            .read_only(true)
            .open()?;
        let total = store.len();
        let rows: Vec<String> = store
            .ids()
            .iter()
            .rev()
            .take(args.limit)
            .cloned()
            .collect();
        Ok(HistoryList { total, rows })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("clipflow.toml", &self.config_path));
        results.push(self.check_directory("work dir", &self.work_dir));
        results.push(self.check_ledger());
        results.push(check_tool("list tool", &self.config.source.list_tool, "--version"));
        results.push(check_tool("fetch tool", &self.config.fetch.tool, "--version"));
        results.push(check_tool("probe tool", &self.config.probe.tool, "-version"));
        results.push(check_tool(
            "transform tool",
            &self.config.transform.tool,
            "-version",
        ));
        results.push(check_tool(
            "publish tool",
            &self.config.publish.tool,
            "--version",
        ));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::error(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                name,
                format!("{path} not created yet", path = path.display()),
            ),
        }
    }

    fn check_ledger(&self) -> HealthEntry {
        if !self.history_path.exists() {
            return HealthEntry::warn(
                "history ledger",
                format!("{} not created yet", self.history_path.display()),
            );
        }
        let store = HistoryStore::builder()
            .path(&self.history_path)
            .read_only(true)
            .open();
        match store {
            Ok(store) => HealthEntry::ok(
                "history ledger",
                format!("{} handled items", store.len()),
            ),
            Err(err) => HealthEntry::error("history ledger", format!("{err}")),
        }
    }
}

fn check_tool(name: &str, tool: &str, version_flag: &str) -> HealthEntry {
    let status = Command::new(tool)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => HealthEntry::ok(name, format!("{tool} available")),
        Ok(status) => HealthEntry::warn(name, format!("{tool} exited with {status}")),
        Err(err) => HealthEntry::error(name, format!("{tool}: {err}")),
    }
}

impl DisplayFallback for CycleStats {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("listed {} items, {} new", self.listed, self.new_items),
            format!("published: {}", self.published),
            format!(
                "skipped: {} too short, {} out of range",
                self.skipped_too_short, self.skipped_out_of_range
            ),
            format!(
                "failed: {} kept for retry, {} discarded",
                self.failed_kept, self.failed_discarded
            ),
            format!(
                "waited {} ms between uploads; cycle took {} s",
                self.total_wait_ms, self.duration_secs
            ),
        ];
        if !self.errors.is_empty() {
            lines.push("errors:".to_string());
            for error in &self.errors {
                lines.push(format!("  - {error}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryList {
    pub total: usize,
    pub rows: Vec<String>,
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Nothing handled yet".to_string();
        }
        let mut lines = vec![format!("{} of {} handled items:", self.rows.len(), self.total)];
        for id in &self.rows {
            lines.push(format!("  - {id}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(entry.display());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
