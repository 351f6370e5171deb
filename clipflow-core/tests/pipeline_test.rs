use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use clipflow_core::fetch::{FetchError, FetchResult, Fetcher};
use clipflow_core::pipeline::{artifact_stem, Outcome, Pipeline};
use clipflow_core::poller::ItemDescriptor;
use clipflow_core::probe::{DurationProbe, ProbeError, ProbeResult};
use clipflow_core::publish::{PublishError, PublishReceipt, PublishResult, Publisher};
use clipflow_core::routing::RoutingDecision;
use clipflow_core::transform::{TransformError, TransformResult, Transformer};
use clipflow_core::{load_clipflow_config, ClipflowConfig, HistoryStore};

fn test_config(temp: &TempDir) -> ClipflowConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/clipflow.toml");
    let mut config = load_clipflow_config(path).expect("fixture config should load");
    config.paths.base_dir = temp.path().to_string_lossy().to_string();
    config
}

fn item(id: &str) -> ItemDescriptor {
    ItemDescriptor {
        id: id.to_string(),
        title: format!("Clip {id}"),
        source_url: format!("https://example.com/v/{id}"),
        published_at: None,
    }
}

fn work_files(config: &ClipflowConfig) -> Vec<String> {
    match std::fs::read_dir(config.work_dir()) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[derive(Default)]
struct StubFetcher {
    fail: bool,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, item: &ItemDescriptor, dest: &Path) -> FetchResult<()> {
        self.calls.lock().unwrap().push(item.id.clone());
        if self.fail {
            return Err(FetchError::CommandFailure {
                command: "yt-dlp".to_string(),
                status: Some(1),
                stderr: "network unreachable".to_string(),
            });
        }
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, b"raw-bytes").unwrap();
        Ok(())
    }
}

struct StubProbe {
    duration: f64,
    fail: bool,
}

#[async_trait]
impl DurationProbe for StubProbe {
    async fn measure(&self, path: &Path) -> ProbeResult<f64> {
        if self.fail {
            return Err(ProbeError::MissingDuration {
                path: path.to_path_buf(),
            });
        }
        Ok(self.duration)
    }
}

#[derive(Default)]
struct StubTransformer {
    fail: bool,
    calls: Mutex<Vec<(PathBuf, PathBuf, f64, f64)>>,
}

#[async_trait]
impl Transformer for StubTransformer {
    async fn transform(
        &self,
        input: &Path,
        output: &Path,
        speed_factor: f64,
        target_duration_s: f64,
    ) -> TransformResult<()> {
        self.calls.lock().unwrap().push((
            input.to_path_buf(),
            output.to_path_buf(),
            speed_factor,
            target_duration_s,
        ));
        if self.fail {
            return Err(TransformError::CommandFailure {
                command: "ffmpeg".to_string(),
                status: Some(1),
                stderr: "filter graph failed".to_string(),
            });
        }
        std::fs::write(output, b"scaled-bytes").unwrap();
        Ok(())
    }
}

#[derive(Default)]
struct StubPublisher {
    failures_remaining: Mutex<u32>,
    calls: Mutex<Vec<(PathBuf, String)>>,
}

impl StubPublisher {
    fn failing(times: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(times),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Publisher for StubPublisher {
    async fn publish(&self, artifact: &Path, caption: &str) -> PublishResult<PublishReceipt> {
        self.calls
            .lock()
            .unwrap()
            .push((artifact.to_path_buf(), caption.to_string()));
        let mut failures = self.failures_remaining.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(PublishError::CommandFailure {
                command: "tiktok-cli".to_string(),
                status: Some(1),
                stderr: "upstream 503".to_string(),
            });
        }
        Ok(PublishReceipt {
            published_at: Utc::now(),
            detail: Some("upload id 1".to_string()),
        })
    }
}

fn build_pipeline(
    config: &ClipflowConfig,
    fetcher: Arc<StubFetcher>,
    probe: Arc<StubProbe>,
    transformer: Arc<StubTransformer>,
    publisher: Arc<StubPublisher>,
) -> Pipeline {
    let history = HistoryStore::open(config.history_path()).unwrap();
    Pipeline::new(config, history, fetcher, probe, transformer, publisher)
}

#[tokio::test]
async fn in_window_item_is_scaled_published_and_recorded() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 50.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(
        &config,
        fetcher.clone(),
        probe,
        transformer.clone(),
        publisher.clone(),
    );

    let run = pipeline.process(&item("v50")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::Published);
    assert_eq!(run.decision, Some(RoutingDecision::NeedsScaling));
    assert_eq!(run.measured_duration_s, Some(50.0));
    assert_eq!(run.speed_factor, Some(50.0 / 60.0));
    assert!(run.timings.fetch_ms.is_some());
    assert!(run.timings.probe_ms.is_some());
    assert!(run.timings.transform_ms.is_some());
    assert!(run.timings.publish_ms.is_some());

    let stem = artifact_stem("v50");
    let transforms = transformer.calls.lock().unwrap();
    assert_eq!(transforms.len(), 1);
    let (input, output, factor, target) = &transforms[0];
    assert!(input.ends_with(format!("raw-{stem}.mp4")));
    assert!(output.ends_with(format!("scaled-{stem}.mp4")));
    assert_eq!(*factor, 50.0 / 60.0);
    assert_eq!(*target, 60.0);

    let publishes = publisher.calls.lock().unwrap();
    assert_eq!(publishes.len(), 1);
    assert!(publishes[0].0.ends_with(format!("scaled-{stem}.mp4")));
    assert_eq!(publishes[0].1, "Clip v50");

    assert!(pipeline.history().is_handled("v50"));
    assert!(work_files(&config).is_empty(), "artifacts should be removed");
}

#[tokio::test]
async fn item_within_tolerance_is_published_without_transform() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 61.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(
        &config,
        fetcher,
        probe,
        transformer.clone(),
        publisher.clone(),
    );

    let run = pipeline.process(&item("v61")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::Published);
    assert_eq!(run.decision, Some(RoutingDecision::DirectUpload));
    assert_eq!(run.speed_factor, None);
    assert!(run.timings.transform_ms.is_none());

    assert!(transformer.calls.lock().unwrap().is_empty());
    let publishes = publisher.calls.lock().unwrap();
    assert!(publishes[0]
        .0
        .ends_with(format!("raw-{}.mp4", artifact_stem("v61"))));
    assert!(pipeline.history().is_handled("v61"));
}

#[tokio::test]
async fn too_short_item_is_skipped_and_still_recorded() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 30.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(
        &config,
        fetcher,
        probe,
        transformer.clone(),
        publisher.clone(),
    );

    let run = pipeline.process(&item("short")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::SkippedTooShort);
    assert!(transformer.calls.lock().unwrap().is_empty());
    assert!(publisher.calls.lock().unwrap().is_empty());
    assert!(work_files(&config).is_empty());

    // The skip must survive a restart.
    let reloaded = HistoryStore::open(config.history_path()).unwrap();
    assert!(reloaded.is_handled("short"));
}

#[tokio::test]
async fn over_long_item_is_skipped_out_of_range() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 400.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(&config, fetcher, probe, transformer, publisher.clone());

    let run = pipeline.process(&item("long")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::SkippedOutOfRange);
    assert_eq!(run.decision, Some(RoutingDecision::OutOfRange));
    assert!(publisher.calls.lock().unwrap().is_empty());
    assert!(pipeline.history().is_handled("long"));
}

#[tokio::test]
async fn failed_publish_keeps_the_artifact_and_leaves_the_item_retryable() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 50.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::failing(1));
    let mut pipeline = build_pipeline(
        &config,
        fetcher.clone(),
        probe,
        transformer,
        publisher.clone(),
    );

    let kept = config
        .work_dir()
        .join(format!("scaled-{}.mp4", artifact_stem("flaky")));

    let run = pipeline.process(&item("flaky")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::FailedKept);
    assert!(run.detail.unwrap().contains("upstream 503"));
    assert!(kept.exists(), "publishable artifact must be kept");
    assert!(!pipeline.history().is_handled("flaky"));

    // Next poll retries from scratch and succeeds.
    let run = pipeline.process(&item("flaky")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::Published);
    assert_eq!(fetcher.calls.lock().unwrap().len(), 2);
    assert_eq!(publisher.calls.lock().unwrap().len(), 2);
    assert!(pipeline.history().is_handled("flaky"));
    assert!(!kept.exists());
}

#[tokio::test]
async fn failed_fetch_discards_and_records_nothing() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher {
        fail: true,
        calls: Mutex::new(Vec::new()),
    });
    let probe = Arc::new(StubProbe {
        duration: 50.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(&config, fetcher, probe, transformer, publisher.clone());

    let run = pipeline.process(&item("gone")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::FailedDiscarded);
    assert!(run.decision.is_none());
    assert!(publisher.calls.lock().unwrap().is_empty());
    assert!(!pipeline.history().is_handled("gone"));
    assert!(work_files(&config).is_empty());
}

#[tokio::test]
async fn failed_probe_discards_the_fetched_artifact() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 0.0,
        fail: true,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(&config, fetcher, probe, transformer, publisher);

    let run = pipeline.process(&item("noprobe")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::FailedDiscarded);
    assert!(!pipeline.history().is_handled("noprobe"));
    assert!(work_files(&config).is_empty());
}

#[tokio::test]
async fn failed_transform_discards_both_artifacts() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 50.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer {
        fail: true,
        calls: Mutex::new(Vec::new()),
    });
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(&config, fetcher, probe, transformer, publisher.clone());

    let run = pipeline.process(&item("badfilter")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::FailedDiscarded);
    assert!(publisher.calls.lock().unwrap().is_empty());
    assert!(!pipeline.history().is_handled("badfilter"));
    assert!(work_files(&config).is_empty());
}

#[tokio::test]
async fn published_items_survive_a_restart_without_republishing() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let probe = Arc::new(StubProbe {
        duration: 61.0,
        fail: false,
    });
    let first_publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(
        &config,
        Arc::new(StubFetcher::default()),
        probe.clone(),
        Arc::new(StubTransformer::default()),
        first_publisher.clone(),
    );
    let run = pipeline.process(&item("repeat")).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::Published);
    drop(pipeline);

    // A fresh process reloads the ledger and must not upload again.
    let second_publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(
        &config,
        Arc::new(StubFetcher::default()),
        probe,
        Arc::new(StubTransformer::default()),
        second_publisher.clone(),
    );
    let result = pipeline.process(&item("repeat")).await.unwrap();
    assert!(result.is_none());
    assert_eq!(first_publisher.calls.lock().unwrap().len(), 1);
    assert!(second_publisher.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn handled_items_are_not_touched_again() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let mut history = HistoryStore::open(config.history_path()).unwrap();
    history.mark_handled("seen").unwrap();

    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 50.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = Pipeline::new(
        &config,
        history,
        fetcher.clone(),
        probe,
        transformer,
        publisher.clone(),
    );

    let result = pipeline.process(&item("seen")).await.unwrap();
    assert!(result.is_none());
    assert!(fetcher.calls.lock().unwrap().is_empty());
    assert!(publisher.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn captions_are_truncated_before_publishing() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let fetcher = Arc::new(StubFetcher::default());
    let probe = Arc::new(StubProbe {
        duration: 61.0,
        fail: false,
    });
    let transformer = Arc::new(StubTransformer::default());
    let publisher = Arc::new(StubPublisher::default());
    let mut pipeline = build_pipeline(&config, fetcher, probe, transformer, publisher.clone());

    let long_title = ItemDescriptor {
        title: "é".repeat(200),
        ..item("titled")
    };
    let run = pipeline.process(&long_title).await.unwrap().unwrap();
    assert_eq!(run.outcome, Outcome::Published);

    let publishes = publisher.calls.lock().unwrap();
    assert_eq!(publishes[0].1.chars().count(), 150);
}
