pub mod config;
pub mod error;
pub mod fetch;
pub mod history;
pub mod pipeline;
pub mod poller;
pub mod probe;
pub mod publish;
pub mod routing;
pub mod scheduler;
pub mod transform;

pub use config::{
    load_clipflow_config, ClipflowConfig, FetchSection, PathsSection, ProbeSection,
    PublishSection, RoutingSection, SchedulerSection, SourceSection, TransformSection,
};
pub use error::{ConfigError, Result};
pub use fetch::{FetchError, FetchResult, Fetcher, YtDlpFetcher};
pub use history::{HistoryError, HistoryResult, HistoryStore, HistoryStoreBuilder};
pub use pipeline::{artifact_stem, Outcome, Pipeline, PipelineRun, StageTimings};
pub use poller::{
    FeedPoller, ItemDescriptor, PollError, PollResult, SourcePoller, YtDlpPoller,
};
pub use probe::{DurationProbe, FfprobeDurationProbe, ProbeError, ProbeResult};
pub use publish::{
    CommandExecutor, PublishError, PublishReceipt, PublishResult, Publisher,
    SystemCommandExecutor, UploadCommandPublisher,
};
pub use routing::{classify, speed_factor, RoutingDecision};
pub use scheduler::{CycleStats, Scheduler};
pub use transform::{
    atempo_chain, FfmpegTransformer, TransformError, TransformResult, Transformer,
};
