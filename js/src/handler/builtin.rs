//! Built-in staged handlers
//!
//! Placeholders for the media pipeline task types. Each walks a fixed list of
//! stages, sleeping per stage and reporting progress after each one. A task may
//! set `stage_delay_ms` in its config to override the per-stage delay.

use std::time::Duration;

use async_trait::async_trait;
use taskqueue::TaskRecord;
use tracing::{debug, info};

use super::{HandlerRegistry, HandlerResult, ProgressReporter, TaskHandler};

pub const BUILTIN_TASK_TYPES: [&str; 4] = [
    "video_translation",
    "audio_extraction",
    "subtitle_generation",
    "video_transcoding",
];

/// Walks named stages with a fixed delay per stage
#[derive(Debug, Clone)]
pub struct StagedHandler {
    stages: Vec<String>,
    stage_delay: Duration,
}

impl StagedHandler {
    pub fn new<I, S>(stages: I, stage_delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            stage_delay,
        }
    }

    /// `count` anonymous stages
    pub fn steps(count: usize, stage_delay: Duration) -> Self {
        Self::new((1..=count).map(|i| format!("step {i}")), stage_delay)
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    fn delay_for(&self, task: &TaskRecord) -> Duration {
        task.config
            .get("stage_delay_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.stage_delay)
    }
}

#[async_trait]
impl TaskHandler for StagedHandler {
    async fn run(&self, task: TaskRecord, progress: ProgressReporter) -> eyre::Result<HandlerResult> {
        debug!(task_id = %task.id, task_type = %task.task_type, input = ?task.input_file, "StagedHandler::run: called");
        let delay = self.delay_for(&task);
        let total = self.stages.len().max(1) as f64;

        for (i, stage) in self.stages.iter().enumerate() {
            if progress.is_cancelled().await {
                info!(task_id = %task.id, %stage, "Task cancelled, stopping early");
                return Ok(HandlerResult::failure("cancelled"));
            }
            tokio::time::sleep(delay).await;
            let percent = (i + 1) as f64 / total * 100.0;
            debug!(task_id = %task.id, %stage, percent, "StagedHandler::run: stage done");
            progress.report(percent).await;
        }

        Ok(HandlerResult::success())
    }
}

/// Register the built-in handlers for every type in [`BUILTIN_TASK_TYPES`]
pub fn register_builtins(registry: &mut HandlerRegistry) {
    debug!("register_builtins: called");
    registry.register(
        "video_translation",
        StagedHandler::new(
            [
                "audio_extraction",
                "transcription",
                "translation",
                "tts_generation",
                "video_mixing",
            ],
            Duration::from_secs(2),
        ),
    );
    registry.register("audio_extraction", StagedHandler::steps(10, Duration::from_millis(500)));
    registry.register("subtitle_generation", StagedHandler::steps(8, Duration::from_millis(300)));
    registry.register("video_transcoding", StagedHandler::steps(15, Duration::from_millis(200)));
}
