//! Per-job pipeline: stage results, the stage machine, and batch fan-out.
//!
//! Stage order is `insights -> transcript -> (speech ∥ music) -> merge ->
//! voice_cleanup`. Every stage moves from pending exactly once; skipped is
//! only ever derived from a prior stage's failure, never entered by running.

pub mod batch;
pub mod job;
pub mod steps;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::bytes::Bytes;

use crate::protocol::ServerMessage;
use crate::providers::{InsightBundle, TranscriptVariant};

/// Pipeline stage names as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Insights,
    Transcript,
    Speech,
    Music,
    Merge,
    VoiceCleanup,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Insights => "insights",
            Step::Transcript => "transcript",
            Step::Speech => "speech",
            Step::Music => "music",
            Step::Merge => "merge",
            Step::VoiceCleanup => "voice_cleanup",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

/// Outcome of one stage. Mutated only by its owning stage.
#[derive(Debug, Clone)]
pub struct StepResult<T> {
    pub status: StepStatus,
    pub payload: Option<T>,
    pub error: Option<String>,
}

impl<T> StepResult<T> {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            payload: None,
            error: None,
        }
    }

    pub fn success(payload: T) -> Self {
        Self {
            status: StepStatus::Success,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            payload: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Full per-job state: one [`StepResult`] per stage.
pub struct JobState {
    pub index: usize,
    pub location: String,
    pub insights: StepResult<InsightBundle>,
    pub transcript: StepResult<TranscriptVariant>,
    pub speech: StepResult<Bytes>,
    pub music: StepResult<Bytes>,
    pub merge: StepResult<()>,
    pub voice_cleanup: StepResult<()>,
}

impl JobState {
    pub fn new(index: usize, location: String) -> Self {
        Self {
            index,
            location,
            insights: StepResult::pending(),
            transcript: StepResult::pending(),
            speech: StepResult::pending(),
            music: StepResult::pending(),
            merge: StepResult::pending(),
            voice_cleanup: StepResult::pending(),
        }
    }

    /// True iff every content stage succeeded. Voice cleanup is a finalizer
    /// and does not count against the job.
    pub fn overall_success(&self) -> bool {
        self.insights.is_success()
            && self.transcript.is_success()
            && self.speech.is_success()
            && self.music.is_success()
            && self.merge.is_success()
    }

    /// Per-step outcome report sent when the job resolves, success or not.
    pub fn summary(&self) -> ServerMessage {
        fn entry<T>(result: &StepResult<T>) -> serde_json::Value {
            json!({"status": result.status, "error": result.error})
        }

        ServerMessage::Summary {
            index: self.index,
            location: self.location.clone(),
            steps: json!({
                "insights": entry(&self.insights),
                "transcript": entry(&self.transcript),
                "speech": entry(&self.speech),
                "music": entry(&self.music),
                "merge": entry(&self.merge),
            }),
            overall_success: self.overall_success(),
        }
    }
}
