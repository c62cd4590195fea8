//! Per-job orchestrator: drives one location's stage sequence.
//!
//! Stage failures stay inside their [`StepResult`]; only provisioning
//! failures (cloning, slot acquisition) surface as [`JobError`] and become a
//! job-scoped error message. Either way the voice finalizer runs whenever a
//! slot was acquired, and a summary is always the job's last word.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::bytes::Bytes;

use crate::pipeline::steps;
use crate::pipeline::{JobState, Step, StepResult};
use crate::protocol::{ClientSender, ServerMessage};
use crate::providers::{AdRequest, AdType, Providers, VoiceData};
use crate::slots::{AcquireError, ReservationId, SlotGuard, SlotPool, SlotStatus};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no reservation ticket provided for a custom ad")]
    MissingReservation,
    #[error("invalid reservation or no slots available")]
    InvalidReservation,
    #[error("voice cloning failed: {0}")]
    CloneFailed(String),
    #[error("slot acquisition failed after voice cloning: {0}")]
    SlotAcquire(AcquireError),
    #[error("failed to fetch cloned voice data: {0}")]
    VoiceLookup(String),
    #[error("no voices available for this request")]
    NoVoiceAvailable,
}

/// Everything a job needs besides its own request slice.
#[derive(Clone)]
pub struct JobContext {
    pub sender: ClientSender,
    pub providers: Providers,
    pub pool: Arc<SlotPool>,
    pub acquire_timeout: Duration,
}

enum JobOutcome {
    /// The stage sequence ran to its end, possibly with failed stages.
    Completed,
    /// A precondition stage failed; later stages were never started.
    Halted,
}

/// Run one job to resolution. Never returns an error and never panics
/// upward by design of its callees; a panic inside a collaborator is caught
/// at the fan-out join.
pub async fn run_job(
    ctx: JobContext,
    index: usize,
    request: Arc<AdRequest>,
    voices: Arc<Vec<VoiceData>>,
    recordings: Arc<Vec<Bytes>>,
) {
    let location = request.locations[index].clone();
    let mut state = JobState::new(index, location.name.clone());
    let mut held: Option<SlotGuard> = None;

    tracing::info!(index, location = %location.name, "Starting job");

    let outcome = run_stages(
        &ctx,
        &mut state,
        &mut held,
        &request,
        &location,
        &voices,
        &recordings,
    )
    .await;

    if let Some(guard) = held.take() {
        finalize_voice(&ctx, &mut state, guard).await;
    }

    match outcome {
        Ok(JobOutcome::Completed) => {
            ctx.sender.send(ServerMessage::Done { index }).await;
        }
        Ok(JobOutcome::Halted) => {
            tracing::warn!(index, "Job halted before audio stages");
        }
        Err(e) => {
            tracing::error!(index, error = %e, "Job failed");
            ctx.sender
                .send(ServerMessage::Error {
                    index,
                    step: None,
                    message: format!("Unexpected error: {e}"),
                })
                .await;
        }
    }

    ctx.sender.send(state.summary()).await;
}

async fn run_stages(
    ctx: &JobContext,
    state: &mut JobState,
    held: &mut Option<SlotGuard>,
    request: &AdRequest,
    location: &crate::providers::Location,
    voices: &[VoiceData],
    recordings: &[Bytes],
) -> Result<JobOutcome, JobError> {
    let mut voice: Option<VoiceData> = None;

    if request.ad_type == AdType::Custom {
        let (cloned, guard) = provision_custom_voice(ctx, request, recordings).await?;
        voice = Some(cloned);
        *held = Some(guard);
    }

    state.insights = steps::insights::gather_insights(
        &ctx.sender,
        &ctx.providers,
        state.index,
        location,
        request.use_weather,
        request.forecast_type,
    )
    .await;
    let Some(insights) = state.insights.payload.clone() else {
        return Ok(JobOutcome::Halted);
    };

    state.transcript = steps::transcript::generate_transcript(
        &ctx.sender,
        &ctx.providers,
        state.index,
        request,
        location,
        voices,
        &insights,
    )
    .await;
    let Some(variant) = state.transcript.payload.clone() else {
        return Ok(JobOutcome::Halted);
    };

    let voice = match voice {
        Some(voice) => voice,
        None => select_library_voice(voices, &variant.voice_model)
            .ok_or(JobError::NoVoiceAvailable)?
            .clone(),
    };

    // Independent failure domains: both awaited to completion, no
    // cancellation on sibling failure.
    let (speech, music) = tokio::join!(
        steps::speech::generate_speech(&ctx.sender, &ctx.providers, state.index, &variant, &voice),
        steps::music::generate_music(
            &ctx.sender,
            &ctx.providers,
            state.index,
            &variant.music_prompt
        ),
    );
    state.speech = speech;
    state.music = music;

    let speech_audio = state.speech.payload.clone();
    let music_audio = state.music.payload.clone();
    state.merge = match (speech_audio, music_audio) {
        (Some(speech), Some(music)) => {
            steps::merge::merge_audio(&ctx.sender, &ctx.providers, state.index, speech, music)
                .await
        }
        _ => {
            let mut failing = Vec::new();
            if !state.speech.is_success() {
                failing.push(Step::Speech.as_str());
            }
            if !state.music.is_success() {
                failing.push(Step::Music.as_str());
            }
            StepResult::skipped(format!("Skipped due to {} failure", failing.join(" and ")))
        }
    };

    Ok(JobOutcome::Completed)
}

/// Custom-voice provisioning: validate the ticket, clone, then convert the
/// ticket into a slot. The clone call is externally billed, so an acquire
/// failure compensates by deleting the voice it just created.
async fn provision_custom_voice(
    ctx: &JobContext,
    request: &AdRequest,
    recordings: &[Bytes],
) -> Result<(VoiceData, SlotGuard), JobError> {
    let ticket = request
        .slot_reservation_id
        .as_deref()
        .ok_or(JobError::MissingReservation)?;
    let ticket = ReservationId::from_raw(ticket);

    if !ctx.pool.has_available_slot(Some(&ticket)).await {
        return Err(JobError::InvalidReservation);
    }
    if recordings.is_empty() {
        return Err(JobError::CloneFailed(
            "no voice recordings supplied".to_string(),
        ));
    }

    let voice_id = ctx
        .providers
        .speech
        .clone_voice(recordings, request.clone_language.as_deref())
        .await
        .map_err(|e| JobError::CloneFailed(e.to_string()))?;

    let guard = match ctx
        .pool
        .acquire(&voice_id, &ticket, ctx.acquire_timeout)
        .await
    {
        Ok(guard) => guard,
        Err(e) => {
            // The voice exists externally but never landed in a slot.
            if let Err(delete_err) = ctx.providers.speech.delete_voice(&voice_id).await {
                tracing::error!(
                    voice_id,
                    error = %delete_err,
                    "Failed to delete voice after slot acquisition failure"
                );
            }
            return Err(JobError::SlotAcquire(e));
        }
    };

    match ctx.providers.speech.voice(&voice_id).await {
        Ok(voice) => Ok((voice, guard)),
        Err(e) => {
            if let Err(delete_err) = ctx.providers.speech.delete_voice(&voice_id).await {
                tracing::error!(
                    voice_id,
                    error = %delete_err,
                    "Failed to delete voice after lookup failure"
                );
            }
            guard.release().await;
            Err(JobError::VoiceLookup(e.to_string()))
        }
    }
}

/// Finalizer for a held custom voice: delete the external voice, record the
/// slot's final status, release the slot. Runs regardless of upstream
/// outcome.
async fn finalize_voice(ctx: &JobContext, state: &mut JobState, guard: SlotGuard) {
    let voice_id = guard.voice_id().to_string();
    let status = if state.merge.is_success() {
        SlotStatus::Completed
    } else {
        SlotStatus::Error
    };

    state.voice_cleanup = match ctx.providers.speech.delete_voice(&voice_id).await {
        Ok(()) => StepResult::success(()),
        Err(e) => {
            tracing::error!(voice_id, error = %e, "Failed to delete cloned voice");
            StepResult::failed(format!("Voice deletion failed: {e}"))
        }
    };

    ctx.pool.update_status(&voice_id, status).await;
    tracing::info!(voice_id, ?status, "Cleaned up custom voice");
    guard.release().await;
}

/// Default-voice selection: case-insensitive match on the generator's named
/// voice model, falling back to the last library voice.
fn select_library_voice<'a>(voices: &'a [VoiceData], voice_model: &str) -> Option<&'a VoiceData> {
    let wanted = voice_model.to_lowercase();
    voices
        .iter()
        .find(|voice| voice.voice_name.to_lowercase() == wanted)
        .or_else(|| voices.last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil::{
        CLONED_VOICE_ID, MockCollaborators, Scenario, client_channel, drain, library, location,
    };
    use crate::protocol::{AudioHeader, OutboundFrame, decode_audio_frame};
    use crate::slots::{MemoryStore, SlotStore, StoreError, StoreOp};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    const SLOT_TTL: Duration = Duration::from_secs(3600);

    fn request(ad_type: AdType, ticket: Option<&ReservationId>) -> Arc<AdRequest> {
        Arc::new(AdRequest {
            product_name: "Solar kettle".to_string(),
            product_summary: "Boils water with sunlight".to_string(),
            offer_summary: "20% off".to_string(),
            cta: "Order today".to_string(),
            locations: vec![location()],
            ad_type,
            slot_reservation_id: ticket.map(|t| t.as_str().to_string()),
            use_weather: false,
            forecast_type: None,
            clone_language: None,
        })
    }

    struct Harness {
        ctx: JobContext,
        rx: mpsc::Receiver<OutboundFrame>,
        mock: Arc<MockCollaborators>,
        pool: Arc<SlotPool>,
    }

    fn harness(scenario: Scenario, store: Arc<dyn SlotStore>) -> Harness {
        let mock = MockCollaborators::new(scenario);
        let (sender, rx) = client_channel();
        let pool = Arc::new(SlotPool::new(store, 1, SLOT_TTL));
        let ctx = JobContext {
            sender,
            providers: mock.providers(),
            pool: Arc::clone(&pool),
            acquire_timeout: Duration::from_secs(5),
        };
        Harness { ctx, rx, mock, pool }
    }

    async fn run(harness: &mut Harness, request: Arc<AdRequest>, recordings: Vec<Bytes>) {
        run_job(
            harness.ctx.clone(),
            0,
            request,
            Arc::new(library()),
            Arc::new(recordings),
        )
        .await;
    }

    fn summary_of(control: &[crate::protocol::ServerMessage]) -> (serde_json::Value, bool) {
        let Some(ServerMessage::Summary {
            steps,
            overall_success,
            ..
        }) = control.last()
        else {
            panic!("summary must be the job's last message");
        };
        (steps.clone(), *overall_success)
    }

    #[tokio::test]
    async fn default_ad_runs_every_stage_and_reports_done() {
        let mut h = harness(Scenario::default(), Arc::new(MemoryStore::new()));
        run(&mut h, request(AdType::Default, None), Vec::new()).await;

        let (control, audio) = drain(&mut h.rx);
        assert!(matches!(control[0], ServerMessage::Insight { .. }));
        assert!(control.iter().any(|m| matches!(m, ServerMessage::Done { index: 0 })));

        let (steps, overall) = summary_of(&control);
        assert!(overall);
        assert_eq!(steps["merge"]["status"], "success");

        // One speech frame and one merged frame.
        assert_eq!(audio.len(), 2);
        let (header, _) = decode_audio_frame(&audio[1]).unwrap();
        assert_eq!(header, AudioHeader::Merged { index: 0 });

        // No slot was ever touched.
        assert_eq!(h.pool.available_slots().await, 1);
        assert!(h.mock.deleted().is_empty());
    }

    #[tokio::test]
    async fn insights_failure_leaves_later_stages_pending() {
        let mut h = harness(
            Scenario {
                taste_missing: true,
                ..Scenario::default()
            },
            Arc::new(MemoryStore::new()),
        );
        run(&mut h, request(AdType::Default, None), Vec::new()).await;

        let (control, audio) = drain(&mut h.rx);
        assert!(audio.is_empty());
        assert!(!control.iter().any(|m| matches!(m, ServerMessage::Done { .. })));

        let (steps, overall) = summary_of(&control);
        assert!(!overall);
        assert_eq!(steps["insights"]["status"], "failed");
        for step in ["transcript", "speech", "music", "merge"] {
            assert_eq!(steps[step]["status"], "pending", "{step} must stay pending");
        }
    }

    #[tokio::test]
    async fn speech_failure_skips_merge_but_keeps_music_result() {
        let mut h = harness(
            Scenario {
                speech_fails: true,
                ..Scenario::default()
            },
            Arc::new(MemoryStore::new()),
        );
        run(&mut h, request(AdType::Default, None), Vec::new()).await;

        let (control, audio) = drain(&mut h.rx);
        // Music succeeded on its own; no merged frame follows.
        assert!(audio.is_empty());
        assert!(control.iter().any(|m| matches!(
            m,
            ServerMessage::Error { index: 0, step: Some(Step::Speech), .. }
        )));
        // The stage sequence still ran to its end.
        assert!(control.iter().any(|m| matches!(m, ServerMessage::Done { index: 0 })));

        let (steps, overall) = summary_of(&control);
        assert!(!overall);
        assert_eq!(steps["speech"]["status"], "failed");
        assert_eq!(steps["music"]["status"], "success");
        assert_eq!(steps["merge"]["status"], "skipped");
        let reason = steps["merge"]["error"].as_str().unwrap();
        assert!(reason.contains("speech"), "skip reason must name the failing stage");
        assert!(!reason.contains("music"));
    }

    #[tokio::test]
    async fn custom_ad_acquires_cleans_up_and_releases() {
        let store = Arc::new(SpyStore::default());
        let mut h = harness(Scenario::default(), Arc::clone(&store) as Arc<dyn SlotStore>);
        let ticket = h.pool.reserve(Duration::from_secs(300)).await.unwrap();

        run(
            &mut h,
            request(AdType::Custom, Some(&ticket)),
            vec![Bytes::from_static(b"recording")],
        )
        .await;

        let (control, audio) = drain(&mut h.rx);
        assert!(control.iter().any(|m| matches!(m, ServerMessage::Done { index: 0 })));
        assert_eq!(audio.len(), 2);

        let (steps, overall) = summary_of(&control);
        assert!(overall);

        // Finalizer: voice deleted, slot marked completed, slot released.
        assert_eq!(h.mock.deleted(), vec![CLONED_VOICE_ID.to_string()]);
        assert!(matches!(steps["merge"]["status"].as_str(), Some("success")));
        assert!(store.wrote_status("completed"));
        assert_eq!(h.pool.available_slots().await, 1);
    }

    #[tokio::test]
    async fn custom_ad_merge_failure_marks_slot_error() {
        let store = Arc::new(SpyStore::default());
        let mut h = harness(
            Scenario {
                merge_fails: true,
                ..Scenario::default()
            },
            Arc::clone(&store) as Arc<dyn SlotStore>,
        );
        let ticket = h.pool.reserve(Duration::from_secs(300)).await.unwrap();

        run(
            &mut h,
            request(AdType::Custom, Some(&ticket)),
            vec![Bytes::from_static(b"recording")],
        )
        .await;

        let (control, _) = drain(&mut h.rx);
        let (steps, overall) = summary_of(&control);
        assert!(!overall);
        assert_eq!(steps["merge"]["status"], "failed");

        // Cleanup still ran, reporting the failure through the slot status.
        assert_eq!(h.mock.deleted(), vec![CLONED_VOICE_ID.to_string()]);
        assert!(store.wrote_status("error"));
        assert_eq!(h.pool.available_slots().await, 1);
    }

    #[tokio::test]
    async fn acquire_failure_deletes_the_cloned_voice() {
        let store = Arc::new(MemoryStore::new());
        let mut h = harness(Scenario::default(), Arc::clone(&store) as Arc<dyn SlotStore>);
        let ticket = h.pool.reserve(Duration::from_secs(300)).await.unwrap();

        // Capacity vanishes between ticket grant and acquire: another live
        // slot with unexpired metadata fills the pool.
        let other_meta = serde_json::json!({
            "voice_id": "other-voice",
            "status": "processing",
            "created_at": 0,
            "expires_at": 9_999_999_999i64,
            "reservation_id": "ffffffff",
        })
        .to_string();
        store
            .apply(vec![
                StoreOp::SlotAdd("other-voice".to_string()),
                StoreOp::SetEx {
                    key: "voice_slot:other-voice".to_string(),
                    value: other_meta,
                    ttl: Duration::from_secs(3600),
                },
            ])
            .await
            .unwrap();

        run(
            &mut h,
            request(AdType::Custom, Some(&ticket)),
            vec![Bytes::from_static(b"recording")],
        )
        .await;

        let (control, audio) = drain(&mut h.rx);
        assert!(audio.is_empty());
        assert!(!control.iter().any(|m| matches!(m, ServerMessage::Done { .. })));
        assert!(control.iter().any(|m| matches!(
            m,
            ServerMessage::Error { index: 0, step: None, .. }
        )));

        // Compensation: the billed voice did not outlive the failure.
        assert_eq!(h.mock.deleted(), vec![CLONED_VOICE_ID.to_string()]);
    }

    #[tokio::test]
    async fn custom_ad_without_ticket_fails_before_cloning() {
        let mut h = harness(Scenario::default(), Arc::new(MemoryStore::new()));

        run(
            &mut h,
            request(AdType::Custom, None),
            vec![Bytes::from_static(b"recording")],
        )
        .await;

        let (control, _) = drain(&mut h.rx);
        assert!(control.iter().any(|m| matches!(
            m,
            ServerMessage::Error { index: 0, step: None, .. }
        )));
        assert!(h.mock.deleted().is_empty());
    }

    #[test]
    fn voice_selection_matches_case_insensitively_with_fallback() {
        let voices = library();
        assert_eq!(
            select_library_voice(&voices, "CLARA").unwrap().voice_name,
            "clara"
        );
        // Unknown model falls back to the last library voice.
        assert_eq!(
            select_library_voice(&voices, "nobody").unwrap().voice_name,
            "sam"
        );
        assert!(select_library_voice(&[], "clara").is_none());
    }

    /// MemoryStore wrapper that records every keyed write, so tests can
    /// observe slot statuses that release later erases.
    #[derive(Default)]
    struct SpyStore {
        inner: MemoryStore,
        writes: StdMutex<Vec<(String, String)>>,
    }

    impl SpyStore {
        fn wrote_status(&self, status: &str) -> bool {
            let needle = format!("\"status\":\"{status}\"");
            self.writes
                .lock()
                .unwrap()
                .iter()
                .any(|(key, value)| key.starts_with("voice_slot:") && value.contains(&needle))
        }

        fn record(&self, ops: &[StoreOp]) {
            let mut writes = self.writes.lock().unwrap();
            for op in ops {
                if let StoreOp::SetEx { key, value, .. } = op {
                    writes.push((key.clone(), value.clone()));
                }
            }
        }
    }

    #[async_trait]
    impl SlotStore for SpyStore {
        async fn watch(&self) -> Result<u64, StoreError> {
            self.inner.watch().await
        }
        async fn slot_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.slot_ids().await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.writes
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            self.inner.set_ex(key, value, ttl).await
        }
        async fn reservation_count(&self) -> Result<usize, StoreError> {
            self.inner.reservation_count().await
        }
        async fn txn(&self, watched: u64, ops: Vec<StoreOp>) -> Result<bool, StoreError> {
            self.record(&ops);
            self.inner.txn(watched, ops).await
        }
        async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
            self.record(&ops);
            self.inner.apply(ops).await
        }
    }
}
