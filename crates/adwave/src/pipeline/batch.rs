//! Batch fan-out: one job task per requested location.
//!
//! Jobs are isolated failure domains. A panicking job surfaces as a
//! job-scoped error message at the join; it never takes siblings or the
//! batch-complete signal down with it.

use std::sync::Arc;

use tokio_util::bytes::Bytes;

use crate::pipeline::job::{JobContext, run_job};
use crate::protocol::ServerMessage;
use crate::providers::{AdRequest, VoiceData};

/// Run every location's job concurrently, then signal batch completion.
/// `complete` is emitted unconditionally, even if every job failed; clients
/// distinguish success from the per-job messages.
pub async fn run_batch(
    ctx: JobContext,
    request: Arc<AdRequest>,
    voices: Arc<Vec<VoiceData>>,
    recordings: Arc<Vec<Bytes>>,
) {
    let total = request.locations.len();
    tracing::info!(jobs = total, "Starting batch");

    let mut handles = Vec::with_capacity(total);
    for index in 0..total {
        let ctx = ctx.clone();
        let request = Arc::clone(&request);
        let voices = Arc::clone(&voices);
        let recordings = Arc::clone(&recordings);
        handles.push((
            index,
            tokio::spawn(run_job(ctx, index, request, voices, recordings)),
        ));
    }

    for (index, handle) in handles {
        if let Err(e) = handle.await {
            tracing::error!(index, error = %e, "Job task aborted");
            ctx.sender
                .send(ServerMessage::Error {
                    index,
                    step: None,
                    message: format!("Unexpected error: job aborted: {e}"),
                })
                .await;
        }
    }

    tracing::info!(jobs = total, "Batch resolved");
    ctx.sender.send(ServerMessage::Complete).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil::{MockCollaborators, Scenario, client_channel, drain, library};
    use crate::providers::{AdType, Location};
    use crate::slots::{MemoryStore, SlotPool};
    use std::time::Duration;

    fn batch_request(location_names: &[&str]) -> Arc<AdRequest> {
        Arc::new(AdRequest {
            product_name: "Solar kettle".to_string(),
            product_summary: "Boils water with sunlight".to_string(),
            offer_summary: "20% off".to_string(),
            cta: "Order today".to_string(),
            locations: location_names
                .iter()
                .map(|name| Location {
                    code: name[..2].to_uppercase(),
                    name: name.to_string(),
                })
                .collect(),
            ad_type: AdType::Default,
            slot_reservation_id: None,
            use_weather: false,
            forecast_type: None,
            clone_language: None,
        })
    }

    fn context(scenario: Scenario) -> (JobContext, tokio::sync::mpsc::Receiver<crate::protocol::OutboundFrame>) {
        let mock = MockCollaborators::new(scenario);
        let (sender, rx) = client_channel();
        let pool = Arc::new(SlotPool::new(
            Arc::new(MemoryStore::new()),
            4,
            Duration::from_secs(3600),
        ));
        (
            JobContext {
                sender,
                providers: mock.providers(),
                pool,
                acquire_timeout: Duration::from_secs(5),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn complete_follows_every_job() {
        let (ctx, mut rx) = context(Scenario::default());

        run_batch(
            ctx,
            batch_request(&["Germany", "France"]),
            Arc::new(library()),
            Arc::new(Vec::new()),
        )
        .await;

        let (control, _) = drain(&mut rx);
        assert!(matches!(control.last(), Some(ServerMessage::Complete)));

        let done: Vec<usize> = control
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Done { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(done.len(), 2);
        assert!(done.contains(&0) && done.contains(&1));

        let summaries = control
            .iter()
            .filter(|m| matches!(m, ServerMessage::Summary { .. }))
            .count();
        assert_eq!(summaries, 2);
    }

    #[tokio::test]
    async fn panicking_job_is_isolated_from_siblings() {
        let (ctx, mut rx) = context(Scenario {
            panic_in_taste: true,
            ..Scenario::default()
        });

        run_batch(
            ctx,
            batch_request(&["Germany", "Atlantis", "France"]),
            Arc::new(library()),
            Arc::new(Vec::new()),
        )
        .await;

        let (control, _) = drain(&mut rx);
        assert!(matches!(control.last(), Some(ServerMessage::Complete)));

        // Siblings finished normally.
        for index in [0usize, 2] {
            assert!(
                control
                    .iter()
                    .any(|m| matches!(m, ServerMessage::Done { index: i } if *i == index)),
                "job {index} must complete"
            );
        }

        // The panicking job resolved into exactly one job-scoped error.
        let job_errors: Vec<_> = control
            .iter()
            .filter(|m| matches!(m, ServerMessage::Error { index: 1, step: None, .. }))
            .collect();
        assert_eq!(job_errors.len(), 1);
        assert!(
            !control
                .iter()
                .any(|m| matches!(m, ServerMessage::Done { index: 1 }))
        );
    }
}
