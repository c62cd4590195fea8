//! Transcript stage.

use crate::pipeline::{Step, StepResult};
use crate::protocol::{ClientSender, ServerMessage};
use crate::providers::{
    AdRequest, InsightBundle, Location, Providers, TranscriptContext, TranscriptVariant, VoiceData,
};

/// Generate ad copy from the gathered insights. The first variant wins; if
/// it carries insight details they are forwarded to the client as an
/// `insight` control message before the stage resolves.
pub async fn generate_transcript(
    sender: &ClientSender,
    providers: &Providers,
    index: usize,
    request: &AdRequest,
    location: &Location,
    voices: &[VoiceData],
    insights: &InsightBundle,
) -> StepResult<TranscriptVariant> {
    let ctx = TranscriptContext {
        request,
        location,
        voices,
        insights,
    };

    let variants = match providers.transcripts.generate(ctx).await {
        Ok(variants) => variants,
        Err(e) => {
            let message = format!("Transcript generation failed: {e}");
            tracing::error!(index, error = %e, "Transcript stage failed");
            sender
                .send(ServerMessage::Error {
                    index,
                    step: Some(Step::Transcript),
                    message: message.clone(),
                })
                .await;
            return StepResult::failed(message);
        }
    };

    let Some(variant) = variants.into_iter().next() else {
        tracing::warn!(index, "Transcript generator returned no variants");
        return StepResult::failed("Transcript generation failed");
    };

    if !variant.insight_details.is_empty() {
        sender
            .send(ServerMessage::Insight {
                index,
                insights: variant.insight_details.clone(),
            })
            .await;
    }

    StepResult::success(variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepStatus;
    use crate::pipeline::testutil::{MockCollaborators, Scenario, client_channel, drain, library, location};
    use crate::providers::AdType;
    use serde_json::json;

    fn request() -> AdRequest {
        AdRequest {
            product_name: "Solar kettle".to_string(),
            product_summary: "Boils water with sunlight".to_string(),
            offer_summary: "20% off".to_string(),
            cta: "Order today".to_string(),
            locations: vec![location()],
            ad_type: AdType::Default,
            slot_reservation_id: None,
            use_weather: false,
            forecast_type: None,
            clone_language: None,
        }
    }

    fn insights() -> InsightBundle {
        InsightBundle {
            taste: json!({}),
            trends: json!([]),
            forecast: None,
            slangs: json!([]),
        }
    }

    #[tokio::test]
    async fn forwards_insight_details_on_success() {
        let mock = MockCollaborators::new(Scenario::default());
        let (sender, mut rx) = client_channel();

        let result = generate_transcript(
            &sender,
            &mock.providers(),
            1,
            &request(),
            &location(),
            &library(),
            &insights(),
        )
        .await;

        assert!(result.is_success());
        let (control, _) = drain(&mut rx);
        assert_eq!(control.len(), 1);
        assert!(matches!(
            &control[0],
            ServerMessage::Insight { index: 1, insights } if insights.len() == 1
        ));
    }

    #[tokio::test]
    async fn empty_output_fails_the_stage() {
        let mock = MockCollaborators::new(Scenario {
            transcript_empty: true,
            ..Scenario::default()
        });
        let (sender, mut rx) = client_channel();

        let result = generate_transcript(
            &sender,
            &mock.providers(),
            0,
            &request(),
            &location(),
            &library(),
            &insights(),
        )
        .await;

        assert_eq!(result.status, StepStatus::Failed);
        let (control, _) = drain(&mut rx);
        assert!(control.is_empty());
    }
}
