//! Insights stage: concurrent fan-out to every insight source.

use crate::pipeline::{Step, StepResult};
use crate::protocol::{ClientSender, ServerMessage};
use crate::providers::{InsightBundle, Location, ProviderError, Providers};

/// Query taste, trends, forecast, and slang sources concurrently.
///
/// The forecast source is only consulted when the request enabled weather
/// and named a horizon. Missing taste data fails the stage; any provider
/// error fails the stage and is reported to the client.
pub async fn gather_insights(
    sender: &ClientSender,
    providers: &Providers,
    index: usize,
    location: &Location,
    use_weather: bool,
    forecast_type: Option<u8>,
) -> StepResult<InsightBundle> {
    let taste = providers.insights.taste(&location.name);
    let trends = providers.insights.trends(&location.code);
    let slangs = providers.insights.slangs(&location.name);
    let forecast = async {
        match forecast_type {
            Some(days) if use_weather => providers
                .insights
                .forecast(&location.name, days)
                .await
                .map(Some),
            _ => Ok(None),
        }
    };

    let (taste, trends, forecast, slangs) = tokio::join!(taste, trends, forecast, slangs);

    let bundle = (|| -> Result<Option<InsightBundle>, ProviderError> {
        let Some(taste) = taste? else {
            return Ok(None);
        };
        Ok(Some(InsightBundle {
            taste,
            trends: trends?,
            forecast: forecast?,
            slangs: slangs?,
        }))
    })();

    match bundle {
        Ok(Some(bundle)) => StepResult::success(bundle),
        Ok(None) => {
            tracing::warn!(index, location = %location.name, "No taste data for location");
            StepResult::failed("Taste generation failed")
        }
        Err(e) => {
            let message = format!("Failed to gather insights: {e}");
            tracing::error!(index, error = %e, "Insights stage failed");
            sender
                .send(ServerMessage::Error {
                    index,
                    step: Some(Step::Insights),
                    message: message.clone(),
                })
                .await;
            StepResult::failed(message)
        }
    }
}
