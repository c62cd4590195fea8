//! Music stage.

use tokio_util::bytes::Bytes;

use crate::pipeline::{Step, StepResult};
use crate::protocol::{ClientSender, ServerMessage};
use crate::providers::Providers;

/// Background tracks are a fixed length; speech rides on top and the mixer
/// trims to the shorter buffer.
pub const MUSIC_DURATION_SECS: u32 = 40;

pub async fn generate_music(
    sender: &ClientSender,
    providers: &Providers,
    index: usize,
    music_prompt: &str,
) -> StepResult<Bytes> {
    match providers.music.generate(music_prompt, MUSIC_DURATION_SECS).await {
        Ok(audio) if audio.is_empty() => {
            tracing::warn!(index, "Music generator returned an empty buffer");
            StepResult::failed("Music generation failed")
        }
        Ok(audio) => StepResult::success(audio),
        Err(e) => {
            let message = format!("Music generation failed: {e}");
            tracing::error!(index, error = %e, "Music stage failed");
            sender
                .send(ServerMessage::Error {
                    index,
                    step: Some(Step::Music),
                    message: message.clone(),
                })
                .await;
            StepResult::failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepStatus;
    use crate::pipeline::testutil::{MUSIC_AUDIO, MockCollaborators, Scenario, client_channel, drain};

    #[tokio::test]
    async fn returns_generated_buffer() {
        let mock = MockCollaborators::new(Scenario::default());
        let (sender, _rx) = client_channel();

        let result = generate_music(&sender, &mock.providers(), 0, "upbeat synth").await;

        assert_eq!(result.payload.unwrap(), Bytes::from_static(MUSIC_AUDIO));
    }

    #[tokio::test]
    async fn generator_failure_reports_step_error() {
        let mock = MockCollaborators::new(Scenario {
            music_fails: true,
            ..Scenario::default()
        });
        let (sender, mut rx) = client_channel();

        let result = generate_music(&sender, &mock.providers(), 3, "upbeat synth").await;

        assert_eq!(result.status, StepStatus::Failed);
        let (control, _) = drain(&mut rx);
        assert!(matches!(
            &control[0],
            ServerMessage::Error { index: 3, step: Some(Step::Music), .. }
        ));
    }
}
