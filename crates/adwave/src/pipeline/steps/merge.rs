//! Merge stage: mix speech over music and emit the merged frame.

use tokio_util::bytes::Bytes;

use crate::pipeline::{Step, StepResult};
use crate::protocol::{AudioHeader, ClientSender, ServerMessage};
use crate::providers::Providers;

pub async fn merge_audio(
    sender: &ClientSender,
    providers: &Providers,
    index: usize,
    speech: Bytes,
    music: Bytes,
) -> StepResult<()> {
    match providers.mixer.merge(speech, music).await {
        Ok(merged) => {
            sender
                .send_audio(&AudioHeader::Merged { index }, &merged)
                .await;
            StepResult::success(())
        }
        Err(e) => {
            let message = format!("Audio merging failed: {e}");
            tracing::error!(index, error = %e, "Merge stage failed");
            sender
                .send(ServerMessage::Error {
                    index,
                    step: Some(Step::Merge),
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
    use crate::pipeline::testutil::{
        MERGED_AUDIO, MockCollaborators, Scenario, client_channel, drain,
    };
    use crate::protocol::decode_audio_frame;

    #[tokio::test]
    async fn emits_merged_frame_on_success() {
        let mock = MockCollaborators::new(Scenario::default());
        let (sender, mut rx) = client_channel();

        let result = merge_audio(
            &sender,
            &mock.providers(),
            0,
            Bytes::from_static(b"s"),
            Bytes::from_static(b"m"),
        )
        .await;

        assert!(result.is_success());
        let (_, audio) = drain(&mut rx);
        let (header, suffix) = decode_audio_frame(&audio[0]).unwrap();
        assert_eq!(header, AudioHeader::Merged { index: 0 });
        assert_eq!(suffix, MERGED_AUDIO);
    }

    #[tokio::test]
    async fn mixer_failure_reports_step_error() {
        let mock = MockCollaborators::new(Scenario {
            merge_fails: true,
            ..Scenario::default()
        });
        let (sender, mut rx) = client_channel();

        let result = merge_audio(
            &sender,
            &mock.providers(),
            2,
            Bytes::from_static(b"s"),
            Bytes::from_static(b"m"),
        )
        .await;

        assert_eq!(result.status, StepStatus::Failed);
        let (control, audio) = drain(&mut rx);
        assert!(audio.is_empty());
        assert!(matches!(
            &control[0],
            ServerMessage::Error { index: 2, step: Some(Step::Merge), .. }
        ));
    }
}
