//! Speech stage: synthesis, best-effort alignment, speech frame emission.

use tokio_util::bytes::Bytes;

use crate::pipeline::{Step, StepResult};
use crate::protocol::{AudioHeader, ClientSender, ServerMessage};
use crate::providers::{ProviderError, Providers, TranscriptVariant, VoiceData};

/// Synthesize the transcript with `voice` and stream the audio to the client.
///
/// Voices labeled with a non-English language get the transcript translated
/// first; the frame header still carries the original English transcript
/// alongside the translated lines. Alignment failures degrade to a frame
/// without alignments rather than failing the stage.
pub async fn generate_speech(
    sender: &ClientSender,
    providers: &Providers,
    index: usize,
    variant: &TranscriptVariant,
    voice: &VoiceData,
) -> StepResult<Bytes> {
    match synthesize_and_emit(sender, providers, index, variant, voice).await {
        Ok(audio) => StepResult::success(audio),
        Err(e) => {
            let message = format!("Speech generation failed: {e}");
            tracing::error!(index, error = %e, "Speech stage failed");
            sender
                .send(ServerMessage::Error {
                    index,
                    step: Some(Step::Speech),
                    message: message.clone(),
                })
                .await;
            StepResult::failed(message)
        }
    }
}

async fn synthesize_and_emit(
    sender: &ClientSender,
    providers: &Providers,
    index: usize,
    variant: &TranscriptVariant,
    voice: &VoiceData,
) -> Result<Bytes, ProviderError> {
    let mut translation = None;
    if let Some(language) = voice.language()
        && language != "en"
    {
        tracing::info!(index, language, "Translating transcript for voice");
        translation = providers
            .translator
            .translate(&variant.transcript, "EN", &language.to_uppercase())
            .await?;
    }

    let text = translation.as_deref().unwrap_or(&variant.transcript);
    let audio = providers.speech.synthesize(text, &voice.voice_id).await?;
    if audio.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "empty audio buffer".to_string(),
        ));
    }

    let alignments = match providers.speech.forced_alignment(text, &audio).await {
        Ok(alignments) => alignments,
        Err(e) => {
            tracing::warn!(index, error = %e, "Forced alignment unavailable");
            None
        }
    };

    let header = AudioHeader::Speech {
        index,
        transcript: variant.transcript.clone(),
        translations: translation
            .as_ref()
            .map(|t| t.split('\n').map(str::to_string).collect()),
        alignments,
    };
    sender.send_audio(&header, &audio).await;

    Ok(audio)
}
