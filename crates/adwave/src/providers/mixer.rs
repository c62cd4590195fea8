//! In-process PCM mixer.
//!
//! Overlays speech on an attenuated music bed: the music is looped out to
//! the speech length plus a short tail, reduced by a fixed gain, faded out
//! at the end, then summed sample-wise with saturation. Input and output are
//! raw 16-bit little-endian PCM. The sum runs on the blocking pool so it
//! never stalls the scheduler.

use async_trait::async_trait;
use tokio_util::bytes::Bytes;

use super::{AudioMixer, ProviderError};

pub struct PcmMixer {
    sample_rate: u32,
    music_reduction_db: f32,
    fade_ms: u32,
    extension_ms: u32,
}

impl Default for PcmMixer {
    fn default() -> Self {
        Self::new(44_100, 13.0, 2_000, 1_000)
    }
}

impl PcmMixer {
    pub fn new(sample_rate: u32, music_reduction_db: f32, fade_ms: u32, extension_ms: u32) -> Self {
        Self {
            sample_rate,
            music_reduction_db,
            fade_ms,
            extension_ms,
        }
    }

    fn samples(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1_000) as usize
    }
}

#[async_trait]
impl AudioMixer for PcmMixer {
    async fn merge(&self, speech: Bytes, music: Bytes) -> Result<Bytes, ProviderError> {
        let gain = 10f32.powf(-self.music_reduction_db / 20.0);
        let fade_samples = self.samples(self.fade_ms);
        let extension_samples = self.samples(self.extension_ms);

        let mixed = tokio::task::spawn_blocking(move || {
            mix_pcm(&speech, &music, gain, fade_samples, extension_samples)
        })
        .await
        .map_err(|e| ProviderError::Other(format!("mixer task failed: {e}")))??;

        Ok(Bytes::from(mixed))
    }
}

fn decode_pcm(bytes: &[u8], name: &str) -> Result<Vec<i16>, ProviderError> {
    if bytes.is_empty() {
        return Err(ProviderError::InvalidResponse(format!(
            "{name} buffer is empty"
        )));
    }
    if bytes.len() % 2 != 0 {
        return Err(ProviderError::InvalidResponse(format!(
            "{name} buffer is not 16-bit aligned"
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn mix_pcm(
    speech: &[u8],
    music: &[u8],
    music_gain: f32,
    fade_samples: usize,
    extension_samples: usize,
) -> Result<Vec<u8>, ProviderError> {
    let speech = decode_pcm(speech, "speech")?;
    let music = decode_pcm(music, "music")?;

    let total = speech.len() + extension_samples;
    let fade = fade_samples.min(total);

    let mut out = Vec::with_capacity(total * 2);
    for i in 0..total {
        // Loop the bed out to the full length.
        let mut bed = music[i % music.len()] as f32 * music_gain;

        let remaining = total - i;
        if remaining <= fade {
            bed *= remaining as f32 / fade as f32;
        }

        let voice = speech.get(i).copied().unwrap_or(0);
        let sample = (bed as i32 + voice as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }

    Ok(out)
}
