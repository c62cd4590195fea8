//! Collaborator contracts.
//!
//! The pipeline only sees these traits; the HTTP glue behind them lives in
//! [`http`]. Retry policy belongs to the collaborator, not to the pipeline.

pub mod http;
pub mod mixer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::bytes::Bytes;

pub use http::ApiClient;
pub use mixer::PcmMixer;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Other(String),
}

/// One targeted ad market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdType {
    Custom,
    Default,
}

/// Batch request: the first text frame of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRequest {
    pub product_name: String,
    pub product_summary: String,
    pub offer_summary: String,
    pub cta: String,
    pub locations: Vec<Location>,
    pub ad_type: AdType,
    #[serde(default)]
    pub slot_reservation_id: Option<String>,
    #[serde(default)]
    pub use_weather: bool,
    /// Forecast horizon in days (1, 7, or 14).
    #[serde(default)]
    pub forecast_type: Option<u8>,
    #[serde(default)]
    pub clone_language: Option<String>,
}

/// One entry in the speech service's voice library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceData {
    pub voice_id: String,
    pub voice_name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl VoiceData {
    pub fn language(&self) -> Option<&str> {
        self.labels.get("language").map(String::as_str)
    }
}

/// One transcript variant produced by the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptVariant {
    /// Library voice the generator picked for this copy.
    pub voice_model: String,
    pub music_prompt: String,
    pub transcript: String,
    #[serde(default)]
    pub insight_details: Vec<Value>,
}

/// Everything the insights stage gathered for one location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightBundle {
    pub taste: Value,
    pub trends: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Value>,
    pub slangs: Value,
}

/// Location-keyed insight sources, fanned out concurrently by the pipeline.
#[async_trait]
pub trait InsightProviders: Send + Sync {
    /// Taste profile; `None` means no data, which fails the insights stage.
    async fn taste(&self, location_name: &str) -> Result<Option<Value>, ProviderError>;
    async fn trends(&self, location_code: &str) -> Result<Value, ProviderError>;
    async fn forecast(&self, location_name: &str, days: u8) -> Result<Value, ProviderError>;
    async fn slangs(&self, location_name: &str) -> Result<Value, ProviderError>;
}

/// Inputs the transcript generator sees for one job.
pub struct TranscriptContext<'a> {
    pub request: &'a AdRequest,
    pub location: &'a Location,
    pub voices: &'a [VoiceData],
    pub insights: &'a InsightBundle,
}

#[async_trait]
pub trait TranscriptGenerator: Send + Sync {
    /// Produce transcript variants; an empty result fails the stage.
    async fn generate(
        &self,
        ctx: TranscriptContext<'_>,
    ) -> Result<Vec<TranscriptVariant>, ProviderError>;
}

/// Voice library, cloning, synthesis, and alignment.
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn voices(&self) -> Result<Vec<VoiceData>, ProviderError>;

    async fn voice(&self, voice_id: &str) -> Result<VoiceData, ProviderError>;

    /// Clone a voice from raw recordings; returns the new voice id. The
    /// caller owns compensation: a cloned voice that never lands in a slot
    /// must be deleted.
    async fn clone_voice(
        &self,
        recordings: &[Bytes],
        language_code: Option<&str>,
    ) -> Result<String, ProviderError>;

    async fn delete_voice(&self, voice_id: &str) -> Result<(), ProviderError>;

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes, ProviderError>;

    /// Word timestamps for synthesized audio; best-effort, `None` when the
    /// service has no alignment for the input.
    async fn forced_alignment(
        &self,
        text: &str,
        audio: &[u8],
    ) -> Result<Option<Value>, ProviderError>;
}

#[async_trait]
pub trait MusicGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, duration_secs: u32) -> Result<Bytes, ProviderError>;
}

#[async_trait]
pub trait AudioMixer: Send + Sync {
    async fn merge(&self, speech: Bytes, music: Bytes) -> Result<Bytes, ProviderError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` between ISO language codes; `None` when the target
    /// is unsupported.
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<Option<String>, ProviderError>;
}

/// Shared handles to every collaborator, cloned into each job task.
#[derive(Clone)]
pub struct Providers {
    pub insights: Arc<dyn InsightProviders>,
    pub transcripts: Arc<dyn TranscriptGenerator>,
    pub speech: Arc<dyn SpeechService>,
    pub music: Arc<dyn MusicGenerator>,
    pub mixer: Arc<dyn AudioMixer>,
    pub translator: Arc<dyn Translator>,
}
