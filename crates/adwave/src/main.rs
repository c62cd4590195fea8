use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use adwave::config::Config;
use adwave::providers::{
    ApiClient, PcmMixer, Providers,
    http::{
        HttpInsightProviders, HttpMusicGenerator, HttpSpeechService, HttpTranscriptGenerator,
        HttpTranslator,
    },
};
use adwave::routes::AppState;
use adwave::server;
use adwave::slots::{MemoryStore, SlotPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let providers = build_providers(&config)?;
    let pool = Arc::new(SlotPool::new(
        Arc::new(MemoryStore::new()),
        config.max_voice_slots,
        config.slot_ttl,
    ));
    let state = Arc::new(AppState {
        pool,
        providers,
        reservation_ttl: config.reservation_ttl,
        acquire_timeout: config.acquire_timeout,
    });

    server::serve(&config.host, config.port, state).await
}

fn build_providers(config: &Config) -> anyhow::Result<Providers> {
    let insights = HttpInsightProviders::new(
        ApiClient::new(config.taste_api_url.clone(), None)?,
        ApiClient::new(config.trends_api_url.clone(), None)?,
        ApiClient::new(config.weather_api_url.clone(), None)?,
        ApiClient::new(config.slang_api_url.clone(), None)?,
    );
    let transcripts =
        HttpTranscriptGenerator::new(ApiClient::new(config.transcript_api_url.clone(), None)?);
    let speech = HttpSpeechService::new(ApiClient::new(
        config.speech_api_url.clone(),
        config.speech_api_key.clone(),
    )?);
    let music = HttpMusicGenerator::new(ApiClient::new(config.music_api_url.clone(), None)?);
    let translator = HttpTranslator::new(ApiClient::new(
        config.translate_api_url.clone(),
        config.translate_api_key.clone(),
    )?);

    Ok(Providers {
        insights: Arc::new(insights),
        transcripts: Arc::new(transcripts),
        speech: Arc::new(speech),
        music: Arc::new(music),
        mixer: Arc::new(PcmMixer::default()),
        translator: Arc::new(translator),
    })
}
