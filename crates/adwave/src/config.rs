//! Environment-backed configuration, loaded once at startup.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub max_voice_slots: usize,
    pub slot_ttl: Duration,
    pub reservation_ttl: Duration,
    pub acquire_timeout: Duration,

    pub taste_api_url: String,
    pub trends_api_url: String,
    pub weather_api_url: String,
    pub slang_api_url: String,
    pub transcript_api_url: String,
    pub speech_api_url: String,
    pub speech_api_key: Option<String>,
    pub music_api_url: String,
    pub translate_api_url: String,
    pub translate_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // A missing .env file is fine in production.
        dotenvy::dotenv().ok();

        Ok(Self {
            host: var_or("ADWAVE_HOST", "0.0.0.0"),
            port: parse_var("ADWAVE_PORT", 8000)?,
            max_voice_slots: parse_var("MAX_VOICE_SLOTS", 4)?,
            slot_ttl: Duration::from_secs(parse_var("VOICE_SLOT_TTL_SECS", 3600)?),
            reservation_ttl: Duration::from_secs(parse_var("RESERVATION_TTL_SECS", 300)?),
            acquire_timeout: Duration::from_secs(parse_var("SLOT_ACQUIRE_TIMEOUT_SECS", 10)?),
            taste_api_url: required("TASTE_API_URL")?,
            trends_api_url: required("TRENDS_API_URL")?,
            weather_api_url: required("WEATHER_API_URL")?,
            slang_api_url: required("SLANG_API_URL")?,
            transcript_api_url: required("TRANSCRIPT_API_URL")?,
            speech_api_url: required("SPEECH_API_URL")?,
            speech_api_key: env::var("SPEECH_API_KEY").ok(),
            music_api_url: required("MUSIC_API_URL")?,
            translate_api_url: required("TRANSLATE_API_URL")?,
            translate_api_key: env::var("TRANSLATE_API_KEY").ok(),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}
