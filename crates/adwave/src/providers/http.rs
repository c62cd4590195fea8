//! reqwest-backed collaborator implementations.
//!
//! Each collaborator is a thin JSON client against a configured base URL.
//! Response bodies are decoded into the contract types here; anything that
//! does not fit becomes `ProviderError::InvalidResponse`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::bytes::Bytes;

use super::{
    InsightProviders, MusicGenerator, ProviderError, SpeechService, TranscriptContext,
    TranscriptGenerator, TranscriptVariant, Translator, VoiceData,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared JSON client for one collaborator base URL.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let response = self
            .request(Method::GET, path)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Value, ProviderError> {
        let response = self
            .request(Method::POST, path)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_bytes<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Bytes, ProviderError> {
        let response = self
            .request(Method::POST, path)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?)
    }

    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        self.request(Method::DELETE, path)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Insight sources, one endpoint per source.
pub struct HttpInsightProviders {
    taste: ApiClient,
    trends: ApiClient,
    weather: ApiClient,
    slangs: ApiClient,
}

impl HttpInsightProviders {
    pub fn new(taste: ApiClient, trends: ApiClient, weather: ApiClient, slangs: ApiClient) -> Self {
        Self {
            taste,
            trends,
            weather,
            slangs,
        }
    }
}

#[async_trait]
impl InsightProviders for HttpInsightProviders {
    async fn taste(&self, location_name: &str) -> Result<Option<Value>, ProviderError> {
        let value = self
            .taste
            .get_json("/taste", &[("location", location_name)])
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn trends(&self, location_code: &str) -> Result<Value, ProviderError> {
        self.trends.get_json("/trends", &[("geo", location_code)]).await
    }

    async fn forecast(&self, location_name: &str, days: u8) -> Result<Value, ProviderError> {
        self.weather
            .get_json(
                "/forecast",
                &[("location", location_name), ("days", &days.to_string())],
            )
            .await
    }

    async fn slangs(&self, location_name: &str) -> Result<Value, ProviderError> {
        self.slangs
            .get_json("/slangs", &[("location", location_name)])
            .await
    }
}

pub struct HttpTranscriptGenerator {
    client: ApiClient,
}

impl HttpTranscriptGenerator {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TranscriptGenerator for HttpTranscriptGenerator {
    async fn generate(
        &self,
        ctx: TranscriptContext<'_>,
    ) -> Result<Vec<TranscriptVariant>, ProviderError> {
        let body = json!({
            "product_name": ctx.request.product_name,
            "product_summary": ctx.request.product_summary,
            "offer_summary": ctx.request.offer_summary,
            "cta": ctx.request.cta,
            "location": ctx.location,
            "voices": ctx.voices,
            "insights": ctx.insights,
            "with_forecast": ctx.request.use_weather,
            "forecast_days": ctx.request.forecast_type,
            "variations": 1,
        });
        let value = self.client.post_json("/transcripts", &body).await?;
        parse_transcripts(value)
    }
}

fn parse_transcripts(value: Value) -> Result<Vec<TranscriptVariant>, ProviderError> {
    let results = value
        .get("results")
        .cloned()
        .ok_or_else(|| ProviderError::InvalidResponse("missing results field".to_string()))?;
    serde_json::from_value(results)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad transcript variant: {e}")))
}

pub struct HttpSpeechService {
    client: ApiClient,
}

impl HttpSpeechService {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpeechService for HttpSpeechService {
    async fn voices(&self) -> Result<Vec<VoiceData>, ProviderError> {
        let value = self.client.get_json("/voices", &[]).await?;
        parse_voices(value)
    }

    async fn voice(&self, voice_id: &str) -> Result<VoiceData, ProviderError> {
        let value = self
            .client
            .get_json(&format!("/voices/{voice_id}"), &[])
            .await?;
        serde_json::from_value(value)
            .map_err(|e| ProviderError::InvalidResponse(format!("bad voice data: {e}")))
    }

    async fn clone_voice(
        &self,
        recordings: &[Bytes],
        language_code: Option<&str>,
    ) -> Result<String, ProviderError> {
        let body = clone_request_body(recordings, language_code);
        let value = self.client.post_json("/voices/clone", &body).await?;
        value
            .get("voice_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse("missing voice_id".to_string()))
    }

    async fn delete_voice(&self, voice_id: &str) -> Result<(), ProviderError> {
        self.client.delete(&format!("/voices/{voice_id}")).await
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes, ProviderError> {
        self.client
            .post_bytes("/tts", &json!({"text": text, "voice_id": voice_id}))
            .await
    }

    async fn forced_alignment(
        &self,
        text: &str,
        audio: &[u8],
    ) -> Result<Option<Value>, ProviderError> {
        let body = json!({"text": text, "audio": BASE64.encode(audio)});
        let value = self.client.post_json("/alignment", &body).await?;
        Ok((!value.is_null()).then_some(value))
    }
}

fn clone_request_body(recordings: &[Bytes], language_code: Option<&str>) -> Value {
    json!({
        "recordings": recordings
            .iter()
            .map(|r| BASE64.encode(r))
            .collect::<Vec<String>>(),
        "language_code": language_code,
    })
}

fn parse_voices(value: Value) -> Result<Vec<VoiceData>, ProviderError> {
    let voices = value
        .get("voices")
        .cloned()
        .ok_or_else(|| ProviderError::InvalidResponse("missing voices field".to_string()))?;
    serde_json::from_value(voices)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad voice data: {e}")))
}

pub struct HttpMusicGenerator {
    client: ApiClient,
}

impl HttpMusicGenerator {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MusicGenerator for HttpMusicGenerator {
    async fn generate(&self, prompt: &str, duration_secs: u32) -> Result<Bytes, ProviderError> {
        self.client
            .post_bytes("/music", &json!({"prompt": prompt, "duration": duration_secs}))
            .await
    }
}

pub struct HttpTranslator {
    client: ApiClient,
}

impl HttpTranslator {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<Option<String>, ProviderError> {
        let body = json!({"text": text, "source_lang": source, "target_lang": target});
        let value = self.client.post_json("/translate", &body).await?;
        Ok(value
            .get("translation")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clone_body_carries_base64_recordings() {
        let recordings = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"\x00\xff")];
        let body = clone_request_body(&recordings, Some("de"));

        assert_eq!(body["language_code"], "de");
        assert_eq!(body["recordings"][0], BASE64.encode(b"abc"));
        assert_eq!(body["recordings"][1], BASE64.encode(b"\x00\xff"));
    }

    #[test]
    fn voices_response_parses_into_voice_data() {
        let voices = parse_voices(json!({
            "voices": [
                {"voice_id": "v1", "voice_name": "Clara", "labels": {"language": "en"}},
                {"voice_id": "v2", "voice_name": "Sam"}
            ]
        }))
        .unwrap();

        assert_eq!(voices.len(), 2);
        assert_eq!(voices[0].language(), Some("en"));
        assert!(voices[1].labels.is_empty());
    }

    #[test]
    fn transcript_response_requires_results_field() {
        let variants = parse_transcripts(json!({
            "results": [{
                "voice_model": "clara",
                "music_prompt": "calm piano",
                "transcript": "Hello",
                "insight_details": []
            }]
        }))
        .unwrap();
        assert_eq!(variants[0].voice_model, "clara");

        assert!(matches!(
            parse_transcripts(json!({"outputs": []})),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = ApiClient::new("http://localhost:9000/", None).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}
