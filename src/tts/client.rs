//! HTTP access to the speech endpoint
//!
//! `POST {endpoint}` with a bearer key and a JSON body. `mp3` responses are
//! read whole; `pcm` responses are consumed as a byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde::Serialize;

use super::error::{TtsError, TtsResult};
use super::voices::{ResponseFormat, TtsModel, Voice};
use crate::config::TtsConfig;

/// Raw audio chunks in arrival order.
pub type AudioByteStream = BoxStream<'static, TtsResult<Bytes>>;

const MIN_SPEED: f32 = 0.25;
const MAX_SPEED: f32 = 4.0;

/// What to say and how.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Voice,
    pub model: TtsModel,
    pub instructions: Option<String>,
    pub speed: Option<f32>,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: Voice::default(),
            model: TtsModel::default(),
            instructions: None,
            speed: None,
        }
    }

    pub fn voice(mut self, voice: Voice) -> Self {
        self.voice = voice;
        self
    }

    pub fn model(mut self, model: TtsModel) -> Self {
        self.model = model;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Playback speed, clamped to what the endpoint accepts.
    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed.clamp(MIN_SPEED, MAX_SPEED));
        self
    }

    pub fn body(&self, response_format: ResponseFormat) -> SpeechBody<'_> {
        SpeechBody {
            model: self.model,
            input: &self.text,
            voice: self.voice,
            response_format,
            instructions: self.instructions.as_deref(),
            speed: self.speed,
        }
    }
}

/// JSON body of a speech request.
#[derive(Debug, Serialize)]
pub struct SpeechBody<'a> {
    pub model: TtsModel,
    pub input: &'a str,
    pub voice: Voice,
    pub response_format: ResponseFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

/// Source of synthesized audio.
///
/// Both methods resolve once the response headers are in. A non-success
/// status is a [`TtsError::RemoteServiceError`]; failing to get any response
/// is a [`TtsError::TransportError`].
#[async_trait]
pub trait SpeechTransport: Send + Sync {
    /// Complete MP3 file.
    async fn fetch_audio(&self, request: &SpeechRequest) -> TtsResult<Bytes>;

    /// Headerless PCM as it is produced.
    async fn stream_audio(&self, request: &SpeechRequest) -> TtsResult<AudioByteStream>;
}

/// [`SpeechTransport`] over reqwest.
#[derive(Clone)]
pub struct OpenAiSpeechClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiSpeechClient {
    pub fn new(config: &TtsConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: &TtsConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(
        &self,
        request: &SpeechRequest,
        format: ResponseFormat,
    ) -> reqwest::RequestBuilder {
        self.http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request.body(format))
    }

    async fn send(
        &self,
        request: &SpeechRequest,
        format: ResponseFormat,
    ) -> TtsResult<reqwest::Response> {
        log::info!(
            "[Speech] POST {} model={} voice={} format={} chars={}",
            self.endpoint,
            request.model,
            request.voice,
            format,
            request.text.chars().count()
        );

        let response = self
            .build_request(request, format)
            .send()
            .await
            .map_err(|e| TtsError::TransportError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("[Speech] Request rejected with {}", status);
            return Err(TtsError::RemoteServiceError {
                status: status.as_u16(),
                body,
            });
        }

        log::debug!("[Speech] Response {}", status);
        Ok(response)
    }
}

#[async_trait]
impl SpeechTransport for OpenAiSpeechClient {
    async fn fetch_audio(&self, request: &SpeechRequest) -> TtsResult<Bytes> {
        let response = self.send(request, ResponseFormat::Mp3).await?;
        response
            .bytes()
            .await
            .map_err(|e| TtsError::TransportError(e.to_string()))
    }

    async fn stream_audio(&self, request: &SpeechRequest) -> TtsResult<AudioByteStream> {
        let response = self.send(request, ResponseFormat::Pcm).await?;
        Ok(response
            .bytes_stream()
            .map_err(|e| TtsError::StreamPlaybackError(e.to_string()))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenAiSpeechClient {
        let config =
            TtsConfig::new("test_key").with_endpoint(format!("{}/v1/audio/speech", server.uri()));
        OpenAiSpeechClient::new(&config)
    }

    #[test]
    fn test_body_omits_unset_fields() {
        let request = SpeechRequest::new("Hello").voice(Voice::Nova);
        let json = serde_json::to_value(request.body(ResponseFormat::Pcm)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "tts-1",
                "input": "Hello",
                "voice": "nova",
                "response_format": "pcm",
            })
        );
    }

    #[test]
    fn test_body_with_instructions_and_speed() {
        let request = SpeechRequest::new("Hi")
            .model(TtsModel::Gpt4oMiniTts)
            .instructions("whisper")
            .speed(9.0);
        let json = serde_json::to_value(request.body(ResponseFormat::Mp3)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini-tts");
        assert_eq!(json["instructions"], "whisper");
        assert_eq!(json["speed"], 4.0);
        assert_eq!(json["response_format"], "mp3");
    }

    #[test]
    fn test_request_headers() {
        let config = TtsConfig::new("test_key");
        let client = OpenAiSpeechClient::new(&config);
        let built = client
            .build_request(&SpeechRequest::new("Hello"), ResponseFormat::Mp3)
            .build()
            .unwrap();

        assert_eq!(built.url().as_str(), crate::config::DEFAULT_ENDPOINT);
        assert_eq!(built.headers().get("Authorization").unwrap(), "Bearer test_key");
        assert_eq!(
            built.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_fetch_audio_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(header("Authorization", "Bearer test_key"))
            .and(body_json(serde_json::json!({
                "model": "tts-1",
                "input": "Hello",
                "voice": "alloy",
                "response_format": "mp3",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xfb, 0x90]))
            .expect(1)
            .mount(&server)
            .await;

        let audio = client_for(&server)
            .fetch_audio(&SpeechRequest::new("Hello"))
            .await
            .unwrap();
        assert_eq!(audio.as_ref(), &[0xff, 0xfb, 0x90]);
    }

    #[tokio::test]
    async fn test_error_status_carries_code_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .stream_audio(&SpeechRequest::new("Hello"))
            .await
            .err()
            .unwrap();
        match err {
            TtsError::RemoteServiceError { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_audio_yields_all_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 10_000]))
            .mount(&server)
            .await;

        let mut stream = client_for(&server)
            .stream_audio(&SpeechRequest::new("Hello"))
            .await
            .unwrap();
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 10_000);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let config = TtsConfig::new("k").with_endpoint("http://127.0.0.1:9/v1/audio/speech");
        let err = OpenAiSpeechClient::new(&config)
            .fetch_audio(&SpeechRequest::new("Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, TtsError::TransportError(_)));
    }
}
