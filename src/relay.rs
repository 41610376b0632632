use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;

use crate::config::Settings;
use crate::models::{ChatRequest, ChatResponse, ExportRequest, TtsRequest};
use crate::sanitize::sanitize_for_display;
use crate::stream::StreamAssembler;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("server error: {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Client for the assistant backend.
///
/// No request timeout is set: latency is bounded by the backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    settings: Settings,
}

impl BackendClient {
    pub fn new(settings: Settings) -> Result<Self, RelayError> {
        let http = reqwest::ClientBuilder::new()
            .user_agent(concat!("page-assistant/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Ask the backend, preferring the streaming endpoint.
    ///
    /// `on_update` receives the sanitized answer so far after every streamed
    /// chunk. When the stream cannot be opened the buffered endpoint is used
    /// and `on_update` is never called.
    pub async fn chat<F>(&self, request: &ChatRequest, mut on_update: F) -> Result<ChatResponse, RelayError>
    where
        F: FnMut(&str),
    {
        if let Some(response) = self.chat_stream(request, &mut on_update).await? {
            return Ok(response);
        }
        self.chat_buffered(request).await
    }

    /// `Ok(None)` means the stream could not be opened and the caller should
    /// fall back.
    async fn chat_stream<F>(&self, request: &ChatRequest, on_update: &mut F) -> Result<Option<ChatResponse>, RelayError>
    where
        F: FnMut(&str),
    {
        let url = self.settings.endpoint("chat_stream");
        let response = match self.http.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "streaming request failed; falling back to /chat");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            tracing::debug!(status = response.status().as_u16(), "stream endpoint refused");
            return Ok(None);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.contains("text/plain") {
            tracing::debug!(%content_type, "stream endpoint returned non-text body");
            return Ok(None);
        }

        let mut assembler = StreamAssembler::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RelayError::Stream(e.to_string()))?;
            on_update(assembler.push(&chunk));
        }
        let response = assembler.finish();
        tracing::debug!(
            len = response.answer.len(),
            sources = response.sources.len(),
            "stream complete"
        );
        Ok(Some(response))
    }

    pub async fn chat_buffered(&self, request: &ChatRequest) -> Result<ChatResponse, RelayError> {
        let response = self
            .http
            .post(self.settings.endpoint("chat"))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Status(response.status().as_u16()));
        }
        let mut data: ChatResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Decode(e.to_string()))?;
        data.answer = sanitize_for_display(&data.answer);
        data.sources.retain(|s| !s.url.is_empty());
        data.streamed = false;
        Ok(data)
    }

    /// Markdown rendering of the page. Accepts either a JSON body with a
    /// `markdown` field or a plain text body.
    pub async fn export_markdown(&self, request: &ExportRequest) -> Result<String, RelayError> {
        let response = self
            .http
            .post(self.settings.endpoint("export_md"))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Status(response.status().as_u16()));
        }
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        if !is_json {
            return Ok(response.text().await?);
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| RelayError::Decode(e.to_string()))?;
        value
            .get("markdown")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::Decode("missing `markdown` field".to_string()))
    }

    pub async fn remote_config(&self) -> Result<Value, RelayError> {
        let response = self.http.get(self.settings.endpoint("config")).send().await?;
        json_body(response).await
    }

    pub async fn update_remote_config(&self, values: &Value) -> Result<Value, RelayError> {
        self.post_json("config", values).await
    }

    pub async fn tts_prepare(&self, text: &str) -> Result<Value, RelayError> {
        self.post_json("tts_prepare", &TtsRequest { text: text.to_string() }).await
    }

    pub async fn tts_summarize(&self, text: &str) -> Result<Value, RelayError> {
        self.post_json("tts_summarize", &TtsRequest { text: text.to_string() }).await
    }

    /// Synthesized audio bytes.
    pub async fn tts_synthesize(&self, text: &str) -> Result<Vec<u8>, RelayError> {
        let response = self
            .http
            .post(self.settings.endpoint("tts_sber_synthesize"))
            .json(&TtsRequest { text: text.to_string() })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value, RelayError> {
        let response = self
            .http
            .post(self.settings.endpoint(path))
            .json(body)
            .send()
            .await?;
        json_body(response).await
    }
}

async fn json_body(response: reqwest::Response) -> Result<Value, RelayError> {
    if !response.status().is_success() {
        return Err(RelayError::Status(response.status().as_u16()));
    }
    response
        .json()
        .await
        .map_err(|e| RelayError::Decode(e.to_string()))
}

/// Text to speak from a `/tts_prepare` or `/tts_summarize` reply, falling
/// back to `original` when the reply carries none.
pub fn speech_text(reply: &Value, original: &str) -> String {
    ["text", "summary"]
        .iter()
        .find_map(|key| reply.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(original)
        .to_string()
}
