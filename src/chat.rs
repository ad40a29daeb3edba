use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::conf::ConfLlm;

#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream rate limit")]
    RateLimited,

    #[error("upstream error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("empty completion")]
    EmptyResponse,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub role: String,
    pub content: String,
}

impl Msg {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Msg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Serialize, Debug)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChatResponse {
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Choice {
    pub message: ResponseMsg,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResponseMsg {
    pub content: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Deserialize, Debug)]
pub struct ChatChunk {
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
pub struct ChunkChoice {
    pub delta: Delta,
}

#[derive(Deserialize, Debug)]
pub struct Delta {
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub delta: Option<String>,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Client for an OpenAI-compatible chat-completions upstream.
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(conf: &ConfLlm) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f32(conf.request_timeout))
            .build()?;
        Ok(Self {
            client,
            base_url: conf.base_url.trim_end_matches('/').to_string(),
            api_key: conf.api_key.clone(),
            model: conf.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Exactly one upstream invocation per call.
    pub async fn complete(
        &self,
        messages: Vec<Msg>,
    ) -> Result<Completion, LlmError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: None,
            stream_options: None,
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(extract_error(response).await);
        }
        let response: ChatResponse = response.json().await?;
        let model = response.model;
        let usage = response.usage;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::EmptyResponse)?;
        Ok(Completion {
            content,
            model,
            usage,
        })
    }

    /// Streaming invocation. The terminal chunk carries usage metadata when
    /// the upstream honors `stream_options.include_usage`.
    pub async fn complete_stream(
        &self,
        messages: Vec<Msg>,
    ) -> Result<
        impl Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static,
        LlmError,
    > {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: Some(true),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(extract_error(response).await);
        }
        let mut bytes = response.bytes_stream();
        Ok(async_stream::try_stream! {
            // SSE lines may split across network chunks; buffer and cut on
            // newlines.
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let Some(data) = line.trim().strip_prefix("data:")
                    else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<ChatChunk>(data) {
                        Err(error) => tracing::debug!(
                            ?error,
                            "Skipping unparseable stream chunk."
                        ),
                        Ok(chunk) => {
                            let delta = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|choice| choice.delta.content);
                            if delta.is_some() || chunk.usage.is_some() {
                                yield StreamEvent {
                                    delta,
                                    model: chunk.model,
                                    usage: chunk.usage,
                                };
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn extract_error(response: reqwest::Response) -> LlmError {
    let status = response.status();
    match status {
        reqwest::StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited,
        _ => {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            LlmError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}
