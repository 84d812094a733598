//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use reportloom_shared::{BackendConfig, ReportLoomError, Result};

use crate::{CompletionBackend, CompletionRequest, USER_AGENT};

/// Chat completions over `POST {base_url}/chat/completions` with a bearer key.
#[derive(Debug, Clone)]
pub struct OpenAiCompatBackend {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            ReportLoomError::config(format!("invalid backend base_url '{base_url}': {e}"))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ReportLoomError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base.as_str().trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from the `[backend]` config section and a resolved API key.
    pub fn from_config(config: &BackendConfig, api_key: impl Into<String>) -> Result<Self> {
        Self::new(
            &config.base_url,
            api_key,
            config.model.clone(),
            config.timeout_secs,
        )
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, max_tokens = request.max_tokens))]
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReportLoomError::Backend(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ReportLoomError::Backend(describe_failure(status, &detail)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReportLoomError::Backend(format!("malformed completion response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ReportLoomError::Backend("completion response has no content".into()))?;

        debug!(chars = text.len(), "completion received");
        Ok(text)
    }
}

fn describe_failure(status: StatusCode, detail: &str) -> String {
    let detail: String = detail.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("authentication rejected (HTTP {status}): {detail}")
        }
        StatusCode::TOO_MANY_REQUESTS => format!("rate limited (HTTP {status}): {detail}"),
        _ => format!("HTTP {status}: {detail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = OpenAiCompatBackend::new("not a url", "k", "m", 5).unwrap_err();
        assert!(matches!(err, ReportLoomError::Config { .. }));
    }

    #[test]
    fn from_config_uses_model() {
        let backend = OpenAiCompatBackend::from_config(&BackendConfig::default(), "k").unwrap();
        assert_eq!(backend.model_id(), BackendConfig::default().model);
        assert!(backend.endpoint.ends_with("/chat/completions"));
    }

    #[tokio::test]
    async fn complete_sends_bearer_and_returns_content() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "max_tokens": 128,
                "messages": [
                    { "role": "system", "content": "sys" },
                    { "role": "user", "content": "summarize this" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("a short summary")))
            .expect(1)
            .mount(&server)
            .await;

        let backend =
            OpenAiCompatBackend::new(&format!("{}/v1", server.uri()), "secret", "test-model", 5)
                .unwrap();
        let request = CompletionRequest::new("summarize this", 128).with_system("sys");
        let text = backend.complete(&request).await.unwrap();
        assert_eq!(text, "a short summary");
    }

    #[tokio::test]
    async fn rate_limit_is_a_backend_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let backend = OpenAiCompatBackend::new(&server.uri(), "k", "m", 5).unwrap();
        let err = backend
            .complete(&CompletionRequest::new("x", 8))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportLoomError::Backend(_)));
        assert!(err.to_string().contains("rate limited"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let backend = OpenAiCompatBackend::new(&server.uri(), "k", "m", 5).unwrap();
        let err = backend
            .complete(&CompletionRequest::new("x", 8))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no content"));
    }
}
