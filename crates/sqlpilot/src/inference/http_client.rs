//! HTTP inference client for OpenAI-compatible chat completion services.
//!
//! Request and response bodies may carry user data and are never logged;
//! only sizes, status codes and latency are.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::InferenceClient;
use crate::error::InferenceError;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct HttpInferenceClient {
    settings: InferenceSettings,
    http_client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(settings: InferenceSettings) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build inference HTTP client: {}", e))?;
        info!(
            "Inference client initialized with backend: {} (model {})",
            settings.base_url, settings.model
        );
        Ok(Self {
            settings,
            http_client,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn transport_error(&self, err: reqwest::Error) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout(self.settings.timeout)
        } else {
            // without_url keeps query strings (and any keys in them) out of logs
            InferenceError::Unavailable(err.without_url().to_string())
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError> {
        debug!("Submitting inference request ({} chars)", prompt.len());
        let request = ChatCompletionRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stream: false,
        };

        let started = Instant::now();
        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.settings.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            metrics::observe_inference(started.elapsed().as_secs_f64());
            warn!("Inference backend returned {}", status);
            return Err(InferenceError::Unavailable(format!(
                "backend returned {}",
                status
            )));
        }

        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        metrics::observe_inference(started.elapsed().as_secs_f64());

        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| InferenceError::MalformedResponse(format!("invalid JSON: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| InferenceError::MalformedResponse("no completion choices".to_string()))?;

        if content.trim().is_empty() {
            return Err(InferenceError::MalformedResponse("empty completion".to_string()));
        }

        debug!(
            "Inference reply received ({} chars in {:?})",
            content.len(),
            started.elapsed()
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn settings(base_url: String) -> InferenceSettings {
        InferenceSettings {
            base_url,
            model: "test-model".to_string(),
            api_key: Some("secret".to_string()),
            timeout: Duration::from_secs(5),
            max_tokens: 256,
            temperature: 0.1,
        }
    }

    #[tokio::test]
    async fn test_infer_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({
                "model": "test-model",
                "stream": false,
                "messages": [{"role": "user", "content": "ping"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"pong"}}]}"#)
            .create_async()
            .await;

        let client = HttpInferenceClient::new(settings(server.url())).unwrap();
        let reply = client.infer("ping").await.unwrap();

        assert_eq!(reply, "pong");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .expect(1)
            .create_async()
            .await;

        let client = HttpInferenceClient::new(settings(server.url())).unwrap();
        let err = client.infer("ping").await.unwrap_err();

        assert!(matches!(err, InferenceError::Unavailable(ref msg) if msg.contains("503")));
        // one call, no internal retry
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let client = HttpInferenceClient::new(settings(server.url())).unwrap();
        let err = client.infer("ping").await.unwrap_err();
        assert!(matches!(err, InferenceError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_choices_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let client = HttpInferenceClient::new(settings(server.url())).unwrap();
        let err = client.infer("ping").await.unwrap_err();
        assert_eq!(
            err,
            InferenceError::MalformedResponse("no completion choices".to_string())
        );
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_chunked_body(|w| {
                use std::io::Write as _;
                std::thread::sleep(Duration::from_millis(500));
                w.write_all(br#"{"choices":[{"message":{"content":"SELECT 1"}}]}"#)
            })
            .create_async()
            .await;

        let client = HttpInferenceClient::new(InferenceSettings {
            timeout: Duration::from_millis(100),
            ..settings(server.url())
        })
        .unwrap();
        let err = client.infer("ping").await.unwrap_err();
        assert_eq!(err, InferenceError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let client = HttpInferenceClient::new(settings("http://127.0.0.1:1".to_string())).unwrap();
        let err = client.infer("ping").await.unwrap_err();
        assert!(matches!(err, InferenceError::Unavailable(_)));
    }

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        let client = HttpInferenceClient::new(settings("http://localhost:8081/".to_string())).unwrap();
        assert_eq!(client.completions_url(), "http://localhost:8081/v1/chat/completions");
    }
}
