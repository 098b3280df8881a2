//! HTTP client for an OpenAI-compatible model server.
//!
//! Embeddings go to `/v1/embeddings`, generation to `/v1/chat/completions`.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{AnalysisError, AnalysisResult};
use crate::providers::{EmbeddingProvider, TextGenerator};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct LlmClient {
    base_url: String,
    api_key: Option<String>,
    embedding_model: String,
    generation_model: String,
    http_client: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        embedding_model: &str,
        generation_model: &str,
        timeout: Duration,
    ) -> AnalysisResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::provider(format!("Failed to build HTTP client: {}", e)))?;
        info!("Provider client initialized with backend: {}", base_url);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            embedding_model: embedding_model.to_string(),
            generation_model: generation_model.to_string(),
            http_client,
        })
    }

    pub fn from_config(config: &Config) -> AnalysisResult<Self> {
        Self::new(
            &config.provider_base_url,
            config.provider_api_key.clone(),
            &config.embedding_model,
            &config.generation_model,
            Duration::from_secs(config.provider_timeout_seconds),
        )
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let request = self.http_client.post(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn check_status(response: reqwest::Response, what: &str) -> AnalysisResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AnalysisError::provider(format!("{} endpoint returned {}: {}", what, status, body)))
    }
}

#[async_trait]
impl EmbeddingProvider for LlmClient {
    async fn embed(&self, texts: &[String]) -> AnalysisResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Requesting embeddings for {} text(s)", texts.len());
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };
        let response = self
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalysisError::provider(format!("Embedding request failed: {}", e)))?;
        let response = Self::check_status(response, "Embedding").await?;
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::provider(format!("Failed to parse embedding response: {}", e)))?;

        // Servers may answer out of order; `index` is authoritative when present.
        if parsed.data.iter().all(|d| d.index.is_some()) {
            parsed.data.sort_by_key(|d| d.index);
        }
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        debug!(
            "Received {} embeddings (dim={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );
        Ok(embeddings)
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str) -> AnalysisResult<String> {
        debug!("Generating completion for prompt ({} chars)", prompt.len());
        let request = ChatCompletionRequest {
            model: &self.generation_model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: 400,
            temperature: 0.3,
            stream: false,
        };
        let response = self
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalysisError::provider(format!("Generation request failed: {}", e)))?;
        let response = Self::check_status(response, "Generation").await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::provider(format!("Failed to parse generation response: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(AnalysisError::provider("Generation returned no content"));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: &str) -> LlmClient {
        LlmClient::new(url, Some("secret".into()), "embed-model", "chat-model", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn embeddings_are_reordered_by_index() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(serde_json::json!({"model": "embed-model"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        let vectors = client(&server.url())
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn non_success_status_is_a_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let err = client(&server.url()).embed(&["x".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), "provider");
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn generate_returns_trimmed_message_content() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"  Keep the library open.  "}}]}"#)
            .create_async()
            .await;

        let text = client(&server.url()).generate("summarize").await.unwrap();
        assert_eq!(text, "Keep the library open.");
    }

    #[tokio::test]
    async fn empty_completion_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        assert!(client(&server.url()).generate("summarize").await.is_err());
    }

    #[test]
    fn empty_input_skips_the_network() {
        let client = client("http://127.0.0.1:9");
        let vectors = tokio_test::block_on(client.embed(&[])).unwrap();
        assert!(vectors.is_empty());
    }
}
