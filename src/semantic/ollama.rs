//! Ollama HTTP client for embedding generation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::{Embedder, EmbeddingError};

pub struct OllamaClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

impl OllamaClient {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.strip_suffix('/').unwrap_or(base_url).to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::blocking::RequestBuilder {
        let url = format!("{}{}", self.base_url, endpoint);
        log::debug!("{method} {url}");

        let builder = self.client.request(method, &url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn send(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, EmbeddingError> {
        let response = builder.send().map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EmbeddingError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// Models installed on the server.
    pub fn installed_models(&self) -> Result<Vec<InstalledModel>, EmbeddingError> {
        let response = self.send(self.request(reqwest::Method::GET, "/api/tags"))?;
        let tags: TagsResponse = response
            .json()
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        Ok(tags.models)
    }
}

fn map_transport_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_connect() || err.is_timeout() {
        EmbeddingError::Unreachable(err.to_string())
    } else {
        EmbeddingError::InvalidResponse(err.to_string())
    }
}

impl Embedder for OllamaClient {
    fn generate(&self, text: &str, model: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self.send(
            self.request(reqwest::Method::POST, "/api/embeddings")
                .json(&EmbeddingRequest {
                    model,
                    prompt: text,
                }),
        )?;

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse(
                "empty embedding vector".to_string(),
            ));
        }

        Ok(parsed.embedding)
    }

    fn test_connection(&self) -> bool {
        match self.installed_models() {
            Ok(models) => {
                log::debug!("ollama reachable, {} models installed", models.len());
                true
            }
            Err(e) => {
                log::warn!("ollama connection test failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_server() {
        // port 9 (discard) is closed on test machines
        let client =
            OllamaClient::new("http://127.0.0.1:9/", None, Duration::from_secs(2)).unwrap();
        assert!(!client.test_connection());

        let err = client.generate("hello", "nomic-embed-text").unwrap_err();
        assert!(err.is_unreachable(), "unexpected error: {err}");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = OllamaClient::new(
            "http://localhost:11434/",
            Some(String::new()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
        assert!(client.auth_token.is_none());
    }

    #[test]
    #[ignore = "requires a running ollama server"]
    fn test_live_embedding() {
        let client =
            OllamaClient::new("http://localhost:11434", None, Duration::from_secs(60)).unwrap();
        assert!(client.test_connection());
        let vector = client.generate("hello world", "nomic-embed-text").unwrap();
        assert!(!vector.is_empty());
    }
}
