// OpenAI and Azure OpenAI client
//
// Both providers speak the same request bodies; they differ in URL layout
// and in how the key is sent.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::LlmClient;
use super::types::{ChatRequest, ChatResponse, ImageRequest, ImageResponse};
use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const AZURE_API_VERSION: &str = "2024-02-01";

/// Which wire dialect to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    /// Azure routes each call to the deployment named after its model.
    Azure,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    provider: Provider,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(provider: Provider, api_key: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let base_url = match (provider, base_url.filter(|u| !u.trim().is_empty())) {
            (_, Some(url)) => url.trim_end_matches('/').to_string(),
            (Provider::OpenAi, None) => DEFAULT_BASE_URL.to_string(),
            (Provider::Azure, None) => {
                return Err(Error::MissingConfig("openai_endpoint_url".to_string()));
            }
        };
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(e.to_string()))?;
        Ok(Self {
            http,
            provider,
            api_key: api_key.to_string(),
            base_url,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn url(&self, path: &str, model: &str) -> String {
        match self.provider {
            Provider::OpenAi => format!("{}/{path}", self.base_url),
            Provider::Azure => format!(
                "{}/openai/deployments/{model}/{path}?api-version={AZURE_API_VERSION}",
                self.base_url
            ),
        }
    }

    fn post<B: serde::Serialize, R: DeserializeOwned>(&self, path: &str, model: &str, body: &B) -> Result<R> {
        let request = self.http.post(self.url(path, model)).json(body);
        let request = match self.provider {
            Provider::OpenAi => request.bearer_auth(&self.api_key),
            Provider::Azure => request.header("api-key", &self.api_key),
        };
        let response = request.send()?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(Error::http(status.as_u16(), message));
        }

        response
            .json()
            .map_err(|e| Error::transport(format!("invalid response: {e}")))
    }
}

impl LlmClient for OpenAiClient {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.post("chat/completions", &request.model, request)
    }

    fn draw(&self, request: &ImageRequest) -> Result<ImageResponse> {
        self.post("images/generations", &request.model, request)
    }
}
