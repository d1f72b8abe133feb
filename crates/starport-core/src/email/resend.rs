// Resend mail API client
//
// Blocking reqwest client; one POST per message.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{MailClient, SendEmailRequest, SendEmailResponse};
use crate::error::{Error, Result};

pub const DEFAULT_ENDPOINT: &str = "https://api.resend.com";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    #[serde(skip_serializing_if = "no_items")]
    cc: &'a [String],
    #[serde(skip_serializing_if = "no_items")]
    bcc: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<ResendAttachment<'a>>,
}

fn no_items(list: &&[String]) -> bool {
    list.is_empty()
}

#[derive(Serialize)]
struct ResendAttachment<'a> {
    filename: &'a str,
    /// Base64 of the raw bytes
    content: String,
}

#[derive(Deserialize)]
struct ResendResponse {
    id: String,
}

#[derive(Deserialize)]
struct ResendError {
    message: String,
    #[allow(dead_code)]
    name: Option<String>,
}

/// Client for `POST {endpoint}/emails`.
pub struct ResendClient {
    http: reqwest::blocking::Client,
    api_key: String,
    endpoint: String,
}

impl ResendClient {
    pub fn new(api_key: &str, endpoint: Option<&str>, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            endpoint: endpoint
                .filter(|e| !e.trim().is_empty())
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

impl MailClient for ResendClient {
    fn send(&self, request: &SendEmailRequest) -> Result<SendEmailResponse> {
        let body = ResendRequest {
            from: &request.from,
            to: &request.to,
            subject: &request.subject,
            cc: &request.cc,
            bcc: &request.bcc,
            reply_to: request.reply_to.as_deref(),
            html: request.html.as_deref(),
            text: request.text.as_deref(),
            attachments: request
                .attachments
                .iter()
                .map(|a| ResendAttachment {
                    filename: &a.filename,
                    content: STANDARD.encode(&a.content),
                })
                .collect(),
        };

        let response = self
            .http
            .post(format!("{}/emails", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ResendError>(&error_text)
                .map(|e| e.message)
                .unwrap_or(error_text);
            return Err(Error::http(status.as_u16(), message));
        }

        let parsed: ResendResponse = response
            .json()
            .map_err(|e| Error::transport(format!("invalid response: {e}")))?;
        Ok(SendEmailResponse { id: parsed.id })
    }
}
