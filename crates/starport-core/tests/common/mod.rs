//! Shared fakes for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use starport_core::email::{MailClient, SendEmailRequest, SendEmailResponse};
use starport_core::llm::LlmClient;
use starport_core::llm::types::{
    ChatChoice, ChatRequest, ChatResponse, ImageData, ImageRequest, ImageResponse, ResponseMessage,
};
use starport_core::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

type ChatScript = Box<dyn Fn(usize) -> Result<ChatResponse> + Send + Sync>;

/// LLM client whose answer depends on the attempt number (starting at 0).
pub struct CountingLlm {
    calls: AtomicUsize,
    script: ChatScript,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl CountingLlm {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(usize) -> Result<ChatResponse> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `contents`, one choice each.
    pub fn answering(contents: &[&str]) -> Self {
        let response = chat_response(contents);
        Self::new(move |_| Ok(response.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LlmClient for CountingLlm {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        (self.script)(attempt)
    }

    /// URL mode answers `https://img.example/{i}.png`; `b64_json` mode
    /// answers a `(i + 2)`-pixel square PNG per image.
    fn draw(&self, request: &ImageRequest) -> Result<ImageResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inline = request.response_format == "b64_json";
        Ok(ImageResponse {
            created: 1,
            data: (0..request.n)
                .map(|i| {
                    if inline {
                        ImageData {
                            b64_json: Some(STANDARD.encode(png_square(i + 2))),
                            ..ImageData::default()
                        }
                    } else {
                        ImageData {
                            url: Some(format!("https://img.example/{i}.png")),
                            ..ImageData::default()
                        }
                    }
                })
                .collect(),
        })
    }
}

pub fn chat_response(contents: &[&str]) -> ChatResponse {
    ChatResponse {
        id: "chatcmpl-test".into(),
        model: "gpt-test".into(),
        choices: contents
            .iter()
            .enumerate()
            .map(|(i, c)| ChatChoice {
                index: i as u32,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: Some((*c).to_string()),
                },
                finish_reason: Some("stop".into()),
            })
            .collect(),
        ..ChatResponse::default()
    }
}

/// Encoded PNG of a `side` x `side` transparent square.
pub fn png_square(side: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(RgbaImage::new(side, side))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

pub fn bad_request() -> Error {
    Error::http(400, "invalid request")
}

pub fn unavailable() -> Error {
    Error::http(503, "service unavailable")
}

/// Mail client that records every request.
#[derive(Default)]
pub struct CountingMail {
    pub sent: Mutex<Vec<SendEmailRequest>>,
}

impl CountingMail {
    pub fn calls(&self) -> usize {
        self.sent.lock().len()
    }
}

impl MailClient for CountingMail {
    fn send(&self, request: &SendEmailRequest) -> Result<SendEmailResponse> {
        let mut sent = self.sent.lock();
        sent.push(request.clone());
        Ok(SendEmailResponse {
            id: format!("msg-{}", sent.len()),
        })
    }
}
