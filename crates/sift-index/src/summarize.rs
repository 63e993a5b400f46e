//! Optional file-level summaries.
//!
//! Summaries are enrichment only: a failed summary never blocks indexing,
//! the file is indexed without one.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default cap on characters sent to the summarizer.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 8000;

/// Produces a short description of a file's text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Truncate to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Summarizer backed by an OpenAI-compatible chat completions API.
pub struct ChatSummarizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_input_chars: usize,
}

impl ChatSummarizer {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            model,
            api_key,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    /// Strip reasoning blocks and surrounding whitespace from a reply.
    fn clean_reply(reply: &str) -> &str {
        reply.rsplit("</think>").next().unwrap_or(reply).trim()
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let input = truncate_chars(text, self.max_input_chars);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "Summarize the document in two or three sentences. Reply with the summary only."
                        .to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: input.to_string(),
                },
            ],
            max_tokens: 200,
            temperature: 0.2,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder.send().await?.error_for_status()?;
        let completion: ChatCompletionResponse = response.json().await?;
        let reply = completion
            .choices
            .first()
            .map(|c| Self::clean_reply(&c.message.content).to_string())
            .ok_or_else(|| anyhow!("Summarizer returned no choices"))?;

        if reply.is_empty() {
            return Err(anyhow!("Summarizer returned an empty reply"));
        }
        debug!(chars = reply.len(), "Generated summary");
        Ok(reply)
    }
}
