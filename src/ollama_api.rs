// Handles communication with the local inference API (Ollama)

use crate::error::{ChatError, ChatResult};

use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*<think>.*?</think>(\s*)").expect("Invalid Regex"));

/// A single turn sent to `/api/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
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

/// The inference service as seen by the generation controller.
///
/// Implementations must give up promptly with [`ChatError::Cancelled`] once
/// `cancel` fires.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn list_models(&self) -> ChatResult<Vec<String>>;

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<String>;
}

#[derive(Deserialize)]
struct ModelList {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// One line of a streamed `/api/chat` response.
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl ChatChunk {
    /// Appends this chunk's text to `reply`; returns whether the model is done.
    fn accumulate(self, reply: &mut String) -> ChatResult<bool> {
        if let Some(error) = self.error {
            return Err(ChatError::Upstream(error));
        }
        if let Some(message) = self.message {
            reply.push_str(&message.content);
        }
        Ok(self.done)
    }
}

/// Reassembles newline-delimited JSON from arbitrarily split network chunks.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> ChatResult<Vec<ChatChunk>> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(chunk) = parse_line(&line)? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// Parses whatever is left once the stream has ended.
    pub fn finish(&mut self) -> ChatResult<Option<ChatChunk>> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> ChatResult<Option<ChatChunk>> {
    let text = std::str::from_utf8(line)
        .map_err(|e| ChatError::upstream(format!("response is not valid UTF-8: {}", e)))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

async fn check_status(response: Response) -> ChatResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    if detail.trim().is_empty() {
        Err(ChatError::Upstream(format!("API call failed with status: {}", status)))
    } else {
        Err(ChatError::Upstream(format!(
            "API call failed with status: {}: {}",
            status,
            detail.trim()
        )))
    }
}

/// HTTP client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_URL)
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn list_models(&self) -> ChatResult<Vec<String>> {
        let response = self
            .client
            .get(self.endpoint("api/tags"))
            .send()
            .await
            .map_err(|e| ChatError::upstream(format!("Failed to load models: {}", e)))?;
        let response = check_status(response).await?;

        let list: ModelList = response.json().await?;
        Ok(list.models.into_iter().map(|m| m.name).collect())
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        let request = self.client.post(self.endpoint("api/chat")).json(&ChatRequest {
            model,
            messages,
            stream: true,
        });

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = request.send() => response
                .map_err(|e| ChatError::upstream(format!("Failed to make API call: {}", e)))?,
        };
        let response = check_status(response).await?;

        let mut stream = response.bytes_stream();
        let mut decoder = NdjsonDecoder::default();
        let mut reply = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = stream.next() => next,
            };
            let Some(bytes) = next else {
                break;
            };
            for chunk in decoder.push(&bytes?)? {
                if chunk.accumulate(&mut reply)? {
                    debug!(model, chars = reply.len(), "chat stream finished");
                    return Ok(reply);
                }
            }
        }

        if let Some(chunk) = decoder.finish()? {
            if chunk.accumulate(&mut reply)? {
                return Ok(reply);
            }
        }
        Err(ChatError::upstream(
            "response stream ended before the model finished",
        ))
    }
}

/// Instruction asking the model to title a conversation from its first prompt.
pub fn title_request(prompt: &str) -> String {
    format!(
        "Generate a concise and informative title (at most 10 words) summarizing the prompt. \
         Respond with only the title as plain text. Do not include any explanations, formatting, \
         or additional content. The prompt to summarize is: ```{}```",
        prompt
    )
}

/// Turns a raw model answer into a session title, or `None` if nothing usable is left.
pub fn clean_title(raw: &str, model: &str) -> Option<String> {
    let stripped = THINK_BLOCK.replace(raw, "");
    let title = stripped
        .trim()
        .trim_matches('"')
        .trim_matches('*')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() {
        None
    } else {
        Some(format!("{}: {}", model, title))
    }
}
