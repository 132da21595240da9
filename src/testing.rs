//! Test doubles for the inference service.
//!
//! [`ScriptedClient`] answers `chat` calls from a queue of scripted replies
//! and records every request, so controller and command tests can run
//! without a live Ollama server.
//!
//! ```
//! use ollamachat::testing::ScriptedClient;
//!
//! let client = ScriptedClient::with_models(["llama3.2:1b"]);
//! client.push_reply("Hello! How can I help?");
//! client.push_held("this one waits for release() or abort");
//! ```

use crate::error::{ChatError, ChatResult};
use crate::ollama_api::{ChatMessage, InferenceClient};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What the next `chat` call does.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(ChatError),
    /// Blocks until [`ScriptedClient::release`] or cancellation.
    Hold(String),
    /// Cancels the call's token and still returns the text, like a stream
    /// that finishes just as an abort lands.
    Late(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Default)]
pub struct ScriptedClient {
    models: Mutex<Option<ChatResult<Vec<String>>>>,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<RecordedRequest>>,
    started: Notify,
    release: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        *lock(&client.models) = Some(Ok(models.into_iter().map(Into::into).collect()));
        client
    }

    pub fn fail_models(&self, error: ChatError) {
        *lock(&self.models) = Some(Err(error));
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        lock(&self.replies).push_back(Reply::Text(text.into()));
    }

    pub fn push_error(&self, error: ChatError) {
        lock(&self.replies).push_back(Reply::Fail(error));
    }

    pub fn push_held(&self, text: impl Into<String>) {
        lock(&self.replies).push_back(Reply::Hold(text.into()));
    }

    pub fn push_late(&self, text: impl Into<String>) {
        lock(&self.replies).push_back(Reply::Late(text.into()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Resolves once a held reply is being waited on.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Lets a held reply complete.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn list_models(&self) -> ChatResult<Vec<String>> {
        lock(&self.models).clone().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        lock(&self.requests).push(RecordedRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
        });
        let reply = lock(&self.replies).pop_front();

        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Hold(text)) => {
                self.started.notify_one();
                tokio::select! {
                    _ = cancel.cancelled() => Err(ChatError::Cancelled),
                    _ = self.release.notified() => Ok(text),
                }
            }
            Some(Reply::Late(text)) => {
                cancel.cancel();
                Ok(text)
            }
            None => {
                let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
                Ok(format!("echo: {}", last))
            }
        }
    }
}
