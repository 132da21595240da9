// Runs generations against the inference service, one at a time

use crate::db::HistoryEntry;
use crate::error::{ChatError, ChatResult};
use crate::ollama_api::{clean_title, title_request, ChatMessage, InferenceClient};

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Idle,
    Sending,
}

/// Owns the single generation slot and its cancellation handle.
///
/// The handle is installed and removed under the same lock `abort` takes, so
/// an abort can only ever signal the generation that is currently running.
pub struct GenerationController {
    client: Arc<dyn InferenceClient>,
    in_flight: Mutex<Option<CancellationToken>>,
}

/// Returns the controller to `Idle` however the generation ends,
/// including when the caller drops the future.
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl GenerationController {
    pub fn new(client: Arc<dyn InferenceClient>) -> Self {
        Self {
            client,
            in_flight: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> GenerationPhase {
        if self.slot().is_some() {
            GenerationPhase::Sending
        } else {
            GenerationPhase::Idle
        }
    }

    pub async fn list_models(&self) -> ChatResult<Vec<String>> {
        self.client.list_models().await
    }

    /// Sends `prompt` on its own, without conversation context.
    pub async fn generate(&self, prompt: &str, model: &str) -> ChatResult<String> {
        self.run(model, vec![ChatMessage::user(prompt)]).await
    }

    /// Sends `prompt` after replaying `history` as prior turns.
    pub async fn generate_in_context(
        &self,
        history: &[HistoryEntry],
        prompt: &str,
        model: &str,
    ) -> ChatResult<String> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 1);
        for entry in history {
            messages.push(ChatMessage::user(entry.user_message.as_str()));
            messages.push(ChatMessage::assistant(entry.model_response.as_str()));
        }
        messages.push(ChatMessage::user(prompt));

        self.run(model, messages).await
    }

    /// Asks the model to title a conversation that starts with `prompt`.
    pub async fn suggest_title(&self, prompt: &str, model: &str) -> ChatResult<Option<String>> {
        let raw = self
            .run(model, vec![ChatMessage::user(title_request(prompt))])
            .await?;
        Ok(clean_title(&raw, model))
    }

    /// Cancels the in-flight generation. Returns `false` when there was none.
    pub fn abort(&self) -> bool {
        match self.slot().as_ref() {
            Some(token) => {
                token.cancel();
                info!("generation abort requested");
                true
            }
            None => {
                debug!("abort requested with no generation in flight");
                false
            }
        }
    }

    fn begin(&self) -> ChatResult<(SlotGuard<'_>, CancellationToken)> {
        let mut slot = self.slot();
        if slot.is_some() {
            warn!("rejected generation: another one is in flight");
            return Err(ChatError::Busy);
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Ok((
            SlotGuard {
                slot: &self.in_flight,
            },
            token,
        ))
    }

    async fn run(&self, model: &str, messages: Vec<ChatMessage>) -> ChatResult<String> {
        let (_guard, token) = self.begin()?;
        info!(model, messages = messages.len(), "generation started");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ChatError::Cancelled),
            result = self.client.chat(model, &messages, &token) => result,
        };
        // an abort that lands while the answer is being handed back still wins
        let result = match result {
            Ok(_) if token.is_cancelled() => Err(ChatError::Cancelled),
            other => other,
        };

        match &result {
            Ok(reply) => info!(model, chars = reply.len(), "generation completed"),
            Err(ChatError::Cancelled) => info!(model, "generation cancelled"),
            Err(e) => warn!(model, error = %e, "generation failed"),
        }
        result
    }
}
