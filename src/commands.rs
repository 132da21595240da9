// Command surface called by the presentation layer

use crate::db::{HistoryEntry, PreferenceStore, Session, SessionStore, SharedConnection};
use crate::error::{ChatError, ChatResult};
use crate::generation::{GenerationController, GenerationPhase};
use crate::ollama_api::InferenceClient;
use crate::session::CurrentSession;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SELECTED_MODEL_KEY: &str = "selected_model_name";

/// How a brand-new session gets its title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleStrategy {
    /// First line of the prompt, cut to `title_max_chars`.
    #[default]
    Truncate,
    /// Ask the selected model, falling back to `Truncate` on failure.
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub title_strategy: TitleStrategy,
    pub title_max_chars: usize,
    /// Replay the session's earlier exchanges with every prompt.
    pub send_history: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            title_strategy: TitleStrategy::Truncate,
            title_max_chars: 48,
            send_history: true,
        }
    }
}

/// Title derived from the first non-empty line of a prompt.
pub fn derive_title(prompt: &str, max_chars: usize) -> String {
    let max_chars = max_chars.max(1);
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut title: String = collapsed.chars().take(max_chars).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}

/// Composes the stores, the current-session pointer and the generation
/// controller into the operations the UI invokes.
///
/// Generation does not hold any lock the other commands need, so listing,
/// switching or renaming stay responsive while a reply is being produced.
pub struct ChatCommands {
    sessions: SessionStore,
    preferences: PreferenceStore,
    current: CurrentSession,
    generator: GenerationController,
    options: ChatOptions,
}

impl ChatCommands {
    pub fn new(
        conn: SharedConnection,
        client: Arc<dyn InferenceClient>,
        options: ChatOptions,
    ) -> Self {
        Self {
            sessions: SessionStore::new(conn.clone()),
            preferences: PreferenceStore::new(conn),
            current: CurrentSession::new(),
            generator: GenerationController::new(client),
            options,
        }
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn current_session_id(&self) -> Option<i64> {
        self.current.get()
    }

    pub fn generation_phase(&self) -> GenerationPhase {
        self.generator.phase()
    }

    /// Points the tracker at the most recently created session, if there is one.
    pub async fn resume_latest_session(&self) -> ChatResult<Option<Session>> {
        let latest = self.sessions.latest_session().await?;
        if let Some(session) = &latest {
            self.current.set(session.id);
            info!(session_id = session.id, "resumed latest chat session");
        }
        Ok(latest)
    }

    /// The current session, created with an empty title if there is none.
    pub async fn get_current_session(&self) -> ChatResult<Session> {
        if let Some(id) = self.current.get() {
            if let Some(session) = self.sessions.get_session(id).await? {
                return Ok(session);
            }
            warn!(session_id = id, "current session no longer exists");
        }

        let session = self.sessions.create_session("").await?;
        self.current.set(session.id);
        Ok(session)
    }

    pub async fn list_sessions(&self) -> ChatResult<Vec<Session>> {
        self.sessions.list_sessions().await
    }

    pub async fn switch_session(&self, id: i64) -> ChatResult<Session> {
        let session = self
            .sessions
            .get_session(id)
            .await?
            .ok_or(ChatError::NotFound(id))?;
        self.current.set(session.id);
        debug!(session_id = id, "switched chat session");
        Ok(session)
    }

    pub fn start_new_session(&self) {
        self.current.clear();
        debug!("cleared current chat session");
    }

    pub async fn delete_session(&self, id: i64) -> ChatResult<()> {
        self.sessions.delete_session(id).await?;
        if self.current.clear_if(id) {
            debug!(session_id = id, "deleted the current chat session");
        }
        Ok(())
    }

    pub async fn rename_session(&self, id: i64, title: &str) -> ChatResult<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::validation("session title must not be empty"));
        }
        self.sessions.rename_session(id, title).await
    }

    pub async fn list_models(&self) -> ChatResult<Vec<String>> {
        self.generator.list_models().await
    }

    pub async fn get_selected_model(&self) -> ChatResult<Option<String>> {
        let model = self.preferences.get(SELECTED_MODEL_KEY).await?;
        Ok(model.filter(|m| !m.trim().is_empty()))
    }

    pub async fn set_selected_model(&self, model: &str) -> ChatResult<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ChatError::validation("model name must not be empty"));
        }
        self.preferences.set(SELECTED_MODEL_KEY, model).await
    }

    pub async fn load_history_for_current_session(&self) -> ChatResult<Vec<HistoryEntry>> {
        match self.current.get() {
            Some(id) => self.sessions.load_history(id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Generates a reply to `prompt` and records the exchange.
    ///
    /// Nothing is written unless the model produced a full reply: a busy,
    /// cancelled or failed generation leaves sessions, history and the
    /// current-session pointer untouched.
    pub async fn send_message(&self, prompt: &str) -> ChatResult<String> {
        if prompt.trim().is_empty() {
            return Err(ChatError::validation("prompt must not be empty"));
        }
        let model = self
            .get_selected_model()
            .await?
            .ok_or_else(|| ChatError::validation("no model selected"))?;

        let target = match self.current.get() {
            Some(id) => self.sessions.get_session(id).await?,
            None => None,
        };
        let context = match &target {
            Some(session) if self.options.send_history => {
                self.sessions.load_history(session.id).await?
            }
            _ => Vec::new(),
        };

        let reply = self
            .generator
            .generate_in_context(&context, prompt, &model)
            .await?;

        let title = derive_title(prompt, self.options.title_max_chars);
        if let Some(session) = target {
            self.sessions
                .append_history_titled(session.id, prompt, &reply, &title)
                .await?;
            return Ok(reply);
        }

        // the pointer may have moved while the model was answering
        let pointer = self.current.get();
        if let Some(id) = pointer {
            if self.sessions.get_session(id).await?.is_some() {
                self.sessions
                    .append_history_titled(id, prompt, &reply, &title)
                    .await?;
                return Ok(reply);
            }
        }

        let title = self.new_session_title(prompt, &model).await;
        let (session, _) = self.sessions.start_session(&title, prompt, &reply).await?;
        if !self.current.set_if(pointer, session.id) {
            debug!(session_id = session.id, "current session changed during generation");
        }

        Ok(reply)
    }

    async fn new_session_title(&self, prompt: &str, model: &str) -> String {
        let fallback = || derive_title(prompt, self.options.title_max_chars);
        match self.options.title_strategy {
            TitleStrategy::Truncate => fallback(),
            TitleStrategy::Model => match self.generator.suggest_title(prompt, model).await {
                Ok(Some(title)) => title,
                Ok(None) => fallback(),
                Err(e) => {
                    warn!(error = %e, "model title unavailable, using prompt");
                    fallback()
                }
            },
        }
    }

    /// Stops the in-flight generation; returns `false` if nothing was running.
    pub fn abort_generation(&self) -> bool {
        self.generator.abort()
    }
}
