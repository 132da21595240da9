//! Backend control layer for a local Ollama chat front-end.
//!
//! [`ChatCommands`] is the surface a UI calls into. It persists chat sessions
//! and their history in SQLite, tracks the current session in memory, and
//! runs at most one cancellable generation at a time against the local
//! inference server.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod logging;
pub mod ollama_api;
pub mod session;
pub mod testing;

pub use commands::{ChatCommands, ChatOptions, TitleStrategy};
pub use config::AppConfig;
pub use db::{HistoryEntry, Session};
pub use error::{ChatError, ChatResult};
pub use generation::GenerationPhase;
pub use ollama_api::{InferenceClient, OllamaClient};
