use ollamachat::db::open_in_memory;
use ollamachat::testing::ScriptedClient;
use ollamachat::{ChatCommands, ChatOptions};
use std::sync::Arc;

pub const MODEL: &str = "llama3.2:1b";

pub fn setup_with(options: ChatOptions) -> (Arc<ScriptedClient>, Arc<ChatCommands>) {
    let client = Arc::new(ScriptedClient::with_models([MODEL, "qwen2.5:7b"]));
    let conn = open_in_memory().expect("in-memory database");
    let commands = Arc::new(ChatCommands::new(conn, client.clone(), options));
    (client, commands)
}

pub fn setup() -> (Arc<ScriptedClient>, Arc<ChatCommands>) {
    setup_with(ChatOptions::default())
}

/// Like `setup`, with `MODEL` already selected.
pub async fn setup_selected() -> (Arc<ScriptedClient>, Arc<ChatCommands>) {
    let (client, commands) = setup();
    commands.set_selected_model(MODEL).await.expect("select model");
    (client, commands)
}
