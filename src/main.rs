use anyhow::Context;
use clap::Parser;
use ollamachat::config::normalize_url;
use ollamachat::{db, logging, AppConfig, ChatCommands, ChatResult, OllamaClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ollamachat", version, about = "Chat with models served by a local Ollama")]
struct Cli {
    /// Config file (defaults to <config dir>/ollama-chat/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Ollama base URL, e.g. http://localhost:11434
    #[arg(long)]
    host: Option<String>,

    /// Continue the most recently created session
    #[arg(long)]
    resume: bool,
}

const HELP: &str = "\
/models               list models loaded in ollama
/model [name]         show or select the model
/sessions             list chat sessions
/current              show the current session
/switch <id>          make a session current
/new                  start a new chat
/rename <id> <title>  rename a session
/delete <id>          delete a session and its history
/history              show the current session's messages
/quit                 exit
anything else is sent to the model; Ctrl-C stops a running reply";

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Help,
    Quit,
    Models,
    Model(Option<&'a str>),
    Sessions,
    Current,
    Switch(i64),
    New,
    Rename(i64, &'a str),
    Delete(i64),
    History,
    Message(&'a str),
    Invalid(&'static str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line);
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(n, r)| (n, r.trim()))
        .unwrap_or((command, ""));
    let id = || rest.split_whitespace().next().and_then(|s| s.parse::<i64>().ok());

    match name {
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        "models" => Input::Models,
        "model" if rest.is_empty() => Input::Model(None),
        "model" => Input::Model(Some(rest)),
        "sessions" => Input::Sessions,
        "current" => Input::Current,
        "new" => Input::New,
        "history" => Input::History,
        "switch" => id().map_or(Input::Invalid("usage: /switch <id>"), Input::Switch),
        "delete" => id().map_or(Input::Invalid("usage: /delete <id>"), Input::Delete),
        "rename" => match rest.split_once(char::is_whitespace) {
            Some((id, title)) => match id.parse() {
                Ok(id) => Input::Rename(id, title.trim()),
                Err(_) => Input::Invalid("usage: /rename <id> <title>"),
            },
            None => Input::Invalid("usage: /rename <id> <title>"),
        },
        _ => Input::Invalid("unknown command, try /help"),
    }
}

/// Runs one line of input; returns `false` when the user asked to quit.
async fn handle(commands: &ChatCommands, input: Input<'_>) -> ChatResult<bool> {
    match input {
        Input::Empty => {}
        Input::Help => println!("{}", HELP),
        Input::Quit => return Ok(false),
        Input::Invalid(message) => println!("{}", message),
        Input::Models => {
            for model in commands.list_models().await? {
                println!("{}", model);
            }
        }
        Input::Model(None) => match commands.get_selected_model().await? {
            Some(model) => println!("{}", model),
            None => println!("no model selected"),
        },
        Input::Model(Some(name)) => {
            commands.set_selected_model(name).await?;
            println!("using {}", name);
        }
        Input::Sessions => {
            let current = commands.current_session_id();
            for session in commands.list_sessions().await? {
                let marker = if Some(session.id) == current { '*' } else { ' ' };
                println!(
                    "{} {:>4}  {}  {}",
                    marker,
                    session.id,
                    session.created_at.format("%Y-%m-%d %H:%M"),
                    session.title
                );
            }
        }
        Input::Current => {
            let session = commands.get_current_session().await?;
            println!("{}  {}", session.id, session.title);
        }
        Input::Switch(id) => {
            let session = commands.switch_session(id).await?;
            println!("switched to {}  {}", session.id, session.title);
        }
        Input::New => {
            commands.start_new_session();
            println!("new chat");
        }
        Input::Rename(id, title) => commands.rename_session(id, title).await?,
        Input::Delete(id) => commands.delete_session(id).await?,
        Input::History => {
            for entry in commands.load_history_for_current_session().await? {
                println!("> {}\n{}\n", entry.user_message, entry.model_response);
            }
        }
        Input::Message(prompt) => {
            let reply = commands.send_message(prompt).await?;
            println!("{}\n", reply);
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    if let Some(host) = cli.host {
        config.ollama_url = normalize_url(&host);
    }
    if cli.resume {
        config.resume_last_session = true;
    }

    logging::init_tracing(&config.log_level);
    info!(ollama = %config.ollama_url, "starting ollamachat");

    let conn = db::init_db(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let client = Arc::new(OllamaClient::new(config.ollama_url.clone()));
    let commands = Arc::new(ChatCommands::new(conn, client, config.chat_options()));

    if config.resume_last_session {
        if let Some(session) = commands.resume_latest_session().await? {
            println!("resuming {}  {}", session.id, session.title);
        }
    }

    // Ctrl-C stops a running reply, or exits when there is none
    tokio::spawn({
        let commands = commands.clone();
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !commands.abort_generation() {
                    std::process::exit(130);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match handle(&commands, parse_input(&line)).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {}", e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(parse_input("  hello there "), Input::Message("hello there"));
        assert_eq!(parse_input("   "), Input::Empty);
    }

    #[test]
    fn slash_commands_parse_their_arguments() {
        assert_eq!(parse_input("/switch 12"), Input::Switch(12));
        assert_eq!(parse_input("/delete 3"), Input::Delete(3));
        assert_eq!(parse_input("/model llama3.2:1b"), Input::Model(Some("llama3.2:1b")));
        assert_eq!(parse_input("/model"), Input::Model(None));
        assert_eq!(
            parse_input("/rename 4  Rust lifetimes"),
            Input::Rename(4, "Rust lifetimes")
        );
    }

    #[test]
    fn malformed_commands_explain_usage() {
        assert_eq!(parse_input("/switch abc"), Input::Invalid("usage: /switch <id>"));
        assert_eq!(parse_input("/rename 4"), Input::Invalid("usage: /rename <id> <title>"));
        assert_eq!(parse_input("/frobnicate"), Input::Invalid("unknown command, try /help"));
    }
}
