//! Thin turn presenter: reads questions, streams the answer as it grows, and
//! reports the committed turn or the terminal error.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use murmur_core::{Config, Reconciler, SubmitRequest, TurnEvent};
use murmur_gateway::{HistoryEntry, HttpGateway, PersistenceGateway};
use murmur_providers::GeminiProvider;

#[derive(Parser, Debug)]
#[command(name = "murmur", about = "Streaming chat client with durable turn commits")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resume an existing chat instead of creating one
    #[arg(long)]
    chat: Option<String>,

    /// List your chats and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    let api_key = config
        .provider
        .resolve_api_key()
        .context("no model API key configured (set provider.api_key or GEMINI_API_KEY)")?;
    let provider = Arc::new(GeminiProvider::new(
        config.provider.base_url.clone(),
        api_key,
        config.provider.model.clone(),
    )?);

    let auth_token = config
        .gateway
        .resolve_auth_token()
        .context("no gateway auth token configured (set gateway.auth_token or MURMUR_TOKEN)")?;
    let gateway: Arc<dyn PersistenceGateway> =
        Arc::new(HttpGateway::new(config.gateway.base_url.clone(), auth_token));

    if cli.list {
        for summary in gateway.list_chats().await? {
            println!("{}  {}", summary.id, summary.title);
        }
        return Ok(());
    }

    let reconciler = Reconciler::new(provider, Arc::clone(&gateway), config.reconciler.clone());

    let mut chat_id = cli.chat;
    let mut history = match &chat_id {
        Some(id) => gateway.get_chat(id).await?.history,
        None => Vec::new(),
    };

    let mut rl = rustyline::DefaultEditor::new()?;
    loop {
        let line = match rl.readline("> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let input = line.trim().to_string();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(&input);

        // The first question creates the chat; the gateway persists it there,
        // so the reconciler will replay it without re-sending the question.
        let id = match &chat_id {
            Some(id) => id.clone(),
            None => {
                let id = gateway.create_chat(&input).await?;
                debug!(%id, "created chat");
                history.push(HistoryEntry::user(input.clone()));
                chat_id = Some(id.clone());
                id
            }
        };

        let (_handle, mut events) = reconciler.submit(SubmitRequest {
            chat_id: id,
            history: history.clone(),
            input: input.clone(),
            image_ref: None,
        });

        // One active session per chat: block on the event stream until the
        // terminal event before prompting again.
        let mut printed = 0usize;
        while let Some(event) = events.next().await {
            match event {
                TurnEvent::Update { text } => {
                    match text.get(printed..) {
                        Some(delta) => print!("{delta}"),
                        // Retry restarted the accumulation; reprint.
                        None => print!("\n{text}"),
                    }
                    printed = text.len();
                    std::io::stdout().flush().ok();
                }
                TurnEvent::Committed(turn) => {
                    println!();
                    if let Some(question) = turn.question {
                        history.push(HistoryEntry::user(question));
                    }
                    history.push(HistoryEntry::model(turn.answer));
                    break;
                }
                TurnEvent::Failed(kind) => {
                    eprintln!("\nerror: {kind}");
                    break;
                }
            }
        }
    }

    Ok(())
}
