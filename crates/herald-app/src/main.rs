//! Herald application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize persistence (SQLite, or memory with `--in-memory`)
//! 3. Wire the assistant: event channel, capabilities, router, coordinator,
//!    prioritization, learning and notifications
//! 4. Start the learning retry loop and the notification tick loop
//! 5. Read commands from stdin until `:quit` or end of input

mod capabilities;
mod cli;
mod llm;
mod pipeline;
mod protocol;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use herald_bus::handler_fn;
use herald_core::config::HeraldConfig;
use herald_core::events::{topics, DomainEvent};
use herald_core::Event;
use herald_router::TextGenerator;
use herald_storage::{MemoryStore, Persistence, SqliteStore};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cli::CliArgs;
use crate::llm::HttpGenerator;
use crate::pipeline::Assistant;
use crate::protocol::{parse_line, Line, USAGE};

const CONTEXT_ID: &str = "cli";

/// Print notifications and capability responses as they arrive.
fn attach_printers(assistant: &Assistant) -> Result<(), herald_bus::BusError> {
    let bus = assistant.bus();
    bus.subscribe(
        topics::NOTIFICATION_NEW,
        handler_fn("stdout-notifications", |event: Event| async move {
            if let DomainEvent::NotificationReady { notification } = DomainEvent::from_event(&event)? {
                println!("[{}] {}", notification.band, notification.title);
                for line in notification.body.lines() {
                    println!("    {}", line);
                }
            }
            Ok(())
        }),
    )?;
    bus.subscribe(
        "*.response",
        handler_fn("stdout-responses", |event: Event| async move {
            if let DomainEvent::CapabilityResponded {
                capability,
                action,
                success,
                data,
                error,
                ..
            } = DomainEvent::from_event(&event)?
            {
                if success {
                    match data.get("count").and_then(|c| c.as_u64()) {
                        Some(n) => println!("{} {}: {} result(s)", capability, action, n),
                        None => println!("{} {}: done", capability, action),
                    }
                } else {
                    println!(
                        "{} {} failed: {}",
                        capability,
                        action,
                        error.unwrap_or_else(|| "unknown error".into())
                    );
                }
            }
            Ok(())
        }),
    )?;
    Ok(())
}

fn open_store(args: &CliArgs, config: &HeraldConfig) -> Result<Arc<dyn Persistence>, Box<dyn std::error::Error>> {
    if args.in_memory {
        tracing::info!("Using in-memory persistence");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let data_dir = config.general.resolved_data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("herald.db");
    let store = SqliteStore::open(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite store opened");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = HeraldConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing goes to stderr; stdout carries the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Herald v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");
    config.validate()?;

    // Storage.
    let store = open_store(&args, &config)?;

    // Optional text generation.
    let generator: Option<Arc<dyn TextGenerator>> = args.resolve_llm_url().map(|url| {
        tracing::info!(url = %url, model = %args.llm_model, "Text generation enabled");
        Arc::new(HttpGenerator::new(
            url,
            args.llm_model.clone(),
            Duration::from_secs(config.router.llm_timeout_secs),
        )) as Arc<dyn TextGenerator>
    });

    let assistant = Assistant::build(&config, store, generator).await?;
    attach_printers(&assistant)?;
    assistant.start_background();

    println!("Herald ready. {}", USAGE);

    // === Line loop ===

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match parse_line(&line) {
            Ok(Line::Blank) => {}
            Ok(Line::Quit) => break,
            Ok(Line::Command(text)) => match assistant.handle_command(&text, CONTEXT_ID).await {
                Ok(reply) => println!("{}", reply),
                Err(e) => println!("error: {}", e),
            },
            Ok(Line::Message { sender, text }) => match assistant.ingest(&sender, &text).await {
                Ok(t) => println!(
                    "message from {} scored {:.1} ({}, {:?})",
                    t.sender, t.score, t.band, t.disposition
                ),
                Err(e) => println!("error: {}", e),
            },
            Ok(Line::React { sender, reaction }) => match assistant.react(&sender, reaction).await {
                Ok(p) => println!(
                    "{} now weighs {:.1} after {} interaction(s)",
                    p.sender,
                    p.weight,
                    p.interactions()
                ),
                Err(e) => println!("error: {}", e),
            },
            Ok(Line::Stats) => {
                let stats = assistant.stats().await;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            Err(e) => println!("{} ({})", e, USAGE),
        }
    }

    tracing::info!("Shutting down");
    assistant.shutdown().await;
    Ok(())
}
