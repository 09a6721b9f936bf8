use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

use driftbottle::commands::{parse_command, Conversation, IncomingContent, Reply};
use driftbottle::config::{Cli, Config};
use driftbottle::state::AppState;

/// Interactive stdin/stdout chat: one line per message.
struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Console {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn next_line(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}

#[async_trait]
impl Conversation for Console {
    async fn prompt(&mut self, timeout: Duration) -> Option<IncomingContent> {
        print_flush("... ");
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Some(IncomingContent::parse(&line)),
            Ok(_) => None,
            Err(_) => {
                println!();
                None
            }
        }
    }

    async fn send(&mut self, reply: Reply) -> anyhow::Result<()> {
        match reply {
            Reply::Text(text) => println!("{}", text),
            Reply::Image(reference) => println!("[image] {}", reference),
            Reply::Audio(reference) => println!("[audio] {}", reference),
        }
        Ok(())
    }
}

fn print_flush(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli);
    std::fs::create_dir_all(&data_dir)?;
    let config = Config::load(&cli)?;

    // Initialize logging
    let default_filter = if config.bot.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("Data directory: {}", data_dir.display());

    let state = AppState::build(config).await?;

    let mut user_id = cli.user.unwrap_or_else(|| "console".to_string());
    let mut display_name = cli.name;
    let mut console = Console::new();
    println!("Type \"help\" for commands, \"/as <user>\" to switch user, \"/quit\" to leave.");

    loop {
        print_flush(&format!("{}> ", user_id));
        let Some(line) = console.next_line().await? else {
            break;
        };
        let line = line.trim();

        if line == "/quit" {
            break;
        }
        if let Some(rest) = line.strip_prefix("/as") {
            match rest.trim() {
                "" => println!("Usage: /as <user>"),
                next => {
                    user_id = next.to_string();
                    display_name = None;
                    println!("Now acting as {}", user_id);
                }
            }
            continue;
        }

        let message = IncomingContent::parse(line);
        if message.is_empty() {
            continue;
        }

        let session = state.session(&user_id, display_name.as_deref());
        match parse_command(&message) {
            Ok(command) => {
                if let Err(e) = state.handler.handle(&session, &mut console, command).await {
                    tracing::error!("Command failed: {}", e);
                }
            }
            Err(e) => console.send(Reply::Text(e.to_string())).await?,
        }
    }

    Ok(())
}
