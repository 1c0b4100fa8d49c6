mod api;
mod config;
mod error;
mod frame;
mod protocol;
mod server;
mod session;
mod transport;
mod ui;

use api::ApiClient;
use clap::Parser;
use config::{Cli, ClientConfig, Command};
use error::{ClientError, ClientResult};
use protocol::{Frame, SourceRef};
use server::ServerConfig;
use session::ChatSession;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use transport::TransportEvent;

type MainResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const MOCK_WORD_DELAY: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    // Held until exit so buffered log lines reach the file.
    let _log_guard = init_tracing(&cli)?;
    info!(version = env!("CARGO_PKG_VERSION"), "kbchat starting");

    let api = ApiClient::new(ClientConfig::from(&cli.client))?;
    debug!(base_url = api.base_url(), "backend configured");
    match cli.command {
        Command::Serve { listen } => {
            server::run(ServerConfig {
                listen,
                word_delay: MOCK_WORD_DELAY,
            })
            .await
        }
        Command::Chat { kb_id } => {
            let kb = api.knowledge_base(&kb_id).await?;
            info!(kb_id = %kb.id, name = %kb.name, "opening chat");
            ui::run(ChatSession::new(api, kb.id))
        }
        Command::Ask {
            kb_id,
            no_stream,
            question,
        } => Ok(ask(&api, &kb_id, &question.join(" "), no_stream).await?),
        Command::History { kb_id } => {
            for message in api.history(&kb_id).await? {
                println!("{:?}: {}", message.role, message.content);
            }
            Ok(())
        }
        Command::Clear { kb_id } => {
            println!("{}", api.clear_history(&kb_id).await?);
            Ok(())
        }
        Command::Kbs => {
            for kb in api.knowledge_bases().await? {
                println!(
                    "{}\t{}\t{}",
                    kb.id,
                    kb.name,
                    kb.description.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) -> MainResult<Option<WorkerGuard>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match cli.log_level.parse::<EnvFilter>() {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!(
                    "WARN: log level '{}' is not a valid tracing filter ({}); falling back to 'warn'",
                    cli.log_level, e
                );
                EnvFilter::new("warn")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match &cli.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path.file_name().ok_or("log file path has no file name")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
            subscriber.with_writer(writer).with_ansi(false).init();
            Ok(Some(guard))
        }
        None => {
            subscriber.with_writer(io::stderr).init();
            Ok(None)
        }
    }
}

/// One-shot question; the streamed answer is printed as it arrives.
async fn ask(api: &ApiClient, kb_id: &str, question: &str, no_stream: bool) -> ClientResult<()> {
    let question = question.trim();
    if question.is_empty() {
        return Err(ClientError::EmptyMessage);
    }

    if no_stream {
        let response = api.chat(kb_id, &api.chat_request(question)).await?;
        println!("{}", response.message);
        print_sources(response.sources.as_deref());
        return Ok(());
    }

    let (_stream, mut events) = api
        .transport()
        .open(&api.chat_stream_url(kb_id), &api.chat_request(question));

    let mut sources = None;
    let mut stdout = io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(Frame::Chunk(text)) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            TransportEvent::Frame(Frame::Sources(found)) => sources = Some(found),
            TransportEvent::Frame(Frame::Done) | TransportEvent::Closed => break,
            TransportEvent::Failed(err) => {
                writeln!(stdout)?;
                return Err(err);
            }
        }
    }
    writeln!(stdout)?;
    print_sources(sources.as_deref());
    Ok(())
}

fn print_sources(sources: Option<&[SourceRef]>) {
    let Some(sources) = sources.filter(|s| !s.is_empty()) else {
        return;
    };
    println!("\nSources:");
    for source in sources {
        match source.relevance_score {
            Some(score) => println!("- {} ({score:.2}): {}", source.document_id, source.content),
            None => println!("- {}: {}", source.document_id, source.content),
        }
    }
}
