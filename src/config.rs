//! Command line and environment configuration.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8000";

#[derive(Debug, Parser)]
#[command(name = "kbchat", version, about = "Chat with your knowledge bases")]
pub struct Cli {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, env = "KBCHAT_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true, env = "KBCHAT_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct ClientArgs {
    /// Base URL of the backend.
    #[arg(long = "url", global = true, env = "KBCHAT_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Do not ask the backend for source excerpts.
    #[arg(long, global = true)]
    pub no_sources: bool,

    #[arg(long, global = true, env = "KBCHAT_HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: u32,

    #[arg(
        long,
        global = true,
        env = "KBCHAT_CONNECT_TIMEOUT_SECS",
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS
    )]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive chat in the terminal.
    Chat {
        #[arg(long = "kb")]
        kb_id: String,
    },
    /// Ask a single question and print the answer.
    Ask {
        #[arg(long = "kb")]
        kb_id: String,
        /// Use the request/response endpoint instead of streaming.
        #[arg(long)]
        no_stream: bool,
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Print the persisted chat history.
    History {
        #[arg(long = "kb")]
        kb_id: String,
    },
    /// Delete the persisted chat history.
    Clear {
        #[arg(long = "kb")]
        kb_id: String,
    },
    /// List knowledge bases.
    Kbs,
    /// Run a mock backend that speaks the chat protocol.
    Serve {
        #[arg(long, env = "KBCHAT_LISTEN", default_value = DEFAULT_LISTEN)]
        listen: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub include_sources: bool,
    pub history_limit: u32,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            include_sources: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            base_url: normalize_base_url(&args.base_url),
            include_sources: !args.no_sources,
            history_limit: args.history_limit,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        }
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["kbchat", "kbs"]).unwrap();
        let config = ClientConfig::from(&cli.client);
        assert!(config.include_sources);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(
            config.connect_timeout,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
        assert!(matches!(cli.command, Command::Kbs));
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "kbchat",
            "ask",
            "--kb",
            "kb1",
            "--url",
            "http://example.test:9000/",
            "--no-sources",
            "What",
            "is",
            "X?",
        ])
        .unwrap();
        let config = ClientConfig::from(&cli.client);
        assert_eq!(config.base_url, "http://example.test:9000");
        assert!(!config.include_sources);
        match cli.command {
            Command::Ask {
                kb_id,
                no_stream,
                question,
            } => {
                assert_eq!(kb_id, "kb1");
                assert!(!no_stream);
                assert_eq!(question.join(" "), "What is X?");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn chat_requires_knowledge_base() {
        assert!(Cli::try_parse_from(["kbchat", "chat"]).is_err());
    }

    #[test]
    fn client_config_new_trims_trailing_slash() {
        assert_eq!(ClientConfig::new("http://localhost:8000//").base_url, "http://localhost:8000");
    }
}
