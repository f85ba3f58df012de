//! CLI argument definitions for the Parley binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use parley_core::config::expand_home;

/// Parley: a conversational assistant with attachment understanding and
/// real-time lookups.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the conversation database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Use built-in mock providers instead of remote services.
    #[arg(long = "offline", global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one conversation turn and print the reply.
    Chat(ChatArgs),
    /// Print the stored messages of a conversation.
    History(SessionArg),
    /// Delete the stored messages of a conversation. Its context is kept.
    Clear(SessionArg),
    /// Inspect or change a conversation's user context.
    #[command(subcommand)]
    Context(ContextCommand),
    /// Manage the conversation list.
    #[command(subcommand)]
    Sessions(SessionsCommand),
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Conversation id.
    #[arg(short = 's', long = "session")]
    pub session: String,

    /// Message text.
    #[arg(short = 'm', long = "message")]
    pub message: Option<String>,

    /// Image to attach.
    #[arg(long = "image")]
    pub image: Option<PathBuf>,

    /// File to attach.
    #[arg(long = "file")]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SessionArg {
    /// Conversation id.
    #[arg(short = 's', long = "session")]
    pub session: String,
}

#[derive(Subcommand, Debug)]
pub enum ContextCommand {
    /// Merge `key=value` pairs into the context. Values are parsed as
    /// JSON when possible, otherwise stored as strings.
    Set {
        #[arg(short = 's', long = "session")]
        session: String,
        #[arg(required = true, value_parser = parse_key_value)]
        pairs: Vec<(String, String)>,
    },
    /// Print the context.
    Show(SessionArg),
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List conversations, newest first.
    List,
    /// Register a new conversation.
    New {
        #[arg(long = "id")]
        id: Option<String>,
        #[arg(long = "name")]
        name: Option<String>,
    },
    /// Rename a conversation.
    Rename { id: String, name: String },
    /// Remove a conversation from the list.
    Remove { id: String },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > PARLEY_CONFIG env var > ~/.parley/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("PARLEY_CONFIG") {
            return PathBuf::from(p);
        }
        expand_home("~/.parley/config.toml")
    }

    /// Resolve the data directory override, if any.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log filter.
    ///
    /// Priority: RUST_LOG env var > --log-level flag > config file value.
    pub fn resolve_log_filter(&self, config_level: &str) -> String {
        if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.trim().is_empty() {
                return filter;
            }
        }
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}
