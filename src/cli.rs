//! Command-line interface definition for storyrelay
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for serving the relay, running a generation from the
//! terminal, and inspecting stored content and session history.

use clap::{Parser, Subcommand};

/// storyrelay - stream generated story text into chapter documents
#[derive(Parser, Debug, Clone)]
#[command(name = "storyrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP API and event stream server
    Serve {
        /// Listen address, overrides the configured one
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Stream one generation into a chapter and print it live
    Generate {
        /// Workspace id
        #[arg(short, long)]
        workspace: String,

        /// Project id
        #[arg(short, long)]
        project: String,

        /// Chapter order to append to
        #[arg(long, default_value_t = 0)]
        chapter: u32,

        /// User recorded as the editor
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Prompt text
        prompt: String,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,

        /// Instruction override
        #[arg(long)]
        instruction: Option<String>,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f64>,

        /// Upper bound on generated tokens
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Story genre
        #[arg(long)]
        genre: Option<String>,

        /// Story tone
        #[arg(long)]
        tone: Option<String>,

        /// Narrative point of view
        #[arg(long)]
        pov: Option<String>,
    },

    /// Manage stored chapter documents
    Content {
        #[command(subcommand)]
        command: ContentCommand,
    },

    /// Inspect finished sessions
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

/// Document subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ContentCommand {
    /// Create a project's document
    Init {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Chapter names, in order (repeatable)
        #[arg(long = "chapter", required = true)]
        chapters: Vec<String>,

        /// Editor recorded on the document
        #[arg(short, long, default_value = "cli")]
        editor: String,
    },

    /// Print a project's document
    Show {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Only this chapter
        #[arg(long)]
        chapter: Option<u32>,
    },
}

/// Session history subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List finished sessions, newest first
    List {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Only sessions of this project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Show one session in detail
    Show {
        /// Session id
        id: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            command: Commands::History {
                command: HistoryCommand::List {
                    limit: 20,
                    project: None,
                },
            },
        }
    }
}
