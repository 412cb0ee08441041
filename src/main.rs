//! storyrelay - generation streaming relay
//!
//! Main entry point for the storyrelay binary.

use anyhow::Result;

use storyrelay::cli::{Cli, Commands};
use storyrelay::commands::{self, GenerateOptions};
use storyrelay::config::Config;
use storyrelay::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    init_logging(&config.logging)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Serve { bind } => {
            if let Some(b) = &bind {
                tracing::debug!("Using bind override: {}", b);
            }
            commands::run_serve(config, bind).await
        }
        Commands::Generate {
            workspace,
            project,
            chapter,
            user,
            prompt,
            model,
            instruction,
            temperature,
            max_tokens,
            genre,
            tone,
            pov,
        } => {
            tracing::info!(project = %project, chapter, "Starting generation");
            let options = GenerateOptions {
                workspace,
                project,
                chapter,
                user,
                prompt,
                model,
                instruction,
                temperature,
                max_tokens,
                genre,
                tone,
                pov,
            };
            commands::run_generate(config, options).await
        }
        Commands::Content { command } => commands::handle_content(&config, command),
        Commands::History { command } => commands::handle_history(&config, command),
    }
}
