use crate::audit::{AuditLog, SessionRecord};
use crate::cli::HistoryCommand;
use crate::config::Config;
use crate::error::Result;
use crate::session::SessionState;
use colored::{ColoredString, Colorize};
use prettytable::{format, Table};

/// Handle history commands
pub fn handle_history(config: &Config, command: HistoryCommand) -> Result<()> {
    let audit = AuditLog::from_config(&config.storage)?;

    match command {
        HistoryCommand::List { limit, project } => {
            let records = match project {
                Some(project) => audit
                    .find_by_project(&project)?
                    .into_iter()
                    .take(limit)
                    .collect(),
                None => audit.list(limit, 0)?,
            };

            if records.is_empty() {
                println!("{}", "No sessions recorded.".yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

            table.add_row(prettytable::row![
                "ID".bold(),
                "Project".bold(),
                "Chapter".bold(),
                "State".bold(),
                "Chunks".bold(),
                "Model".bold(),
                "Started".bold()
            ]);

            for record in records {
                let id_short = record.id.get(..10).unwrap_or(&record.id).to_string();
                let started = chrono::DateTime::parse_from_rfc3339(&record.started_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or(record.started_at.clone());

                table.add_row(prettytable::row![
                    id_short.cyan(),
                    record.project_id,
                    record.chapter_order,
                    colored_state(record.state),
                    record.chunk_count,
                    record.model,
                    started
                ]);
            }

            println!("\nSession History:");
            table.printstd();
            println!();
            println!(
                "Use {} for details.",
                "storyrelay history show <ID>".cyan()
            );
            println!();
        }
        HistoryCommand::Show { id } => match audit.get(&id)? {
            Some(record) => print_record(&record),
            None => println!("{}", format!("No session {}", id).yellow()),
        },
    }

    Ok(())
}

fn colored_state(state: SessionState) -> ColoredString {
    match state {
        SessionState::Completed => state.label().green(),
        SessionState::Failed => state.label().red(),
        SessionState::Cancelled => state.label().yellow(),
        _ => state.label().normal(),
    }
}

fn print_record(record: &SessionRecord) {
    println!("{} {}", "Session".bold(), record.id.cyan());
    println!("  State:     {}", colored_state(record.state));
    println!(
        "  Chapter:   {}/{} #{}",
        record.workspace_id, record.project_id, record.chapter_order
    );
    println!("  User:      {}", record.user_id);
    println!("  Model:     {} ({})", record.model, record.provider);
    println!(
        "  Chunks:    {} ({} bytes)",
        record.chunk_count, record.text_length
    );
    println!("  Started:   {}", record.started_at);
    if let Some(ended) = &record.ended_at {
        println!("  Ended:     {}", ended);
    }
    if let Some(error) = &record.error {
        println!("  Error:     {}", error.red());
    }
    match (record.merged_version, &record.merge_error) {
        (Some(version), _) => println!("  Merged:    version {}", version),
        (None, Some(merge_error)) => println!("  Merged:    {}", merge_error.yellow()),
        (None, None) => {}
    }
}
