use crate::cli::ContentCommand;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::storage::{Chapter, DocumentStore, ProjectContent};
use colored::Colorize;
use prettytable::{format, Table};

/// Handle content commands
pub fn handle_content(config: &Config, command: ContentCommand) -> Result<()> {
    let store = DocumentStore::from_config(&config.storage)?;

    match command {
        ContentCommand::Init {
            project,
            chapters,
            editor,
        } => {
            let chapters = chapters
                .into_iter()
                .enumerate()
                .map(|(order, name)| Chapter::new(order as u32, name, ""))
                .collect();
            let doc = store.create(&project, chapters, &editor)?;

            println!(
                "{}",
                format!("Created {} with {} chapters", project, doc.chapters.len()).green()
            );
            print_outline(&doc);
        }
        ContentCommand::Show { project, chapter } => {
            let doc = store.require(&project)?;

            match chapter {
                Some(order) => {
                    let found = doc.chapter(order).ok_or(RelayError::ChapterNotFound {
                        project_id: project.clone(),
                        chapter_order: order,
                    })?;
                    print_chapter(found);
                }
                None => {
                    println!(
                        "{} {} (version {}, {} words, last edited by {})",
                        "Project".bold(),
                        project.cyan(),
                        doc.version,
                        doc.word_count(),
                        doc.last_edited_by
                    );
                    print_outline(&doc);
                    for chapter in &doc.chapters {
                        print_chapter(chapter);
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_outline(doc: &ProjectContent) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

    table.add_row(prettytable::row![
        "Order".bold(),
        "Chapter".bold(),
        "Words".bold()
    ]);

    for chapter in &doc.chapters {
        table.add_row(prettytable::row![
            chapter.order,
            chapter.chapter_name,
            chapter.content.split_whitespace().count()
        ]);
    }

    table.printstd();
}

fn print_chapter(chapter: &Chapter) {
    println!();
    println!(
        "{}",
        format!("#{} {}", chapter.order, chapter.chapter_name).bold()
    );
    if chapter.content.is_empty() {
        println!("{}", "(empty)".dimmed());
    } else {
        println!("{}", chapter.content);
    }
}
