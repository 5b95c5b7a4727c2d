//! Subcommands and their handlers.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use margin_core::types::{AnnotationStatus, ReplyStatus};
use margin_core::{Anchor, Annotation, Engine, LineAggregate, NewAnnotation};

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Annotate a line (or a range of lines) of a file.
    Add {
        file: String,
        /// 1-indexed line.
        line: u32,
        /// Last line of the range (default: LINE).
        #[arg(long)]
        end: Option<u32>,
        message: String,
    },
    /// Reply to an annotation. Replying reopens a resolved thread.
    Reply {
        file: String,
        id: String,
        message: String,
    },
    /// Mark an annotation resolved.
    Resolve { file: String, id: String },
    /// Reopen a resolved or archived annotation.
    Reopen { file: String, id: String },
    /// Archive an annotation.
    Archive { file: String, id: String },
    /// Replace an annotation's text.
    Edit {
        file: String,
        id: String,
        message: String,
    },
    /// Delete an annotation, or one of its replies with --reply.
    #[command(alias = "rm")]
    Delete {
        file: String,
        id: String,
        #[arg(long, value_name = "REPLY_ID")]
        reply: Option<String>,
    },
    /// List a file's annotations, or every annotated file.
    #[command(alias = "ls")]
    List { file: Option<String> },
    /// Re-anchor annotations against the files' current contents.
    Sync {
        /// Files to reconcile (default: every annotated file).
        files: Vec<String>,
    },
    /// Print the per-line summary of a file.
    Gutter { file: String },
    /// Move a file's annotations after the file was renamed.
    #[command(alias = "mv")]
    Rename { from: String, to: String },
    /// Drop every annotation of a file.
    Forget { file: String },
}

pub async fn run(engine: &Engine, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Add {
            file,
            line,
            end,
            message,
        } => add(engine, config, &file, line, end, message).await,
        Command::Reply { file, id, message } => {
            let reply = engine
                .add_reply(&file, &id, &config.author(), &message)
                .await?;
            println!("{}", reply.id);
            Ok(())
        }
        Command::Resolve { file, id } => {
            let annotation = engine.resolve(&file, &id, &config.author()).await?;
            println!("{}", summary_line(&annotation));
            Ok(())
        }
        Command::Reopen { file, id } => {
            let annotation = engine.reopen(&file, &id).await?;
            println!("{}", summary_line(&annotation));
            Ok(())
        }
        Command::Archive { file, id } => {
            let annotation = engine.archive(&file, &id).await?;
            println!("{}", summary_line(&annotation));
            Ok(())
        }
        Command::Edit { file, id, message } => {
            let annotation = engine.edit_annotation(&file, &id, &message).await?;
            println!("{}", summary_line(&annotation));
            Ok(())
        }
        Command::Delete { file, id, reply } => {
            match reply {
                Some(reply_id) => {
                    engine.delete_reply(&file, &id, &reply_id).await?;
                }
                None => {
                    engine.delete_annotation(&file, &id).await?;
                }
            }
            Ok(())
        }
        Command::List { file: Some(file) } => list(engine, &file).await,
        Command::List { file: None } => {
            for path in engine.store().list_documents().await? {
                println!("{path}");
            }
            Ok(())
        }
        Command::Sync { files } => sync(engine, files).await,
        Command::Gutter { file } => gutter(engine, &file).await,
        Command::Rename { from, to } => {
            engine.rename_document(&from, &to).await?;
            Ok(())
        }
        Command::Forget { file } => {
            if !engine.forget_document(&file).await? {
                tracing::info!(document = %file, "no annotations to forget");
            }
            Ok(())
        }
    }
}

/// Reads a file's text, or `None` with a warning if it cannot be read.
async fn read_text(path: &str) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Some(text),
        Err(error) => {
            tracing::warn!(document = path, %error, "cannot read document");
            None
        }
    }
}

async fn add(
    engine: &Engine,
    config: &Config,
    file: &str,
    line: u32,
    end: Option<u32>,
    message: String,
) -> Result<()> {
    let end = end.unwrap_or(line);
    if line == 0 || end < line {
        bail!("invalid line range {line}..{end}");
    }
    let text = read_text(file).await;
    let line_at = |n: u32| {
        text.as_deref()
            .and_then(|t| t.lines().nth(n as usize - 1))
            .map(str::to_owned)
    };
    let end_char = line_at(end).map_or(0, |l| l.chars().count() as u32);

    let annotation = engine
        .add_annotation(
            file,
            NewAnnotation {
                author: config.author(),
                content: message,
                anchor: Anchor {
                    start_line: line,
                    start_char: 0,
                    end_line: end,
                    end_char,
                },
                line_text: line_at(line),
            },
        )
        .await?;
    println!("{}", annotation.id);
    Ok(())
}

fn status_label(status: AnnotationStatus) -> &'static str {
    match status {
        AnnotationStatus::Open => "open",
        AnnotationStatus::Resolved => "resolved",
        AnnotationStatus::Archived => "archived",
    }
}

fn summary_line(annotation: &Annotation) -> String {
    let stale = if annotation.stale { " !stale" } else { "" };
    format!(
        "{} L{}-{} [{}]{} {}: {}",
        annotation.id,
        annotation.anchor.start_line,
        annotation.anchor.end_line,
        status_label(annotation.status),
        stale,
        annotation.author,
        annotation.content
    )
}

async fn list(engine: &Engine, file: &str) -> Result<()> {
    let Some(doc) = engine
        .get_store(file)
        .await
        .with_context(|| format!("loading annotations for {file}"))?
    else {
        println!("{file}: no annotations");
        return Ok(());
    };
    let filter = engine.filter();
    let m = &doc.metadata;
    println!(
        "{file}: {} open, {} resolved, {} archived",
        m.open_comments, m.resolved_comments, m.archived_comments
    );
    for annotation in doc.comments.iter().filter(|a| filter.is_visible(a)) {
        println!("{}", summary_line(annotation));
        for reply in &annotation.replies {
            match reply.status {
                ReplyStatus::Active => {
                    println!("    {} {}: {}", reply.id, reply.author, reply.content)
                }
                ReplyStatus::Deleted => println!("    {} (deleted)", reply.id),
            }
        }
    }
    Ok(())
}

async fn sync(engine: &Engine, files: Vec<String>) -> Result<()> {
    let files = if files.is_empty() {
        engine.store().list_documents().await?
    } else {
        files
    };
    let mut documents = Vec::with_capacity(files.len());
    for path in files {
        let text = read_text(&path).await;
        documents.push((path, text));
    }

    let mut failed = 0usize;
    for (path, result) in engine.activate_documents(documents).await {
        match result {
            Ok(Some(report)) => {
                for moved in &report.relocated {
                    println!("{path}: {} L{} -> L{}", moved.id, moved.from_line, moved.to_line);
                }
                if report.marked_stale > 0 {
                    println!("{path}: {} stale", report.marked_stale);
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(document = %path, %error, "reconciliation failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} document(s) could not be reconciled");
    }
    Ok(())
}

fn render_gutter(aggregate: &LineAggregate) -> String {
    let mut out = String::new();
    for (line, summary) in aggregate.iter() {
        let mark = match (summary.has_stale, summary.all_resolved) {
            (true, _) => '!',
            (false, true) => '✓',
            (false, false) => '●',
        };
        out.push_str(&format!("{line:>5} {mark} {}\n", summary.count));
    }
    out
}

async fn gutter(engine: &Engine, file: &str) -> Result<()> {
    // Re-anchor first so the gutter reflects the file as it is now.
    let text = read_text(file).await;
    engine.activate_document(file, text.as_deref()).await?;
    let aggregate = engine.line_aggregate(file).await?;
    print!("{}", render_gutter(&aggregate));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(stale: bool, status: AnnotationStatus) -> Annotation {
        Annotation {
            id: "a1".to_owned(),
            author: "ana".to_owned(),
            created_at: 0,
            updated_at: 0,
            content: "fix this".to_owned(),
            anchor: Anchor {
                start_line: 4,
                start_char: 0,
                end_line: 6,
                end_char: 0,
            },
            snippet: None,
            stale,
            status,
            resolved_at: None,
            resolved_by: None,
            last_activity_at: None,
            replies: Vec::new(),
        }
    }

    #[test]
    fn summary_marks_stale_annotations() {
        assert_eq!(
            summary_line(&annotation(true, AnnotationStatus::Open)),
            "a1 L4-6 [open] !stale ana: fix this"
        );
        assert_eq!(
            summary_line(&annotation(false, AnnotationStatus::Resolved)),
            "a1 L4-6 [resolved] ana: fix this"
        );
    }

    #[test]
    fn gutter_marks_each_line() {
        let policy = margin_core::FilterPolicy::default();
        let mut resolved = annotation(false, AnnotationStatus::Resolved);
        resolved.anchor = Anchor::line(9);
        let aggregate = LineAggregate::build(
            &[annotation(true, AnnotationStatus::Open), resolved],
            &policy,
        );
        assert_eq!(render_gutter(&aggregate), "    4 ! 1\n    9 ✓ 1\n");
    }
}
