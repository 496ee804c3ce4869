//! # Medical RAG CLI (`medrag`)
//!
//! ## Usage
//!
//! ```bash
//! medrag [--config ./medrag.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medrag serve` | Start the HTTP + WebSocket server on `[server].bind` |
//! | `medrag analyze <file>` | Index one document and optionally ask questions about it |
//!
//! ## Examples
//!
//! ```bash
//! # Index a guideline and ask two questions, answers streamed to stdout
//! medrag analyze reco-pac.pdf \
//!     --ask "Quel traitement pour une PAC non grave ?" \
//!     --ask "Quelle durée de traitement ?"
//!
//! # Machine-readable progress on stderr
//! medrag analyze reco-pac.docx --progress json --ask "Posologie ?" --no-stream
//! ```
//!
//! Credentials come from `ANTHROPIC_API_KEY` (vision) and `OPENAI_API_KEY`
//! (embeddings and chat). Log verbosity follows `RUST_LOG` (default `info`).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use medical_rag::config::{self, Config};
use medical_rag::pipeline::PipelineContext;
use medical_rag::progress::{ProgressMode, ProgressReporter};
use medical_rag::server;

/// Vision-driven indexing and question answering over medical documents.
#[derive(Parser)]
#[command(name = "medrag", version)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and progress WebSocket.
    Serve,

    /// Analyze one document (PDF, DOCX, PNG or JPEG) and answer questions about it.
    Analyze {
        file: PathBuf,

        /// Question to answer once the document is indexed. Repeatable.
        #[arg(long = "ask")]
        questions: Vec<String>,

        /// Print each answer once complete instead of streaming it.
        #[arg(long)]
        no_stream: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => Ok(Config::minimal()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Analyze {
            file,
            questions,
            no_stream,
            progress,
        } => {
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            run_analyze(cfg, &file, &questions, !no_stream, reporter.as_ref()).await?;
        }
    }

    Ok(())
}

async fn run_analyze(
    cfg: Config,
    file: &Path,
    questions: &[String],
    stream: bool,
    progress: &dyn ProgressReporter,
) -> anyhow::Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let ctx = Arc::new(PipelineContext::from_config(cfg)?);
    let document_id = uuid::Uuid::new_v4().to_string();

    let report = ctx
        .analyze_document(&document_id, file, progress)
        .await
        .with_context(|| format!("Failed to analyze {}", file.display()))?;

    println!(
        "{}: {} pages, {} passages indexed in {}",
        file.display(),
        report.pages,
        report.total_chunks,
        report.collection_name
    );
    for (page, reason) in &report.degraded_pages {
        println!("  page {} could not be read: {}", page + 1, reason);
    }

    for question in questions {
        println!("\n> {}\n", question);
        let answer = if stream {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let printer = tokio::spawn(async move {
                let mut stdout = std::io::stdout();
                while let Some(token) = rx.recv().await {
                    let _ = stdout.write_all(token.as_bytes());
                    let _ = stdout.flush();
                }
            });
            let outcome = ctx
                .ask_streaming(&document_id, question, &tx, progress)
                .await;
            drop(tx);
            let _ = printer.await;
            println!();
            outcome?.into_value()
        } else {
            let answer = ctx.ask(&document_id, question, progress).await?;
            println!("{}", answer.response);
            answer
        };

        if !answer.sources.is_empty() {
            println!("\nSources:");
            for (rank, source) in answer.sources.iter().enumerate() {
                println!(
                    "  {}. page {} (score {:.3})",
                    rank + 1,
                    page_label(&source.metadata),
                    source.similarity_score
                );
            }
        }
    }

    Ok(())
}

/// 1-based page number of a source passage, `?` when absent.
fn page_label(metadata: &serde_json::Value) -> String {
    metadata
        .get("page")
        .and_then(|p| p.as_u64())
        .map(|p| (p + 1).to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_pages_print_one_based() {
        assert_eq!(page_label(&json!({"page": 0, "source": "reco.pdf"})), "1");
        assert_eq!(page_label(&json!({"page": 4})), "5");
        assert_eq!(page_label(&json!({"source": "reco.pdf"})), "?");
    }
}
