//! CondoPortal ingestion CLI
//!
//! Runs the upload pipeline on local files:
//! 1. Reads each file and detects its type
//! 2. Extracts text or falls back to Gemini OCR
//! 3. Chunks the Markdown
//! 4. Submits it to the Dify knowledge base (skipped with `--dry-run`)

use anyhow::{bail, Context};
use clap::Parser;
use condoportal_common::{config::AppConfig, dify::KnowledgeBaseClient, upstream::http_client, VERSION};
use condoportal_ingestion::{is_supported, GeminiOcr, IngestionPipeline, PipelineSettings, SourceFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingest", version = VERSION, about = "Ingest building documents into the knowledge base")]
struct Cli {
    /// PDF, Markdown or plain-text files
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Document title (defaults to the file name without extension)
    #[arg(long)]
    title: Option<String>,

    /// Print the Markdown and chunk statistics without contacting Dify
    #[arg(long)]
    dry_run: bool,

    /// Configuration file (environment variables still apply)
    #[arg(long)]
    config: Option<String>,
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("md") | Some("markdown") => "text/markdown",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn title_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_else(|| "Untitled".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("CondoPortal ingest v{}", VERSION);

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    if !cli.dry_run {
        if let Err(problems) = config.validate() {
            for problem in &problems {
                error!(problem = %problem, "Invalid configuration");
            }
            bail!("{} configuration problem(s)", problems.len());
        }
    }

    let retry_budget = Duration::from_secs(config.dify.retry_budget_secs);
    let gemini_http = http_client(Duration::from_secs(config.gemini.timeout_secs))?;
    let dify_http = http_client(Duration::from_secs(config.dify.timeout_secs))?;

    let pipeline = IngestionPipeline::new(
        PipelineSettings::from_config(&config),
        Arc::new(GeminiOcr::new(gemini_http, &config.gemini, retry_budget)),
        Arc::new(KnowledgeBaseClient::new(dify_http, &config.dify)),
    )?;

    let mut failures = 0usize;
    for path in &cli.files {
        let content_type = content_type_for(path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if !is_supported(content_type, &file_name) {
            error!(file = %path.display(), "Unsupported file type");
            failures += 1;
            continue;
        }

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let title = cli.title.clone().unwrap_or_else(|| title_for(path));
        let source = SourceFile {
            bytes: &bytes,
            content_type,
            file_name: &file_name,
            title: &title,
        };

        if cli.dry_run {
            match pipeline.prepare(source).await {
                Ok(prepared) => {
                    println!("{}", prepared.markdown);
                    info!(
                        file = %file_name,
                        method = prepared.method.as_str(),
                        pages = prepared.page_count,
                        chunks = prepared.chunks.len(),
                        characters = prepared.characters,
                        "Dry run complete"
                    );
                }
                Err(e) => {
                    error!(file = %file_name, error = %e, "Ingestion failed");
                    failures += 1;
                }
            }
            continue;
        }

        match pipeline.ingest(source).await {
            Ok(outcome) => println!(
                "{}\t{}\t{}\t{} pages\t{} chunks",
                file_name,
                outcome.knowledge_base_id,
                outcome.method.as_str(),
                outcome.page_count,
                outcome.chunk_count
            ),
            Err(e) => {
                error!(file = %file_name, error = %e, "Ingestion failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} file(s) failed", failures, cli.files.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_and_title() {
        assert_eq!(content_type_for(Path::new("docs/Verbale.PDF")), "application/pdf");
        assert_eq!(content_type_for(Path::new("note.md")), "text/markdown");
        assert_eq!(content_type_for(Path::new("archivio.zip")), "application/octet-stream");
        assert_eq!(title_for(Path::new("docs/verbale_assemblea-2024.pdf")), "verbale assemblea 2024");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["ingest", "a.pdf", "b.md", "--title", "Regolamento", "--dry-run"]);
        assert_eq!(cli.files.len(), 2);
        assert_eq!(cli.title.as_deref(), Some("Regolamento"));
        assert!(cli.dry_run);
    }
}
