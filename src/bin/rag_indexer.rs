use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use doc_rag::config::Settings;
use doc_rag::indexer::extractor::FileParser;
use doc_rag::indexer::walker::walk_directory;
use doc_rag::logger;
use doc_rag::rag::embeddings::build_embedder;
use doc_rag::rag::index_manager::IndexManager;
use doc_rag::rag::vector_store::{DuplicatePolicy, VectorIndex};

#[derive(Parser, Debug)]
#[command(name = "rag-indexer")]
#[command(about = "Index a directory of documents into a persisted vector index")]
struct Args {
    /// Directory to recursively index
    #[arg(short, long)]
    dir: PathBuf,

    /// Settings file; RAG__* variables override it
    #[arg(short, long, env = "RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Index directory (overrides index.dir)
    #[arg(long)]
    index_dir: Option<PathBuf>,

    /// Maximum chunk size (overrides chunking.max_size)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks (overrides chunking.overlap)
    #[arg(long)]
    chunk_overlap: Option<usize>,

    /// Replace files that are already indexed instead of reporting them as failed
    #[arg(long)]
    replace: bool,
}

/// Name a file is indexed under: its path relative to the scanned directory.
fn index_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logger::init();

    let args = Args::parse();

    if !args.dir.is_dir() {
        anyhow::bail!("Directory does not exist: {}", args.dir.display());
    }

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(dir) = args.index_dir {
        settings.index.dir = dir;
    }
    if let Some(size) = args.chunk_size {
        settings.chunking.max_size = size;
    }
    if let Some(overlap) = args.chunk_overlap {
        settings.chunking.overlap = overlap;
    }
    if args.replace {
        settings.index.duplicate_policy = DuplicatePolicy::Replace;
    }
    // persisted once at the end
    settings.index.persist_on_write = false;
    settings.validate()?;

    println!("Initializing embedding model {}...", settings.embedding.model_id);
    let embedding_settings = settings.embedding.clone();
    let embedder = tokio::task::spawn_blocking(move || build_embedder(&embedding_settings)).await??;

    println!("Opening index at {}...", settings.index.dir.display());
    let index = Arc::new(
        VectorIndex::load_or_create(&settings.index.dir, embedder.model_id(), embedder.dimension())
            .await?,
    );
    let manager = IndexManager::new(index, embedder, Arc::new(FileParser), &settings)?;

    println!("Scanning directory: {}", args.dir.display());
    let files = walk_directory(&args.dir);
    println!("Found {} supported files", files.len());

    if files.is_empty() {
        println!("No supported files found. Exiting.");
        return Ok(());
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut success_count = 0usize;
    let mut total_chunks = 0usize;
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();

    for (path, _) in &files {
        let name = index_name(&args.dir, path);
        pb.set_message(name.clone());

        let result = match tokio::fs::read(path).await {
            Ok(bytes) => manager.ingest(&name, bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("Failed to read file: {}", e)),
        };

        match result {
            Ok(ingested) => {
                success_count += 1;
                total_chunks += ingested.chunks;
            }
            Err(e) => {
                tracing::warn!("Failed to process {}: {}", path.display(), e);
                failed_files.push((path.clone(), e));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    manager.persist().await?;
    let status = manager.status().await;

    println!("\nIndexing complete!");
    println!("  Files processed: {}/{}", success_count, files.len());
    println!("  Files failed:    {}", failed_files.len());
    println!("  New chunks:      {}", total_chunks);
    println!("  Index total:     {} files, {} chunks", status.total_files, status.total_chunks);
    println!("  Index dir:       {}", manager.index_dir().display());

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}
