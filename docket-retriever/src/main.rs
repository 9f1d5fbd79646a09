use clap::{Parser, Subcommand};
use docket_retriever::config::CONFIG_FILE_NAME;
use docket_retriever::{DocketConfig, DocketService};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

/// Upload documents, index them in the background and query them.
#[derive(Parser, Debug)]
#[command(name = "docket", author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ./docket.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the registry, vectors and uploaded files
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Number of ingestion workers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Output format
    #[arg(short, long, global = true, default_value = "summary")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the data directory and stores, and a default config file
    Init,
    /// Upload one or more documents
    Upload {
        paths: Vec<PathBuf>,
        #[arg(long)]
        owner: String,
        /// Index the uploads before returning instead of leaving them for `docket work`
        #[arg(long)]
        process: bool,
    },
    /// Index every pending document, then exit
    Work,
    /// Show the status of a document
    Status { document_id: String },
    /// Retrieve passages for a question
    Query {
        text: String,
        #[arg(long)]
        owner: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Only search these documents
        #[arg(long = "document")]
        documents: Vec<String>,
        /// Print the numbered context block instead of passages
        #[arg(long)]
        context: bool,
    },
    /// Index a document again
    Reindex {
        document_id: String,
        /// Defaults to the document's owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete a document and its index entries
    Delete {
        document_id: String,
        #[arg(long)]
        owner: String,
    },
    /// Delete every document of an owner
    Purge {
        #[arg(long)]
        owner: String,
    },
    /// List an owner's documents
    List {
        #[arg(long)]
        owner: String,
    },
    /// Totals for an owner's documents
    Summary {
        #[arg(long)]
        owner: String,
    },
    /// Check that the stores are reachable
    Health,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<DocketConfig> {
    let mut config = DocketConfig::load_or_default(args.config.as_deref())?;
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(workers) = args.workers {
        config.jobs.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let format = args.format;

    match args.command {
        Commands::Init => {
            let data_dir = config.storage.data_dir.clone();
            let service = DocketService::open(config.clone()).await?;
            let config_path = args
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            if !config_path.exists() {
                std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;
                println!("Wrote default config to {}", config_path.display());
            }
            println!("Initialized docket data in {}", data_dir.display());
            service.shutdown().await;
            Ok(())
        }
        Commands::Upload {
            paths,
            owner,
            process,
        } => {
            if paths.is_empty() {
                anyhow::bail!("No files given");
            }
            let service = DocketService::open(config).await?;
            let mut receipts = Vec::with_capacity(paths.len());
            for path in &paths {
                let bytes = tokio::fs::read(path).await?;
                let receipt = service.upload(&owner, &file_name(path), &bytes).await?;
                if format == OutputFormat::Summary {
                    let note = if receipt.duplicate { " (already uploaded)" } else { "" };
                    println!(
                        "{} → {} [{}]{}",
                        path.display(),
                        receipt.document_id,
                        receipt.status,
                        note
                    );
                }
                receipts.push(receipt);
            }
            if process {
                let stats = service.run_workers_until_idle().await;
                if format == OutputFormat::Summary {
                    println!(
                        "Indexed {} document(s), {} failed",
                        stats.indexed, stats.failed
                    );
                }
            }
            if format == OutputFormat::Json {
                print_json(&receipts)?;
            }
            service.shutdown().await;
            Ok(())
        }
        Commands::Work => {
            let service = DocketService::open(config).await?;
            let recovered = service.recover().await?;
            let stats = service.run_workers_until_idle().await;
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "interrupted": recovered.interrupted,
                    "queued": recovered.requeued,
                    "indexed": stats.indexed,
                    "skipped": stats.skipped,
                    "retried": stats.retried,
                    "failed": stats.failed,
                    "cancelled": stats.cancelled,
                }))?,
                OutputFormat::Summary => {
                    println!(
                        "Queued {} document(s) ({} interrupted)",
                        recovered.requeued, recovered.interrupted
                    );
                    println!(
                        "Indexed {}, failed {}, retried {}, skipped {}",
                        stats.indexed, stats.failed, stats.retried, stats.skipped
                    );
                }
            }
            service.shutdown().await;
            Ok(())
        }
        Commands::Status { document_id } => {
            let service = DocketService::open(config).await?;
            let view = service.status(&document_id).await?;
            match format {
                OutputFormat::Json => print_json(&view)?,
                OutputFormat::Summary => println!("{view}"),
            }
            Ok(())
        }
        Commands::Query {
            text,
            owner,
            top_k,
            documents,
            context,
        } => {
            let service = DocketService::open(config).await?;
            let mut query = service.new_query(text, owner);
            if let Some(k) = top_k {
                query.top_k = k;
            }
            if !documents.is_empty() {
                query = query.with_documents(documents);
            }
            let result = service.query(&query).await?;

            match format {
                OutputFormat::Json => print_json(&result)?,
                OutputFormat::Summary if context => println!("{}", result.to_context()),
                OutputFormat::Summary => {
                    if result.is_empty() {
                        println!("No matching passages");
                    }
                    for (i, p) in result.passages.iter().enumerate() {
                        println!(
                            "{}. {:.3} | {} | chunk {} | chars {}-{}",
                            i + 1,
                            p.score,
                            p.filename,
                            p.sequence,
                            p.start,
                            p.end
                        );
                        println!("   {}", p.text.trim().replace('\n', " "));
                    }
                }
            }
            Ok(())
        }
        Commands::Reindex { document_id, owner } => {
            let service = DocketService::open(config).await?;
            let owner = match owner {
                Some(owner) => owner,
                None => service.status(&document_id).await?.owner,
            };
            let job = service.reindex(&document_id, &owner).await?;
            service.run_workers_until_idle().await;
            let view = service.status(&document_id).await?;
            match format {
                OutputFormat::Json => print_json(&view)?,
                OutputFormat::Summary => println!("Job {job} finished\n{view}"),
            }
            service.shutdown().await;
            Ok(())
        }
        Commands::Delete { document_id, owner } => {
            let service = DocketService::open(config).await?;
            service.delete(&document_id, &owner).await?;
            println!("Deleted {document_id}");
            Ok(())
        }
        Commands::Purge { owner } => {
            let service = DocketService::open(config).await?;
            let deleted = service.delete_owner(&owner).await?;
            println!("Deleted {deleted} document(s) for {owner}");
            Ok(())
        }
        Commands::List { owner } => {
            let service = DocketService::open(config).await?;
            let documents = service.list(&owner).await?;
            match format {
                OutputFormat::Json => print_json(&documents)?,
                OutputFormat::Summary => {
                    println!("{} document(s) for {}:", documents.len(), owner);
                    for d in documents {
                        println!(
                            "  {} | {} | {} | {} chunks",
                            d.id, d.status, d.filename, d.chunk_count
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Summary { owner } => {
            let service = DocketService::open(config).await?;
            let summary = service.summary(&owner).await?;
            match format {
                OutputFormat::Json => print_json(&summary)?,
                OutputFormat::Summary => println!("{summary}"),
            }
            Ok(())
        }
        Commands::Health => {
            let service = DocketService::open(config).await?;
            let report = service.health().await;
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Summary => println!("{report}"),
            }
            if !report.is_healthy() {
                process::exit(1);
            }
            Ok(())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
