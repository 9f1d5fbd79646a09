use clap::Parser;
use docket_context::text::{Chunker, ChunkerConfig, DEFAULT_BOUNDARY_PATTERNS, TextChunk};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::process;

/// A CLI tool to chunk a text file into overlapping passages as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Target chunk size in characters.
    #[arg(short = 's', long, default_value_t = 1000)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[arg(short, long, default_value_t = 100)]
    overlap: usize,

    /// Boundary search window in characters. Defaults to a quarter of the chunk size.
    #[arg(short, long)]
    lookback: Option<usize>,

    /// Comma-separated list of regex patterns for boundaries, most significant first.
    #[arg(short, long, value_delimiter = ',')]
    boundaries: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    sequence: usize,
    start: usize,
    end: usize,
    section: Option<&'a str>,
    page: Option<u32>,
    text: &'a str,
}

impl<'a> From<&'a TextChunk> for ChunkOutput<'a> {
    fn from(chunk: &'a TextChunk) -> Self {
        Self {
            sequence: chunk.sequence,
            start: chunk.start,
            end: chunk.end,
            section: chunk.section.as_deref(),
            page: chunk.page,
            text: &chunk.text,
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let mut config = ChunkerConfig::new(args.chunk_size, args.overlap);
    if let Some(lookback) = args.lookback {
        config = config.with_lookback(lookback);
    }

    let boundary_patterns: Vec<String> = args.boundaries.unwrap_or_else(|| {
        DEFAULT_BOUNDARY_PATTERNS
            .iter()
            .map(|&s| s.to_string())
            .collect()
    });
    let boundary_refs: Vec<&str> = boundary_patterns.iter().map(|s| s.as_str()).collect();

    let chunker = Chunker::with_boundaries(config, &boundary_refs)?;
    let chunks = chunker.split(&file_content);

    let output: Vec<ChunkOutput> = chunks.iter().map(ChunkOutput::from).collect();
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
