//! kiln-melt: Flatten nested JSON records into relational tables
//!
//! Usage:
//!   # Read from file, output to stdout
//!   kiln-melt data.json
//!
//!   # Read from stdin, output to stdout
//!   echo '{"id": 1, "posts": [{"id": 10}]}' | kiln-melt
//!
//!   # Stream NDJSON, write one .jsonl file per table
//!   kiln-melt --ndjson events.jsonl --output-dir ./tables --entity event

// Use MiMalloc allocator for better performance (recommended by simd-json)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use kiln::melt::{
    read_records, JsonLinesSink, JsonLinesSource, JsonMelter, MeltConfig, NullPolicy, Sink,
    SingleStreamSink, StreamSummary,
};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kiln-melt")]
#[command(about = "Flatten nested JSON records into relational tables", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Stream newline-delimited JSON (one record per line)
    #[arg(long)]
    ndjson: bool,

    /// Output directory for one .jsonl file per table.
    /// If omitted, writes to stdout as a single stream tagged with `_table`
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,

    /// Entity name of the main table
    #[arg(long, short = 'e', default_value = "root")]
    entity: String,

    /// JSON file with a full melt configuration; flags below override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Records per flushed batch (default: 1000)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum container nesting depth (default: 100)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Separator for column and table names (default: "_")
    #[arg(long)]
    separator: Option<String>,

    /// Array handling: separate, inline, skip or smart
    #[arg(long)]
    array_mode: Option<String>,

    /// Id strategy: random, hash, natural:<field> or composite:<a,b>
    #[arg(long)]
    id_strategy: Option<String>,

    /// Failure handling: strict, skip or partial
    #[arg(long)]
    recovery: Option<String>,

    /// Keep null values and empty strings as columns
    #[arg(long)]
    include_nulls: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = build_config(&args)?;
    let batch_size = config.batch_size;
    let melter = JsonMelter::new(config).context("Invalid melt configuration")?;

    let summary = if let Some(output_dir) = &args.output_dir {
        let mut sink = JsonLinesSink::new(output_dir).with_context(|| {
            format!("Failed to create output directory {}", output_dir.display())
        })?;
        run(&args, &melter, &mut sink, batch_size)?
    } else {
        let stdout = std::io::stdout();
        let mut sink = SingleStreamSink::new(BufWriter::new(stdout.lock()));
        run(&args, &melter, &mut sink, batch_size)?
    };

    tracing::info!(
        records = summary.records,
        main_rows = summary.main_rows,
        child_rows = summary.child_rows,
        skipped = summary.skipped,
        "done"
    );
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Start from `--config` (or defaults) and apply flag overrides
fn build_config(args: &Args) -> Result<MeltConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open config {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => MeltConfig::default(),
    };

    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(depth) = args.max_depth {
        config.max_depth = depth;
    }
    if let Some(sep) = &args.separator {
        config.separator = sep.clone();
    }
    if let Some(mode) = &args.array_mode {
        config.array_mode = mode.parse()?;
    }
    if let Some(strategy) = &args.id_strategy {
        config.identity = strategy.parse()?;
    }
    if let Some(recovery) = &args.recovery {
        config.recovery = recovery.parse()?;
    }
    if args.include_nulls {
        config.nulls = NullPolicy::include_all();
    }
    Ok(config)
}

fn open_input(input: Option<&PathBuf>) -> Result<Box<dyn BufRead>> {
    Ok(match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    })
}

fn run<K: Sink>(
    args: &Args,
    melter: &JsonMelter,
    sink: &mut K,
    batch_size: usize,
) -> Result<StreamSummary> {
    let mut reader = open_input(args.input.as_ref())?;
    let progress = |done: usize, total: Option<usize>| match total {
        Some(total) => tracing::info!(done, total, "progress"),
        None => tracing::info!(done, "progress"),
    };

    let summary = if args.ndjson {
        let source = JsonLinesSource::new(reader);
        melter.stream(source, &args.entity, sink, batch_size, progress)?
    } else {
        // Whole document for SIMD parsing; falls back to NDJSON
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        melter.stream(read_records(&content), &args.entity, sink, batch_size, progress)?
    };

    sink.close()?;
    Ok(summary)
}
