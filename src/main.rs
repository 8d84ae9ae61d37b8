use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sentiment_etl::{
    AnalyzerOptions, FsBlobStore, OpenAiAnalyzer, OutputSchema, PipelineOptions, RetryingAnalyzer, SentimentETL,
    TrackerKind,
};
use std::path::PathBuf;
use std::process::ExitCode;

/// Incremental sentiment analysis over a directory of blobs
#[derive(Parser)]
#[command(name = "sentiment-etl", about, long_about = None)]
struct Cli {
    /// Directory used as the blob store
    #[arg(long, global = true, default_value = "./data")]
    store: PathBuf,

    /// Records per analyzer call
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Output schema: flat-csv, entity-json or entity-csv
    #[arg(long, global = true)]
    schema: Option<OutputSchema>,

    /// Processed-record tracker: id-set or watermark
    #[arg(long, global = true)]
    tracker: Option<TrackerKind>,

    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze new records and fold them into the aggregate
    Process {
        /// Also store each chunk's own result under the chunk prefix
        #[arg(long)]
        keep_chunks: bool,

        /// Exit non-zero if any chunk was skipped
        #[arg(long)]
        strict: bool,
    },
    /// Merge stored per-chunk outputs into one consolidated table
    Consolidate,
    /// Write a narrative summary of the aggregate
    Summarize,
}

fn main() -> Result<ExitCode> {
    sentiment_etl::init_tracing_once();
    let cli = Cli::parse();

    let mut opts = PipelineOptions::default().merge_env().with_progress(!cli.no_progress);
    if let Some(n) = cli.chunk_size {
        opts = opts.with_chunk_size(n);
    }
    if let Some(s) = cli.schema {
        opts = opts.with_schema(s);
    }
    if let Some(t) = cli.tracker {
        opts = opts.with_tracker(t);
    }

    let store = FsBlobStore::open(&cli.store).with_context(|| format!("opening store {}", cli.store.display()))?;

    match cli.command {
        Commands::Process { keep_chunks, strict } => {
            let etl = SentimentETL::with_options(opts.with_chunk_outputs(keep_chunks));
            let analyzer = build_analyzer()?;
            let report = etl.process(&store, &analyzer)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if strict && !report.is_complete() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Consolidate => {
            let report = SentimentETL::with_options(opts).consolidate(&store)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Summarize => {
            let analyzer = build_analyzer()?;
            let report = SentimentETL::with_options(opts).summarize(&store, &analyzer)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn build_analyzer() -> Result<RetryingAnalyzer<OpenAiAnalyzer>> {
    let aopts = AnalyzerOptions::from_env();
    let client = OpenAiAnalyzer::new(&aopts)?;
    Ok(RetryingAnalyzer::from_options(client, &aopts))
}
