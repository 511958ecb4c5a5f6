#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod config;
mod corpus;
mod evaluate;
mod generator;
mod inference;
mod inspect;
mod model;
mod prepare;
mod split;
mod token_bin;
mod utils_tensor;
mod vocab;

use crate::generator::Preset;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand, Debug, Clone)]
enum Task {
    /// Write addition problems as JSONL.
    Generate(GenerateCmd),
    /// Tokenize a JSONL corpus into train.bin, val.bin and meta.json.
    Prepare(PrepareCmd),
    /// Decode prepared token arrays back to text.
    Inspect(InspectCmd),
    /// Measure exact-match accuracy of a checkpoint on random additions.
    Evaluate(InferenceCmd),
    /// Print completions of a start prompt.
    Sample(InferenceCmd),
}

#[derive(Parser, Debug, Clone)]
pub struct GenerateCmd {
    /// Generate one of the stock datasets instead of a custom one.
    #[arg(long, value_enum, conflicts_with_all = ["digits", "samples", "out"])]
    preset: Option<Preset>,

    /// Directory the preset files are written to.
    #[arg(long, default_value = "data")]
    out_dir: PathBuf,

    /// Maximum number of digits per operand.
    #[arg(long)]
    digits: Option<u32>,

    /// Number of random samples, every operand pair when omitted.
    #[arg(long)]
    samples: Option<usize>,

    /// Output JSONL file.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Seed for random sampling.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Parser, Debug, Clone)]
pub struct PrepareCmd {
    /// Path to the input JSONL file.
    #[arg(long)]
    file: PathBuf,

    /// Output directory, defaults to the input file's directory.
    #[arg(long = "out_dir")]
    out_dir: Option<PathBuf>,

    /// Separator between input and output.
    #[arg(long, default_value = "=")]
    sep: String,

    /// Token ending every sample, `\n` escapes are accepted.
    #[arg(long = "stop_token", default_value = "\n")]
    stop_token: String,

    /// Fraction of samples held out for validation, 0 trains and validates
    /// on the full set.
    #[arg(long = "test_size", default_value_t = 0.1)]
    test_size: f64,

    /// Shuffle the samples before splitting.
    #[arg(long)]
    shuffle: bool,

    /// Seed for shuffling.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Parser, Debug, Clone)]
pub struct InspectCmd {
    /// Directory holding meta.json and the .bin files.
    #[arg(long)]
    data_dir: PathBuf,

    /// Which token array to decode.
    #[arg(long, default_value = "train", value_parser = ["train", "val"])]
    split: String,

    /// Number of records to print.
    #[arg(long, default_value_t = 20)]
    lines: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct InferenceCmd {
    /// JSON file with settings, applied before the overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// `key=value` settings, e.g. `out_dir=out/basic dataset=basic num_samples=50`.
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(chrome_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(fmt_layer).init();
        None
    };

    match &args.task {
        Task::Generate(cmd) => generator::run(cmd, &args),
        Task::Prepare(cmd) => prepare::run(cmd, &args),
        Task::Inspect(cmd) => inspect::run(cmd, &args),
        Task::Evaluate(cmd) => evaluate::run(cmd, &args),
        Task::Sample(cmd) => inference::run_sample(cmd, &args),
    }
}
