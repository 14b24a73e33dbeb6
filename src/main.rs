// USAGE
//   seis_to_sds assemble -i /data/suds_unzipped -o /data/SDS -n NR --encoding FLOAT32 -v
//   seis_to_sds convert-suds /data/suds_unzipped -o /data/mseed_out --launcher wine
//   seis_to_sds bundle-events /data/sac_files --encoding STEIM2

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use seis_to_sds::{
    config::{AssembleConfig, DayRange, RunMode},
    convert::{bundle_events, convert_suds},
    demux::{DemuxConfig, Toolchain},
    pipeline::timeit,
    Assembler, Encoding, ExistingPolicy, GapFill,
};

// ─────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────
#[derive(Parser, Debug)]
#[command(name = "seis_to_sds", version, about = "Seismic waveform files → SDS day-file archive")]
struct Cli {
    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge source fragments into per-channel, per-day SDS files
    Assemble(AssembleArgs),
    /// Convert each legacy .WVR file into one miniSEED file
    ConvertSuds(ConvertArgs),
    /// Pack each MMDDhhmm.R?? event folder of SAC files into one miniSEED file
    BundleEvents(BundleArgs),
}

#[derive(Args, Debug)]
struct AssembleArgs {
    /// TOML file with the full configuration; flags below override it
    #[arg(short, long, env = "SEIS_TO_SDS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    input: Option<PathBuf>,

    /// SDS root
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Network code written into every identity
    #[arg(short, long)]
    network: Option<String>,

    /// YYYY-MM-DD or YYYY-MM-DD..YYYY-MM-DD
    #[arg(long)]
    days: Option<DayRange>,

    /// FLOAT32, FLOAT64, INT32 or STEIM2
    #[arg(long)]
    encoding: Option<Encoding>,

    /// preserve, zero or a fill value
    #[arg(long)]
    gap_fill: Option<GapFill>,

    /// batch or streaming
    #[arg(long)]
    mode: Option<RunMode>,

    /// overwrite, skip or merge
    #[arg(long)]
    existing: Option<ExistingPolicy>,

    /// Reader threads (0 = one per core)
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    #[arg(long)]
    chunk_size: Option<usize>,

    /// Hz; snaps rates this close to an integer
    #[arg(long)]
    rate_tolerance: Option<f64>,

    /// Hz; second snap pass when rates still differ (default: at least --rate-tolerance)
    #[arg(long)]
    fallback_rate_tolerance: Option<f64>,

    #[arg(long)]
    max_failures: Option<usize>,

    /// Write a per-day CSV report here
    #[arg(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    tools: ToolArgs,
}

#[derive(Args, Debug)]
struct ToolArgs {
    /// Directory with demux.exe, irig.exe and sud2sac.exe
    #[arg(long)]
    tool_dir: Option<PathBuf>,

    /// Run the tools through this program, e.g. wine
    #[arg(long)]
    launcher: Option<String>,
}

impl ToolArgs {
    fn apply(self, demux: &mut DemuxConfig) {
        if let Some(dir) = self.tool_dir {
            demux.tool_dir = dir;
        }
        if self.launcher.is_some() {
            demux.launcher = self.launcher;
        }
    }
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Root searched recursively for *.WVR
    input: PathBuf,

    /// Mirror the input tree here instead of writing beside each source
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, default_value = "FLOAT32")]
    encoding: Encoding,

    #[command(flatten)]
    tools: ToolArgs,
}

#[derive(Args, Debug)]
struct BundleArgs {
    /// Directory containing the event folders
    root: PathBuf,

    /// Output directory (default: the root)
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, default_value = "FLOAT32")]
    encoding: Encoding,
}

// ─────────────────────────────────────────────────────────────────────
// Setup
// ─────────────────────────────────────────────────────────────────────
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("seis_to_sds={level}"))),
        )
        .with_target(false)
        .init();
}

fn assemble_config(args: AssembleArgs) -> Result<AssembleConfig> {
    let mut cfg = match &args.config {
        Some(path) => AssembleConfig::load(path)?,
        None => AssembleConfig::default(),
    };

    if let Some(v) = args.input          { cfg.input_root = v; }
    if let Some(v) = args.output         { cfg.output_root = v; }
    if let Some(v) = args.network        { cfg.network_code = Some(v); }
    if let Some(v) = args.days           { cfg.day_range = Some(v); }
    if let Some(v) = args.encoding       { cfg.encoding = v; }
    if let Some(v) = args.gap_fill       { cfg.gap_fill = v; }
    if let Some(v) = args.mode           { cfg.mode = v; }
    if let Some(v) = args.existing       { cfg.existing = v; }
    if let Some(v) = args.workers        { cfg.workers = v; }
    if let Some(v) = args.chunk_size     { cfg.chunk_size = v; }
    if let Some(v) = args.max_failures   { cfg.max_failures = Some(v); }
    if let Some(v) = args.report         { cfg.report = Some(v); }
    cfg.set_rate_tolerances(args.rate_tolerance, args.fallback_rate_tolerance);
    args.tools.apply(&mut cfg.demux);

    cfg.validate()?;
    Ok(cfg)
}

// ─────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!("seis_to_sds v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Assemble(args) => {
            let cfg = assemble_config(args)?;
            let max_failures = cfg.max_failures;
            let summary = timeit("assemble", || Assembler::new(cfg).run())?;
            if summary.tally.exceeds(max_failures) {
                bail!(
                    "{} failure(s) exceed the allowed {}",
                    summary.tally.failures(),
                    max_failures.unwrap_or_default()
                );
            }
        }
        Command::ConvertSuds(args) => {
            let mut demux = DemuxConfig::default();
            args.tools.apply(&mut demux);
            let toolchain = Toolchain::new(&demux);
            let s = timeit("convert-suds", || {
                convert_suds(&args.input, args.output.as_deref(), &toolchain, args.encoding)
            })?;
            info!(written = s.written, skipped = s.skipped, failed = s.failed, "done");
        }
        Command::BundleEvents(args) => {
            let s = timeit("bundle-events", || bundle_events(&args.root, args.output.as_deref(), args.encoding))?;
            info!(written = s.written, failed = s.failed, "done");
        }
    }
    Ok(())
}
