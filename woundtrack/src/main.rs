use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use woundtrack::{
    draw_patch_overlay, logging, HistoryAssessor, HistoryStore, JsonHistoryStore,
    LabelMapClassifier, MaskImageSegmenter, ScanContext, WoundAnalyzer, WoundId, WoundtrackConfig,
};

/// Measure wound photos against a green calibration patch and track healing over time
#[derive(Parser, Debug)]
#[command(name = "woundtrack")]
#[command(about = "Wound measurement and healing trajectory analysis", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a wound photo, record the measurement and reassess the wound
    Analyze(AnalyzeArgs),
    /// Evaluate early warnings and forecast a stored wound history
    Assess(AssessArgs),
    /// List wounds with recorded measurements
    Wounds {
        /// History store directory
        #[arg(short, long)]
        store: PathBuf,
    },
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Wound photo containing the calibration patch
    #[arg(short, long)]
    image: PathBuf,

    /// Grayscale wound probability mask for the photo
    #[arg(short, long)]
    mask: PathBuf,

    /// Grayscale tissue label map for the photo
    #[arg(short, long)]
    labels: PathBuf,

    #[arg(short, long)]
    wound_id: String,

    /// Patient is diabetic (stricter alert thresholds)
    #[arg(long)]
    diabetic: bool,

    /// Redness score in [0, 1]
    #[arg(long, default_value = "0.0")]
    redness: f64,

    /// Pus score in [0, 1]
    #[arg(long, default_value = "0.0")]
    pus: f64,

    /// Capture time, RFC 3339 (defaults to now)
    #[arg(short, long)]
    timestamp: Option<DateTime<Utc>>,

    /// History store directory
    #[arg(short, long)]
    store: PathBuf,

    /// Save the detected calibration patch outline next to the photo
    #[arg(short, long)]
    debug: bool,

    /// Forecast horizon in days after the scan
    #[arg(long, num_args = 1.., default_values_t = [7u32, 14, 28])]
    horizon_days: Vec<u32>,
}

#[derive(Args, Debug)]
struct AssessArgs {
    #[arg(short, long)]
    wound_id: String,

    /// History store directory
    #[arg(short, long)]
    store: PathBuf,

    /// Forecast horizon in days after the latest measurement
    #[arg(long, num_args = 1.., default_values_t = [7u32, 14, 28])]
    horizon_days: Vec<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json);

    let config = match &cli.config {
        Some(path) => WoundtrackConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WoundtrackConfig::default(),
    };

    match cli.command {
        Command::Analyze(args) => analyze(config, args),
        Command::Assess(args) => assess(config, args),
        Command::Wounds { store } => {
            let store = JsonHistoryStore::open(&store)?;
            let ids = store.wound_ids()?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
            Ok(())
        }
    }
}

fn analyze(config: WoundtrackConfig, args: AnalyzeArgs) -> Result<()> {
    let photo = image::open(&args.image)
        .with_context(|| format!("Failed to open image {}", args.image.display()))?
        .to_rgb8();
    info!(
        "Analyzing {} ({}x{})",
        args.image.display(),
        photo.width(),
        photo.height()
    );

    let store = JsonHistoryStore::open(&args.store)?;
    let analyzer = WoundAnalyzer::new(
        config,
        MaskImageSegmenter::new(&args.mask),
        LabelMapClassifier::new(&args.labels),
    );

    let context = ScanContext {
        wound_id: WoundId::new(args.wound_id),
        timestamp: args.timestamp.unwrap_or_else(Utc::now),
        patient_is_diabetic: args.diabetic,
    };
    let horizon = horizon_after(context.timestamp, &args.horizon_days)?;

    let report = analyzer
        .process_scan(&store, &photo, args.redness, args.pus, &context, &horizon)
        .map_err(|e| {
            error!(reason = e.reason(), "Scan analysis failed");
            e
        })
        .with_context(|| format!("Failed to analyze {}", args.image.display()))?;

    if args.debug {
        let debug_path = debug_path_for(&args.image);
        draw_patch_overlay(&photo, &report.scan.calibration)
            .save(&debug_path)
            .with_context(|| format!("Failed to save {}", debug_path.display()))?;
        info!("Saved calibration overlay to {}", debug_path.display());
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn assess(config: WoundtrackConfig, args: AssessArgs) -> Result<()> {
    let store = JsonHistoryStore::open(&args.store)?;
    let wound_id = WoundId::new(args.wound_id);
    let history = store.read(&wound_id)?;
    let Some(latest) = history.latest() else {
        bail!("No measurements recorded for wound {}", wound_id);
    };

    let horizon = horizon_after(latest.timestamp, &args.horizon_days)?;
    let assessment = HistoryAssessor::new(&config).assess(&history, &horizon)?;
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

/// Horizon timestamps `days` after `base`, in the order given
fn horizon_after(base: DateTime<Utc>, days: &[u32]) -> Result<Vec<DateTime<Utc>>> {
    days.iter()
        .map(|&d| {
            Duration::try_days(i64::from(d))
                .and_then(|offset| base.checked_add_signed(offset))
                .with_context(|| format!("Horizon of {} days is out of range", d))
        })
        .collect()
}

fn debug_path_for(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("scan");
    image.with_file_name(format!("{}_debug_calibration.png", stem))
}
