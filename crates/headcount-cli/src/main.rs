use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use headcount_core::notify::{LogNotifier, Notification, Notifier, SpoolNotifier};
use headcount_core::report::{read_records, ABSENT_FILE, PRESENT_FILE};
use headcount_core::{presets, AttendanceReport, Roster};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod outbox;

use config::Config;
use outbox::Outbox;

#[derive(Parser)]
#[command(name = "headcount", about = "Attendance from a group photo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take attendance: detect faces in a scene and verify them against a roster
    Run {
        /// Roster CSV with regno,name,image_path columns
        #[arg(short, long)]
        roster: PathBuf,
        /// Group photo of the session
        #[arg(short, long)]
        scene: PathBuf,
        /// Directory for present_students.csv and absent_students.csv
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        /// Print the report as JSON instead of the text summary
        #[arg(long)]
        json: bool,
        /// Send the summary here (overrides HEADCOUNT_NOTIFY_DESTINATION)
        #[arg(long)]
        notify: Option<String>,
    },
    /// Load a roster and list usable and skipped rows
    Roster {
        #[arg(short, long)]
        roster: PathBuf,
    },
    /// Detect faces in a scene without verification
    Detect {
        #[arg(short, long)]
        scene: PathBuf,
        /// Save each 224x224 face crop as a PNG in this directory
        #[arg(long)]
        save_crops: Option<PathBuf>,
    },
    /// Show the records of a previous run
    Records {
        /// Directory holding the CSV files
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Show configuration and model availability
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run {
            roster,
            scene,
            out_dir,
            json,
            notify,
        } => run(&config, &roster, scene, &out_dir, json, notify).await,
        Commands::Roster { roster } => show_roster(&roster),
        Commands::Detect { scene, save_crops } => detect(&config, scene, save_crops).await,
        Commands::Records { dir } => show_records(&dir),
        Commands::Status => status(&config),
    }
}

async fn run(
    config: &Config,
    roster_path: &Path,
    scene: PathBuf,
    out_dir: &Path,
    json: bool,
    notify: Option<String>,
) -> Result<()> {
    let roster = Roster::load(roster_path)
        .with_context(|| format!("loading roster {}", roster_path.display()))?;
    for skipped in &roster.skipped {
        eprintln!(
            "skipped {} ({}): {}",
            skipped.identity_id,
            skipped.image_path.display(),
            skipped.reason
        );
    }

    let engine = engine::spawn_engine(config, true).context("starting engine")?;

    let partition = tokio::time::timeout(
        config.run_timeout(),
        engine.take_attendance(scene, roster.entries),
    )
    .await
    .with_context(|| format!("attendance run exceeded {}s", config.run_timeout_secs))?
    .context("attendance run failed")?;

    let report = AttendanceReport::build(&partition);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary);
    }

    let delivery = match notify.or_else(|| config.notify_destination.clone()) {
        Some(destination) => {
            let due = chrono::Utc::now()
                + chrono::Duration::from_std(config.notify_delay())
                    .context("notification delay out of range")?;
            Some((
                notifier_for(config),
                Notification::new(destination, report.summary.clone(), due),
            ))
        }
        None => None,
    };

    let delivered = publish(&report, out_dir, delivery).await?;
    tracing::info!(delivered, "run finished");
    Ok(())
}

fn notifier_for(config: &Config) -> Arc<dyn Notifier> {
    match &config.notify_spool_dir {
        Some(dir) => Arc::new(SpoolNotifier::new(dir)),
        None => Arc::new(LogNotifier),
    }
}

/// Write the records, then hand the summary to the notifier.
///
/// Records are durable before any delivery is attempted; a delivery failure
/// is logged by the outbox and leaves them in place. Returns the number of
/// notifications delivered.
async fn publish(
    report: &AttendanceReport,
    out_dir: &Path,
    delivery: Option<(Arc<dyn Notifier>, Notification)>,
) -> Result<usize> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    report
        .write_to_dir(out_dir)
        .context("writing attendance records")?;

    let Some((notifier, notification)) = delivery else {
        return Ok(0);
    };
    let outbox = Outbox::spawn(notifier);
    outbox.enqueue(notification);
    Ok(outbox.shutdown().await)
}

fn show_roster(path: &Path) -> Result<()> {
    let roster =
        Roster::load(path).with_context(|| format!("loading roster {}", path.display()))?;

    println!("{} usable entries:", roster.len());
    for entry in &roster.entries {
        println!(
            "  {:<12} {:<24} {}",
            entry.identity_id,
            entry.display_name,
            entry.image_path.display()
        );
    }
    if !roster.skipped.is_empty() {
        println!("{} skipped:", roster.skipped.len());
        for row in &roster.skipped {
            println!("  {:<12} {}", row.identity_id, row.reason);
        }
    }
    Ok(())
}

async fn detect(config: &Config, scene: PathBuf, save_crops: Option<PathBuf>) -> Result<()> {
    let engine = engine::spawn_engine(config, false).context("starting engine")?;
    let candidates = engine.localize(scene).await?;

    println!("{} face(s) found", candidates.len());
    for (i, c) in candidates.iter().enumerate() {
        let b = &c.bounding_box;
        println!(
            "  #{i}: x={:.0} y={:.0} w={:.0} h={:.0} confidence={:.3}",
            b.x, b.y, b.width, b.height, b.confidence
        );
    }

    if let Some(dir) = save_crops {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        for (i, c) in candidates.iter().enumerate() {
            let path = dir.join(format!("face_{i:03}.png"));
            c.pixels
                .save(&path)
                .with_context(|| format!("saving {}", path.display()))?;
        }
        println!("crops saved to {}", dir.display());
    }
    Ok(())
}

fn show_records(dir: &Path) -> Result<()> {
    for file in [PRESENT_FILE, ABSENT_FILE] {
        let records = read_records(&dir.join(file))?;
        println!("{file} ({}):", records.len());
        for r in &records {
            println!("  {:<12} {:?}", r.regno, r.status);
        }
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let detector = config.detector_model_path();
    let models: Vec<serde_json::Value> = match config.presets() {
        Ok(presets) => presets
            .iter()
            .map(|p| {
                let path = config.model_path(p);
                serde_json::json!({
                    "name": p.name(),
                    "path": path,
                    "present": Path::new(&path).exists(),
                    "threshold": p.embedding.threshold,
                })
            })
            .collect(),
        Err(e) => vec![serde_json::json!({ "error": e.to_string() })],
    };

    let builtin: Vec<&str> = presets::list_presets().iter().map(|p| p.name()).collect();

    let out = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "model_dir": config.model_dir,
        "detector": {
            "path": detector,
            "present": Path::new(&detector).exists(),
        },
        "verify_models": models,
        "builtin_presets": builtin,
        "detection": {
            "scale_step": config.scale_step,
            "min_neighbors": config.min_neighbors,
            "max_input": config.detect_max_input,
            "confidence": config.detect_confidence,
        },
        "pair_timeout_ms": config.pair_timeout_ms,
        "run_timeout_secs": config.run_timeout_secs,
        "notify_destination": config.notify_destination,
        "notify_delay_secs": config.notify_delay_secs,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
