use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reftrack::analyzer::{AnalysisContext, BatchOptions};
use reftrack::config::AppConfig;
use reftrack::reference::ReferenceTrack;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "reftrack", version, about = "Extract reference tracks (beats, phrases, pitch, key, loudness) from songs")]
struct Cli {
    /// Path to a config file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one audio file and write its reference JSON
    Analyze {
        input: PathBuf,
        output: PathBuf,

        /// Write the key as "<name> major|minor"
        #[arg(long)]
        with_mode: bool,
    },

    /// Analyze every supported file under the given paths
    Batch {
        /// Files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Output directory (defaults to config out_dir, else next to each input)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Re-analyze tracks whose output already exists
        #[arg(long)]
        force: bool,

        /// Per-track time limit in seconds (default: derived from track length)
        #[arg(long)]
        timeout: Option<u64>,

        /// Write the key as "<name> major|minor"
        #[arg(long)]
        with_mode: bool,
    },

    /// Validate a reference JSON document
    Check { json: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let mut config = AppConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Analyze { input, output, with_mode } => {
            config.analysis.key_with_mode |= with_mode;
            let ctx = AnalysisContext::new(config.analysis.clone());
            let analysis = ctx
                .analyze_file(&input, &output, None)
                .with_context(|| format!("Failed to analyze {}", input.display()))?;
            let track = &analysis.reference;
            println!(
                "{}: {:.1} BPM, {} beats, {} phrases, key {}, {} frames",
                output.display(),
                track.tempo.unwrap_or(0.0),
                track.beats.len(),
                track.phrases.len(),
                track.key,
                track.loudness.len()
            );
            for warning in &analysis.warnings {
                println!("  warning: {warning}");
            }
        }

        Commands::Batch { paths, out_dir, jobs, force, timeout, with_mode } => {
            config.analysis.key_with_mode |= with_mode;
            if let Some(secs) = timeout {
                config.timeout_secs = secs;
            }
            // CLI > config
            let out_dir = out_dir.or(config.out_dir.clone());
            if let Some(dir) = &out_dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }

            let plan = reftrack::scanner::plan_jobs(&paths, out_dir.as_deref(), force);
            let options = BatchOptions {
                workers: if jobs > 0 { jobs } else { config.resolve_workers() },
                retries: config.resolve_retries(),
                timeout: Some(config.timeout_policy()),
            };
            let ctx = AnalysisContext::new(config.analysis.clone());
            let result = reftrack::analyzer::analyze_batch(&plan, &ctx, &options)
                .context("Batch analysis failed")?;
            println!(
                "Batch complete: {} analyzed, {} failed, {} timed out, {} skipped",
                result.analyzed, result.failed, result.timed_out, result.skipped
            );
            if result.failed > 0 || result.timed_out > 0 {
                anyhow::bail!("{} tracks did not complete", result.failed + result.timed_out);
            }
        }

        Commands::Check { json } => {
            let track = ReferenceTrack::load(&json)
                .with_context(|| format!("Failed to read {}", json.display()))?;
            let problems = track.validate();
            println!(
                "{}: {} beats, {} phrases, key {}, {} frames{}",
                json.display(),
                track.beats.len(),
                track.phrases.len(),
                track.key,
                track.ref_pitch_hz.len(),
                track
                    .duration
                    .map(|d| format!(", {:.1}s", d))
                    .unwrap_or_default()
            );
            if let (Some(hop), Some(sr)) = (track.hop_length, track.sample_rate) {
                let frame = Duration::from_secs_f64(hop as f64 / sr.max(1) as f64);
                println!("  hop {} samples ({} ms)", hop, frame.as_millis());
            }
            if problems.is_empty() {
                println!("  OK");
            } else {
                for p in &problems {
                    println!("  violation: {p}");
                }
                anyhow::bail!("{} violations", problems.len());
            }
        }
    }

    Ok(())
}
