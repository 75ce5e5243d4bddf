use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use highlight_reel::{Config, JobState, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("Highlight Reel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cut the highlights out of a video using its transcript")
        .arg(
            Arg::new("video")
                .short('i')
                .long("video")
                .value_name("FILE")
                .help("Source video to extract highlights from")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("keywords")
                .short('k')
                .long("keywords")
                .value_name("LIST")
                .help("Comma-separated keywords that mark a highlight (default: configured set)")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("max-clips")
                .short('n')
                .long("max-clips")
                .value_name("NUM")
                .help("Maximum number of clips to cut")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("min-gap")
                .long("min-gap")
                .value_name("SECS")
                .help("Merge keyword segments closer than this")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("max-clip-length")
                .long("max-clip-length")
                .value_name("SECS")
                .help("Longest allowed clip")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .help("Directory for the produced clips")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("NUM")
                .help("Number of parallel clip cutters")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize logging
    let default_filter = if matches.get_flag("verbose") {
        "highlight_reel=debug,info"
    } else {
        "highlight_reel=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let video = matches
        .get_one::<PathBuf>("video")
        .cloned()
        .ok_or_else(|| anyhow!("--video is required"))?;

    // Load configuration, command line wins
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = matches.get_one::<PathBuf>("output-dir") {
        config.clips.output_dir = dir.clone();
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.clips.workers = *workers;
    }

    let mut detector = config.highlights.clone();
    if let Some(keywords) = matches.get_many::<String>("keywords") {
        let keywords: Vec<String> = keywords
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !keywords.is_empty() {
            detector = detector.with_keywords(keywords);
        }
    }
    if let Some(max_clips) = matches.get_one::<usize>("max-clips") {
        detector = detector.with_max_clips(*max_clips);
    }
    if let Some(min_gap) = matches.get_one::<f64>("min-gap") {
        detector = detector.with_min_gap(*min_gap);
    }
    if let Some(max_len) = matches.get_one::<f64>("max-clip-length") {
        detector = detector.with_max_clip_length(*max_len);
    }

    info!("🚀 Highlight Reel starting...");
    info!("{}", config.summary());

    let pipeline = Pipeline::new(config)?;
    let job_id = pipeline.submit(&video, detector).await?;
    info!("📹 Processing {} as job {}", video.display(), job_id);

    let ctrl_c_pipeline = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling job {}", job_id);
            if let Err(e) = ctrl_c_pipeline.cancel(job_id).await {
                error!("Failed to cancel job {}: {}", job_id, e);
            }
        }
    });

    let status = pipeline.wait(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    match status.state {
        JobState::Succeeded => {
            info!("🎉 {} clips written", status.clips.len());
            Ok(())
        }
        JobState::PartiallyFailed => {
            warn!(
                "⚠️  {} clips written, {} failed",
                status.clips.len(),
                status.errors.len()
            );
            Ok(())
        }
        _ => {
            let reason = status.reason.unwrap_or_else(|| "unknown failure".to_string());
            error!("❌ Job failed: {}", reason);
            std::process::exit(1);
        }
    }
}
