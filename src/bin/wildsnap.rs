//! wildsnap - animal detection for images, webcams and videos
//!
//! Frames are sent to a remote detection API; returned boxes are summarised
//! on stdout and, with `--out`, drawn onto the media and written as PNG.
//!
//! Subcommands:
//! 1. `detect`: one-shot detection on a still image
//! 2. `webcam`: live detection on a camera until Ctrl-C or `--seconds`
//! 3. `video`: live detection while a video file plays
//! 4. `health` / `models`: query the backend

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use wildsnap::ui::{Ui, UiMode};
use wildsnap::{
    CaptureMode, DisplayRect, ModelSelector, Session, Transport, WildsnapConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML when it ends in .toml, JSON otherwise).
    #[arg(long, env = "WILDSNAP_CONFIG")]
    config: Option<PathBuf>,
    /// Detection API base URL (`stub://` for an in-process stub).
    #[arg(long, env = "WILDSNAP_BACKEND_URL")]
    backend_url: Option<String>,
    /// Request shape: json or multipart.
    #[arg(long)]
    transport: Option<Transport>,
    /// yolov8n, best or compare.
    #[arg(long)]
    model: Option<ModelSelector>,
    #[arg(long)]
    confidence: Option<f64>,
    #[arg(long)]
    iou: Option<f64>,
    /// Keep every class instead of animals only.
    #[arg(long)]
    no_filter_animals: bool,
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect on a still image.
    Detect {
        image: PathBuf,
        /// Write the annotated image here (PNG).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Display size WIDTHxHEIGHT (defaults to the image size).
        #[arg(long, value_parser = parse_display)]
        display: Option<DisplayRect>,
        /// Print the raw results map instead of the summary.
        #[arg(long)]
        json: bool,
        /// Save each model's backend-rendered image here as `<model>.png`.
        #[arg(long)]
        annotated_dir: Option<PathBuf>,
    },
    /// Live detection on a webcam.
    Webcam {
        /// Device path, or stub://name.
        #[arg(long)]
        device: Option<String>,
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_parser = parse_display)]
        display: Option<DisplayRect>,
    },
    /// Live detection while a local video plays.
    Video {
        path: String,
        #[arg(long)]
        seconds: Option<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_parser = parse_display)]
        display: Option<DisplayRect>,
    },
    /// Backend health.
    Health,
    /// Models the backend can serve.
    Models,
}

fn parse_display(value: &str) -> Result<DisplayRect, String> {
    DisplayRect::parse(value).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(args.ui, is_tty, !stdout_is_tty);

    let mut config = {
        let _stage = ui.stage("Load configuration");
        load_config(&args)?
    };

    match args.command {
        Command::Detect {
            image,
            out,
            display,
            json,
            annotated_dir,
        } => run_detect(
            config,
            &ui,
            &image,
            out.as_deref(),
            display,
            json,
            annotated_dir.as_deref(),
        ),
        Command::Webcam {
            device,
            seconds,
            out,
            display,
        } => {
            if let Some(device) = device {
                config.webcam.device = device;
            }
            let mut session = Session::from_config(config);
            {
                let _stage = ui.stage("Start webcam");
                session.start_webcam()?;
            }
            if let Some(rect) = display {
                session.resize(rect);
            }
            run_live(&mut session, &ui, seconds, out.as_deref())
        }
        Command::Video {
            path,
            seconds,
            out,
            display,
        } => {
            let mut session = Session::from_config(config);
            {
                let _stage = ui.stage("Load video");
                session.load_video(&path)?;
            }
            let rect = display
                .or_else(|| session.video_rect())
                .unwrap_or_else(|| session.display_rect());
            session.resize(rect);
            session.play_video()?;
            run_live(&mut session, &ui, seconds, out.as_deref())
        }
        Command::Health => {
            let detector = config.detector();
            let health = {
                let _stage = ui.stage("Query backend health");
                detector.health()?
            };
            println!("status: {}", health.status);
            for (model, loaded) in &health.models_loaded {
                println!("  {}: {}", model, if *loaded { "loaded" } else { "missing" });
            }
            Ok(())
        }
        Command::Models => {
            let detector = config.detector();
            let catalog = {
                let _stage = ui.stage("Query backend models");
                detector.models()?
            };
            for (key, info) in &catalog.models {
                println!(
                    "{} ({}): {}{}",
                    key,
                    info.kind,
                    info.description,
                    if info.available { "" } else { " [unavailable]" }
                );
            }
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<WildsnapConfig> {
    let mut config = WildsnapConfig::load_from(args.config.as_deref())?;
    if let Some(url) = &args.backend_url {
        config.backend.url = url.clone();
    }
    if let Some(transport) = args.transport {
        config.backend.transport = transport;
    }
    if let Some(model) = args.model {
        config.detection.model = model;
    }
    if let Some(confidence) = args.confidence {
        config.detection.confidence = confidence;
    }
    if let Some(iou) = args.iou {
        config.detection.iou = iou;
    }
    if args.no_filter_animals {
        config.detection.filter_animals = false;
    }
    config.validate()?;
    Ok(config)
}

fn run_detect(
    config: WildsnapConfig,
    ui: &Ui,
    image: &Path,
    out: Option<&Path>,
    display: Option<DisplayRect>,
    json: bool,
    annotated_dir: Option<&Path>,
) -> Result<()> {
    let mut session = Session::from_config(config);
    {
        let _stage = ui.stage("Load image");
        session.load_image(image)?;
    }
    let natural = session
        .image()
        .loaded()
        .map(|loaded| DisplayRect::new(f64::from(loaded.frame.width), f64::from(loaded.frame.height)))
        .ok_or_else(|| anyhow!("image did not load"))?;
    session.resize(display.unwrap_or(natural));

    {
        let _stage = ui.stage("Detect");
        session.detect_image()?;
    }

    if json {
        if let Some(raw) = session.raw_json()? {
            println!("{}", raw);
        }
    } else {
        print_summary(&session);
    }

    if let Some(out) = out {
        write_composite(&session, out)?;
    }
    if let Some(dir) = annotated_dir {
        let written = session.save_annotated_images(dir)?;
        if written.is_empty() {
            println!("backend returned no annotated images");
        }
        for path in written {
            println!("annotated: {}", path.display());
        }
    }
    Ok(())
}

fn run_live(session: &mut Session, ui: &Ui, seconds: Option<u64>, out: Option<&Path>) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    session.start_live_detection()?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let stage = ui.stage(match session.mode() {
        CaptureMode::Video => "Live detection (video)",
        _ => "Live detection (webcam)",
    });

    let mut last_completed = 0;
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping live detection");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        if !session.live_detection_running() {
            log::info!("live detection stopped (source ended)");
            break;
        }

        let Some(stats) = session.poll_stats() else {
            break;
        };
        if stats.completed > last_completed {
            last_completed = stats.completed;
            let line = session
                .summary()
                .iter()
                .map(|summary| summary.to_string())
                .collect::<Vec<_>>()
                .join(" | ");
            stage.update(&line);
            if let Some(out) = out {
                if let Err(err) = write_composite(session, out) {
                    log::warn!("failed to write {}: {:#}", out.display(), err);
                }
            }
        }
    }

    let stats = session.poll_stats().unwrap_or_default();
    let live_error = session.live_error();
    session.stop_live_detection();
    drop(stage);
    println!(
        "ticks: {}, completed: {}, failed: {}, skipped (busy/not ready): {}/{}, discarded: {}",
        stats.ticks,
        stats.completed,
        stats.failed,
        stats.skipped_busy,
        stats.skipped_not_ready,
        stats.stale
    );
    if let Some(err) = live_error {
        println!("last live error: {}", err);
    }
    Ok(())
}

fn print_summary(session: &Session) {
    let summaries = session.summary();
    if summaries.is_empty() {
        println!("no results");
    }
    for summary in summaries {
        println!("{}", summary);
    }
}

fn write_composite(session: &Session, out: &Path) -> Result<()> {
    let composite = session.compose_current()?;
    composite
        .save(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    log::info!("annotated image written to {}", out.display());
    Ok(())
}
