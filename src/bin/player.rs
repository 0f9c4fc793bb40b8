use std::io::{self, Read};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Sender};
use dotenvy::dotenv;
use time::UtcOffset;
use tracing::{debug, info};
use ttyrec_retime::ascii::local_zone;
use ttyrec_retime::player::{Control, PlaybackOptions, Player};
use ttyrec_retime::{Format, Pipeline, Recipe};

#[derive(Debug, Parser)]
#[command(about = "Play a ttyrec recording in real time (p/space pause, +/- speed, q quit)")]
struct Args {
    /// Recording to play
    input: PathBuf,

    /// Read the text form instead of guessing from the extension
    #[arg(long, default_value_t = false)]
    ascii: bool,

    /// Initial playback speed
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Never wait longer than SECONDS of recording time between entries
    #[arg(long, value_name = "SECONDS", env = "TTYREC_MAX_IDLE")]
    max_idle: Option<f64>,

    /// TOML recipe applied before playback
    #[arg(long, env = "TTYREC_RECIPE")]
    recipe: Option<PathBuf>,

    /// Use the local UTC offset when reading the text form
    #[arg(long, env = "TTYREC_LOCAL_TIME", default_value_t = false)]
    local_time: bool,
}

fn control_for(byte: u8) -> Option<Control> {
    match byte {
        b'p' | b' ' => Some(Control::TogglePause),
        b'+' | b'=' => Some(Control::Faster),
        b'-' => Some(Control::Slower),
        b'q' => Some(Control::Quit),
        _ => None,
    }
}

fn spawn_stdin_controls(tx: Sender<Control>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for byte in stdin.lock().bytes() {
            let Ok(byte) = byte else { break };
            if let Some(control) = control_for(byte) {
                if tx.send(control).is_err() {
                    break;
                }
            }
        }
        debug!("control input closed");
    });
}

fn main() -> Result<()> {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    // resolve the local offset before any other thread exists
    let zone = if args.local_time { local_zone() } else { UtcOffset::UTC };
    let format = if args.ascii { Format::Ascii } else { Format::from_path(&args.input) };

    let mut pipeline = Pipeline::new().with_zone(zone);
    pipeline
        .read(&args.input, format)
        .with_context(|| format!("open {:?}", args.input))?;
    if let Some(path) = &args.recipe {
        pipeline.apply_recipe(&Recipe::load(path)?)?;
    }

    let (tx, rx) = unbounded::<Control>();
    let quit_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = quit_tx.send(Control::Quit);
    })
    .context("install Ctrl-C handler")?;
    spawn_stdin_controls(tx);

    let options = PlaybackOptions {
        speed: args.speed,
        max_idle: args
            .max_idle
            .map(Duration::try_from_secs_f64)
            .transpose()
            .context("--max-idle")?,
        ..PlaybackOptions::default()
    };
    let stdout = io::stdout();
    let mut player = Player::new(stdout.lock(), rx, options)?;
    let summary = player.play(&mut pipeline)?;
    info!(entries = summary.entries, quit = summary.quit, "playback over");
    Ok(())
}
