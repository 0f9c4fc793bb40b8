use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use time::UtcOffset;
use tracing::info;
use ttyrec_retime::ascii::local_zone;
use ttyrec_retime::{EffectSpec, Format, Pipeline, Recipe};

#[derive(Debug, Parser)]
#[command(version, about = "Convert and retime ttyrec terminal recordings")]
struct Args {
    /// Recording to read
    input: PathBuf,

    /// Output file; the recording goes to stdout when omitted
    #[arg(long, short = 'o', env = "TTYREC_OUTPUT")]
    output: Option<PathBuf>,

    /// Input format (binary or ascii); guessed from the extension by default
    #[arg(long)]
    from: Option<Format>,

    /// Output format (binary or ascii); guessed from the extension, ascii on stdout
    #[arg(long)]
    to: Option<Format>,

    /// TOML recipe with [[effect]] tables, applied before the flags below
    #[arg(long, env = "TTYREC_RECIPE")]
    recipe: Option<PathBuf>,

    /// Use the local UTC offset for absolute timestamps in the text form
    #[arg(long, env = "TTYREC_LOCAL_TIME", default_value_t = false)]
    local_time: bool,

    /// Tag the entry after each prompt ending in SUFFIX as typed input
    #[arg(long, value_name = "SUFFIX", num_args = 0..=1, default_missing_value = " $ ")]
    mark_input: Option<String>,

    /// Merge entries closer than SECONDS
    #[arg(long, value_name = "SECONDS")]
    merge_lines: Option<f64>,

    /// Retype keystrokes at this many characters per minute
    #[arg(long)]
    cpm: Option<f64>,

    /// Cap every pause to SECONDS
    #[arg(long, value_name = "SECONDS")]
    cap_delays: Option<f64>,

    /// Playback speed factor
    #[arg(long)]
    speed: Option<f64>,

    /// Prepend a blank screen shown for SECONDS
    #[arg(long, value_name = "SECONDS")]
    intro: Option<f64>,

    /// Print the effective recipe as TOML and exit
    #[arg(long, default_value_t = false)]
    print_recipe: bool,

    /// List entries on stderr before writing
    #[arg(long, default_value_t = false)]
    dump: bool,
}

impl Args {
    fn recipe(&self) -> Result<Recipe> {
        let mut recipe = match &self.recipe {
            Some(path) => Recipe::load(path)?,
            None => Recipe::default(),
        };
        if let Some(prompt_suffix) = &self.mark_input {
            recipe.push(EffectSpec::MarkInput {
                prompt_suffix: prompt_suffix.clone(),
            });
        }
        if let Some(threshold) = self.merge_lines {
            recipe.push(EffectSpec::MergeLines {
                threshold,
                merge_input: false,
            });
        }
        if let Some(cpm) = self.cpm {
            recipe.push(EffectSpec::NormalizeInputSpeed { cpm });
        }
        if let Some(max_delay) = self.cap_delays {
            recipe.push(EffectSpec::CapDelays { max_delay });
        }
        if let Some(speed) = self.speed {
            recipe.push(EffectSpec::ChangeSpeed { speed });
        }
        if let Some(intro_delay) = self.intro {
            recipe.push(EffectSpec::AddIntro { intro_delay });
        }
        recipe.validate()?;
        Ok(recipe)
    }
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let recipe = args.recipe()?;
    if args.print_recipe {
        print!("{}", toml::to_string(&recipe).context("serialize recipe")?);
        return Ok(());
    }

    let zone = if args.local_time { local_zone() } else { UtcOffset::UTC };
    let from = args.from.unwrap_or_else(|| Format::from_path(&args.input));
    let to = args
        .to
        .unwrap_or_else(|| args.output.as_deref().map_or(Format::Ascii, Format::from_path));

    let mut pipeline = Pipeline::new().with_zone(zone);
    pipeline
        .read(&args.input, from)
        .with_context(|| format!("read {:?}", args.input))?
        .apply_recipe(&recipe)?;

    if args.dump {
        for (n, entry) in pipeline.by_ref().enumerate() {
            let entry = entry?;
            eprintln!(
                "{:>6} {} {:>6}B {}",
                n + 1,
                entry.timestamp,
                entry.payload.len(),
                entry.options
            );
        }
    }

    let written = match &args.output {
        Some(path) => pipeline
            .write(path, to)
            .with_context(|| format!("write {path:?}"))?,
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let written = match to {
                Format::Binary => pipeline.write_binary_to(&mut out)?,
                Format::Ascii => pipeline.write_ascii_to(&mut out)?,
            };
            out.flush()?;
            written
        }
    };
    info!(entries = written, effects = recipe.effects.len(), "done");
    Ok(())
}
