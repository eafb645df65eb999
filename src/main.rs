use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chipdeck::track::{ModelHint, VideoClock};
use chipdeck::utils::format_time;
use chipdeck::{ChipModel, EngineSettings, PlaybackSession, PlaybackState, TrackLoader, TrackRequest, TrackSource};

#[derive(Parser, Debug)]
#[command(name = "chipdeck")]
#[command(about = "Plays SID chip music through the sound card")]
#[command(version)]
struct Cli {
    /// Engine settings (TOML)
    #[arg(short, long, global = true, env = "CHIPDECK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header of a tune
    Info {
        /// URL or file path
        source: String,
    },
    /// Play a tune on the output device
    Play(TuneArgs),
    /// Render a tune to a WAV file
    Render {
        #[command(flatten)]
        tune: TuneArgs,

        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct TuneArgs {
    /// URL or file path
    source: String,

    /// 6581 or 8580
    #[arg(long)]
    chip: Option<ChipModel>,

    #[arg(long)]
    speed: Option<f64>,

    /// 1-based, defaults to the tune's start song
    #[arg(long)]
    subtune: Option<usize>,

    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chipdeck=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => EngineSettings::load(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => EngineSettings::default(),
    };

    match cli.command {
        Command::Info { source } => info_cmd(&settings, &source).await,
        Command::Play(tune) => play_cmd(settings, tune).await,
        Command::Render { tune, out } => render_cmd(&settings, tune, out).await,
    }
}

async fn info_cmd(settings: &EngineSettings, source: &str) -> Result<()> {
    let loader = TrackLoader::http(Duration::from_secs(settings.fetch_timeout_secs))?;
    let track = loader
        .load(&TrackRequest::new(TrackSource::parse(source)))
        .await
        .with_context(|| format!("Failed to load {}", source))?;
    let h = &track.header;

    println!("Title:     {}", track.title);
    println!("Artist:    {}", track.artist);
    println!("Released:  {}", h.released);
    println!("Format:    {:?} v{}", h.format, h.version);
    println!("Subtunes:  {} (starts at {})", track.subtune_count, track.default_subtune + 1);
    println!("Load/Init/Play: ${:04X} ${:04X} ${:04X}", h.load_address, h.init_address, h.play_address);
    println!(
        "Clock:     {}",
        match h.clock {
            VideoClock::Pal => "PAL",
            VideoClock::Ntsc => "NTSC",
            VideoClock::Any => "PAL/NTSC",
            VideoClock::Unknown => "unknown",
        }
    );
    println!(
        "Model:     {}",
        match h.model {
            ModelHint::Only(model) => model.label().to_string(),
            ModelHint::Any => "6581/8580".to_string(),
            ModelHint::Unknown => "unknown".to_string(),
        }
    );
    println!("Id:        {}", track.id);
    Ok(())
}

async fn play_cmd(settings: EngineSettings, tune: TuneArgs) -> Result<()> {
    let subtune = subtune_index(tune.subtune)?;
    let interval = Duration::from_millis(settings.progress_interval_ms);
    let session = PlaybackSession::open(settings).context("Failed to open playback session")?;

    let track = session
        .load(TrackSource::parse(&tune.source))
        .await
        .with_context(|| format!("Failed to load {}", tune.source))?;
    info!("Playing '{}' by {}", track.title, track.artist);

    if let Some(model) = tune.chip {
        session.set_chip_model(model)?;
    }
    if let Some(speed) = tune.speed {
        session.set_playback_speed(speed)?;
    }
    if let Some(index) = subtune {
        session.set_subtune(index)?;
    }
    if let Some(seconds) = tune.seconds {
        session.set_duration(seconds)?;
    }

    session.play().context("Failed to start playback")?;

    let mut ticker = tokio::time::interval(interval);
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let progress = session.poll_progress();
                print!("\r{}  {:5.1}%  [{}]", progress.label(), progress.percent, session.get_chip_model());
                let _ = stdout.flush();
                if progress.finished || progress.state == PlaybackState::Finished {
                    println!();
                    break;
                }
                if progress.state != PlaybackState::Playing {
                    println!();
                    warn!("Playback stopped ({:?})", progress.state);
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                println!();
                info!("Interrupted at {}", format_time(session.current_position()));
                session.stop()?;
                break;
            }
        }
    }

    session.close();
    Ok(())
}

async fn render_cmd(settings: &EngineSettings, tune: TuneArgs, out: PathBuf) -> Result<()> {
    let subtune = subtune_index(tune.subtune)?;
    let loader = TrackLoader::http(Duration::from_secs(settings.fetch_timeout_secs))?;
    let track = loader
        .load(&TrackRequest::new(TrackSource::parse(&tune.source)))
        .await
        .with_context(|| format!("Failed to load {}", tune.source))?;

    let mut config = settings.player_config(settings.sample_rate);
    if let Some(model) = tune.chip {
        config.chip_model = model;
    }
    if let Some(speed) = tune.speed {
        config.playback_speed = speed;
    }
    let subtune = subtune.unwrap_or(track.default_subtune);
    let seconds = tune.seconds.unwrap_or(settings.default_duration_secs);

    let frames = chipdeck::render_to_wav(&track, &config, subtune, seconds, &out)
        .with_context(|| format!("Failed to render to {}", out.display()))?;
    println!("Wrote {} frames to {}", frames, out.display());
    Ok(())
}

// --subtune is 1-based on the command line, 0-based in the library.
fn subtune_index(arg: Option<usize>) -> Result<Option<usize>> {
    match arg {
        Some(0) => bail!("Subtunes are numbered from 1"),
        Some(n) => Ok(Some(n - 1)),
        None => Ok(None),
    }
}
