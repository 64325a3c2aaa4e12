//! CLI binary for lesson-avatar.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use avatar_cdn::{
    AssetFetcher, AssetKind, AssetLocator, AvatarId, DeliveryTier, Expression, HttpAssetFetcher,
};
use clap::{Parser, Subcommand, ValueEnum};
use lesson_avatar::audio::{
    AudioDestination, AudioGraph, NullDestination, PlaybackBinder, UnlockGate, WavFileDestination,
};
use lesson_avatar::tts::Lesson;
use lesson_avatar::{LessonPlayer, PlayerConfig, RenderFrame, SpeakOutcome};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// lesson-avatar: talking-avatar lesson player.
#[derive(Parser)]
#[command(name = "lesson-avatar", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Synthesize a line and play it with a headless renderer.
    Speak {
        /// Text to speak.
        text: String,

        /// Avatar voice (kelly or ken).
        #[arg(short, long)]
        speaker: Option<String>,

        /// Facial expression while speaking.
        #[arg(short, long, default_value = "teaching_explaining")]
        expression: String,

        /// Write the played audio to this WAV file.
        #[arg(long)]
        wav_out: Option<PathBuf>,

        /// Load the critical expressions before speaking.
        #[arg(long)]
        warm_up: bool,
    },

    /// Play a lesson script (JSON with intro, slides and questions).
    Lesson {
        /// Lesson JSON file.
        path: PathBuf,

        /// Avatar voice (kelly or ken).
        #[arg(short, long)]
        speaker: Option<String>,

        /// Write the played audio to this WAV file.
        #[arg(long)]
        wav_out: Option<PathBuf>,
    },

    /// Print the URL of an avatar asset.
    Resolve {
        /// Avatar name.
        avatar: String,

        /// Asset kind.
        #[arg(value_enum)]
        kind: KindArg,

        /// Expression name, viseme name or frame index.
        key: String,

        /// Delivery tier.
        #[arg(short, long, value_enum, default_value = "full-frames")]
        tier: TierArg,
    },

    /// Check the synthesis service and the CDN.
    Health,

    /// Print the default configuration as TOML.
    Config {
        /// Also write it to the default config path.
        #[arg(long)]
        write: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Expression,
    Viseme,
    Frame,
}

impl From<KindArg> for AssetKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Expression => Self::Expression,
            KindArg::Viseme => Self::Viseme,
            KindArg::Frame => Self::Frame,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TierArg {
    FullFrames,
    Visemes,
    Expressions,
    StaticNeutral,
}

impl From<TierArg> for DeliveryTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::FullFrames => Self::FullFrames,
            TierArg::Visemes => Self::Visemes,
            TierArg::Expressions => Self::Expressions,
            TierArg::StaticNeutral => Self::StaticNeutral,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lesson_avatar=info,avatar_cdn=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PlayerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PlayerConfig::default(),
    };

    match cli.command {
        Command::Speak {
            text,
            speaker,
            expression,
            wav_out,
            warm_up,
        } => {
            let expression: Expression = expression
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            run_speak(config, &text, speaker, expression, wav_out, warm_up).await
        }
        Command::Lesson {
            path,
            speaker,
            wav_out,
        } => run_lesson(config, &path, speaker, wav_out).await,
        Command::Resolve {
            avatar,
            kind,
            key,
            tier,
        } => {
            let locator = AssetLocator::new(Arc::new(config.cdn));
            println!(
                "{}",
                locator.resolve_str(&avatar, kind.into(), &key, tier.into())
            );
            Ok(())
        }
        Command::Health => run_health(config).await,
        Command::Config { write } => {
            let defaults = PlayerConfig::default();
            print!("{}", toml::to_string_pretty(&defaults)?);
            if write {
                let path = PlayerConfig::default_config_path();
                defaults.save_to_file(&path)?;
                eprintln!("wrote {}", path.display());
            }
            Ok(())
        }
    }
}

/// Build a player whose audio goes to `wav_out`, or nowhere.
fn build_player(
    config: PlayerConfig,
    wav_out: Option<PathBuf>,
) -> anyhow::Result<(Arc<LessonPlayer<HttpAssetFetcher>>, mpsc::Receiver<RenderFrame>)> {
    let destination: Box<dyn AudioDestination> = match wav_out {
        Some(path) => Box::new(WavFileDestination::new(path)),
        None => Box::new(NullDestination::new()),
    };
    let graph = AudioGraph::connect(config.audio.fft_size, destination);
    // A terminal has no user gesture to wait for.
    let binder = PlaybackBinder::new(graph, UnlockGate::unlocked(), &config.audio);
    let (player, frames) = LessonPlayer::connect(config, binder)?;
    Ok((Arc::new(player), frames))
}

/// What the headless renderer saw.
#[derive(Debug, Default)]
struct RenderSummary {
    frames: usize,
    loaded: usize,
    by_tier: BTreeMap<&'static str, usize>,
}

/// Consume frames until `done` fires, then drain what is left.
fn spawn_renderer(
    mut frames: mpsc::Receiver<RenderFrame>,
    done: CancellationToken,
) -> tokio::task::JoinHandle<RenderSummary> {
    tokio::spawn(async move {
        let mut summary = RenderSummary::default();
        let mut paint = |frame: RenderFrame| {
            debug!(
                session = frame.session,
                time_ms = frame.time_ms,
                viseme = %frame.selection.viseme,
                url = %frame.handle.url,
                fps = frame.fps,
                "frame"
            );
            summary.frames += 1;
            if frame.handle.is_loaded() {
                summary.loaded += 1;
            }
            *summary.by_tier.entry(frame.handle.tier.name()).or_default() += 1;
        };
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => paint(frame),
                    None => break,
                },
            }
        }
        while let Ok(frame) = frames.try_recv() {
            paint(frame);
        }
        summary
    })
}

/// Stop playback on Ctrl+C.
fn stop_on_ctrl_c(player: &Arc<LessonPlayer<HttpAssetFetcher>>) -> tokio::task::JoinHandle<()> {
    let player = Arc::clone(player);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping playback...");
            player.stop();
        }
    })
}

fn speaker_or_default(speaker: Option<String>, config: &PlayerConfig) -> AvatarId {
    speaker.map_or(config.avatar, |s| AvatarId::normalise(&s))
}

fn print_outcome(outcome: &SpeakOutcome) {
    match outcome {
        SpeakOutcome::Completed {
            session,
            duration_ms,
            strategy,
        } => println!("session {session}: played {duration_ms} ms ({strategy:?} strategy)"),
        SpeakOutcome::Blocked { reason } => println!("skipped: {reason}"),
        SpeakOutcome::Interrupted => println!("interrupted"),
    }
}

fn print_summary(summary: &RenderSummary) {
    println!(
        "rendered {} frames, {} with loaded images",
        summary.frames, summary.loaded
    );
    for (tier, count) in &summary.by_tier {
        println!("  {tier}: {count}");
    }
}

async fn run_speak(
    config: PlayerConfig,
    text: &str,
    speaker: Option<String>,
    expression: Expression,
    wav_out: Option<PathBuf>,
    warm_up: bool,
) -> anyhow::Result<()> {
    let speaker = speaker_or_default(speaker, &config);
    let (player, frames) = build_player(config, wav_out)?;
    let done = CancellationToken::new();
    let renderer = spawn_renderer(frames, done.clone());
    let ctrl_c = stop_on_ctrl_c(&player);
    player.start_health_probe();

    if warm_up {
        let report = player.warm_up().await;
        println!(
            "warmed {} expressions, {} manifest assets",
            report.expressions, report.manifest
        );
    }

    let outcome = player.speak_as(text, speaker, expression).await;
    done.cancel();
    ctrl_c.abort();
    player.shutdown();
    let summary = renderer.await?;

    print_outcome(&outcome?);
    print_summary(&summary);
    println!("{}", serde_json::to_string_pretty(&player.status())?);
    Ok(())
}

async fn run_lesson(
    config: PlayerConfig,
    path: &std::path::Path,
    speaker: Option<String>,
    wav_out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read lesson {}", path.display()))?;
    let lesson: Lesson = serde_json::from_str(&json).context("invalid lesson JSON")?;
    let speaker = speaker_or_default(speaker, &config);

    let (player, frames) = build_player(config, wav_out)?;
    let done = CancellationToken::new();
    let renderer = spawn_renderer(frames, done.clone());
    let ctrl_c = stop_on_ctrl_c(&player);
    player.start_health_probe();
    player.warm_up().await;

    let outcomes = player.play_lesson(&lesson, speaker).await;
    done.cancel();
    ctrl_c.abort();
    player.shutdown();
    let summary = renderer.await?;

    for outcome in &outcomes? {
        print_outcome(outcome);
    }
    print_summary(&summary);
    Ok(())
}

async fn run_health(config: PlayerConfig) -> anyhow::Result<()> {
    config.validate()?;
    let locator = AssetLocator::new(Arc::new(config.cdn.clone()));
    let health_url = locator.health_url();
    let (player, _frames) = build_player(config.clone(), None)?;

    match player.synthesis_health().await {
        Ok(health) => {
            let voices = health.voices.join(", ");
            println!(
                "synthesis: {} (engine {}, voices [{voices}])",
                health.status,
                health.engine.as_deref().unwrap_or("unknown")
            );
        }
        Err(e) => println!("synthesis: unavailable ({e})"),
    }

    let fetcher = HttpAssetFetcher::new(&config.cdn)?;
    match fetcher.probe(&health_url).await {
        Ok(()) => println!("cdn: reachable ({health_url})"),
        Err(e) => println!("cdn: unreachable ({e})"),
    }
    Ok(())
}
