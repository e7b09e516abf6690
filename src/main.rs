use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use prep_voice::voice::codec::{self, AudioFrame, frames_to_wav, pcm16_from_f32};
use prep_voice::voice::{
    CaptureConfig, CapturePipeline, CaptureSource, CpalOutput, PLAYBACK_SAMPLE_RATE,
    PlaybackScheduler,
};
use prep_voice::{Config, LiveConnector, SessionController, SessionState};

/// prep-voice - talk through a prep list with the kitchen agent
#[derive(Parser)]
#[command(name = "prep-voice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Projected meals for the service (overrides config)
    #[arg(long, env = "PREP_VOICE_TARGET_VOLUME")]
    target_volume: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice session (Enter toggles, q quits)
    Talk,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker {
        /// Interrupt playback after this many milliseconds
        #[arg(long)]
        interrupt_after_ms: Option<u64>,
    },
    /// Print the instruction text sent to the agent
    Instructions,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,prep_voice=info",
        1 => "info,prep_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(volume) = cli.target_volume {
        config.prep.target_volume = volume;
    }

    match cli.command.unwrap_or(Command::Talk) {
        Command::Talk => talk(config).await,
        Command::TestMic { duration, save } => {
            test_mic(config.capture_config(), duration, save.as_deref()).await
        }
        Command::TestSpeaker { interrupt_after_ms } => {
            test_speaker(config.output_sample_rate, interrupt_after_ms).await
        }
        Command::Instructions => {
            println!("{}", config.instructions());
            Ok(())
        }
    }
}

/// Run interactive sessions until the user quits
async fn talk(mut config: Config) -> anyhow::Result<()> {
    let api_key = config.take_api_key()?;
    let connector = LiveConnector::new(&config.endpoint, api_key)?;
    let output = CpalOutput::open(config.output_sample_rate)?;
    let capture = CapturePipeline::new(config.capture_config());

    tracing::info!(model = %config.model, "starting prep-voice");

    let handle = SessionController::new(
        Box::new(capture),
        Arc::new(connector),
        Arc::new(output),
        config.session_setup(),
    )
    .spawn();

    let mut state = handle.watch_state();
    let mut transcript = handle.watch_transcript();
    let mut notices = handle.notices();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;

    println!("Press Enter to start or stop talking, q then Enter to quit.");
    handle.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(l) if l.trim().eq_ignore_ascii_case("q") => break,
                Some(_) => handle.start().await?,
                None => break,
            },
            Ok(()) = state.changed() => {
                let current = *state.borrow_and_update();
                match current {
                    SessionState::Active => println!("* listening"),
                    SessionState::Idle => println!("* stopped (Enter to talk again)"),
                    SessionState::Opening | SessionState::Closing => {}
                }
            }
            Ok(()) = transcript.changed() => {
                let snapshot = transcript.borrow_and_update().clone();
                if snapshot.turns.len() < printed {
                    printed = 0;
                }
                for turn in &snapshot.turns[printed..] {
                    if !turn.user.is_empty() {
                        println!("you:   {}", turn.user.trim());
                    }
                    if !turn.agent.is_empty() {
                        println!("agent: {}", turn.agent.trim());
                    }
                }
                printed = snapshot.turns.len();
            }
            Ok(notice) = notices.recv() => {
                println!("! session ended: {}", notice.message);
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

/// Test microphone input
async fn test_mic(
    config: CaptureConfig,
    duration: u64,
    save: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = CapturePipeline::new(config);
    let mut frames = capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut captured: Vec<AudioFrame> = Vec::new();

    loop {
        let frame = tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            frame = frames.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let samples = frame.to_mono_f32();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");
        captured.push(frame);
    }

    capture.stop();

    println!("\n---");
    println!("Captured {} frames", captured.len());

    if let Some(path) = save {
        let wav = frames_to_wav(&captured)?;
        std::fs::write(path, wav)?;
        println!("Saved recording to {}", path.display());
    }

    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Play a tone as a series of chunks, the way agent speech arrives
async fn test_speaker(sample_rate: u32, interrupt_after_ms: Option<u64>) -> anyhow::Result<()> {
    const CHUNK_MS: u32 = 200;
    const CHUNKS: u32 = 10;

    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds, without gaps\n");

    let sample_rate = if sample_rate == 0 { PLAYBACK_SAMPLE_RATE } else { sample_rate };
    let output = Arc::new(CpalOutput::open(sample_rate)?);
    let mut scheduler = PlaybackScheduler::new(output);

    let chunk_len = (sample_rate * CHUNK_MS / 1000) as usize;
    #[allow(clippy::cast_precision_loss)]
    let tone = |i: usize| {
        let t = i as f32 / sample_rate as f32;
        pcm16_from_f32((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3)
    };

    for n in 0..CHUNKS as usize {
        let samples: Vec<i16> = (n * chunk_len..(n + 1) * chunk_len).map(tone).collect();
        let frame = AudioFrame::mono(samples, sample_rate)?;
        scheduler.enqueue(&codec::encode(&frame));
    }

    println!(
        "Scheduled {} chunks, playback ends at {} ms",
        scheduler.active_count(),
        scheduler.cursor().as_millis()
    );

    if let Some(ms) = interrupt_after_ms {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        scheduler.interrupt();
        println!("Interrupted after {ms} ms");
    }

    let wait = scheduler.cursor() + Duration::from_secs(1);
    let _ = tokio::time::timeout(wait, async {
        while scheduler.active_count() > 0 {
            if let Some(notice) = scheduler.next_notice().await {
                scheduler.handle_notice(&notice);
            }
        }
    })
    .await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
