//! cue-audio - command line front end for the playback pipeline
//!
//! Opens a source through the same controller an editor would use, then either
//! prints its format, plays a range of it, or exports a range to WAV.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use cue_audio::audio::{
    AudioError, CacheKind, LoadProgress, OutputKind, PlaybackController, PlaybackEvent, TimeRange,
};
use cue_audio::settings::PlaybackSettings;

#[derive(Debug, Parser)]
#[command(name = "cue-audio")]
#[command(about = "Play and cut audio through a buffered, cached pipeline")]
struct Cli {
    /// Cache placed in front of file sources (default from settings)
    #[arg(long, value_enum)]
    cache: Option<CacheArg>,

    /// Directory for disk cache files
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Consume audio in real time without a sound card
    #[arg(long)]
    null_output: bool,

    /// Store the effective options as the new defaults
    #[arg(long)]
    save_settings: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CacheArg {
    None,
    Ram,
    Disk,
}

impl From<CacheArg> for CacheKind {
    fn from(arg: CacheArg) -> Self {
        match arg {
            CacheArg::None => CacheKind::None,
            CacheArg::Ram => CacheKind::Ram,
            CacheArg::Disk => CacheKind::Disk,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the format of a source
    Info {
        /// File path, `file://` URL, or `dummy-audio:` token
        source: String,
    },

    /// Play a source, or part of it
    Play {
        source: String,

        /// Start position (ms)
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// End position (ms); plays to the end when omitted
        #[arg(long)]
        end: Option<u64>,

        /// Playback volume (1.0 = unchanged)
        #[arg(long)]
        volume: Option<f32>,
    },

    /// Write a range of a source to a WAV file
    Export {
        source: String,

        #[arg(value_name = "OUT.WAV")]
        output: PathBuf,

        /// Start position (ms)
        #[arg(long)]
        start: u64,

        /// End position (ms)
        #[arg(long)]
        end: u64,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            log::info!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("cue-audio: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Apply command line overrides on top of the stored settings
fn apply_overrides(cli: &Cli, mut settings: PlaybackSettings) -> PlaybackSettings {
    if let Some(cache) = cli.cache {
        settings.cache_kind = cache.into();
    }
    if let Some(dir) = &cli.cache_dir {
        settings.cache_dir = Some(dir.clone());
    }
    if cli.null_output {
        settings.output = OutputKind::Null;
    }
    if let Command::Play {
        volume: Some(volume), ..
    } = cli.command
    {
        settings.volume = volume;
    }
    settings
}

/// Settings for this run only. Nothing is played by `info` or `export`, so
/// they never claim the sound card.
fn session_settings(command: &Command, mut settings: PlaybackSettings) -> PlaybackSettings {
    if !matches!(command, Command::Play { .. }) {
        settings.output = OutputKind::Null;
    }
    settings
}

fn run(cli: Cli) -> Result<(), AudioError> {
    let settings = apply_overrides(&cli, PlaybackSettings::load());
    if cli.save_settings {
        settings.save();
    }

    let settings = session_settings(&cli.command, settings);
    let mut controller = PlaybackController::new(settings);
    let mut progress = LoadProgress::default();

    match cli.command {
        Command::Info { source } => {
            controller.open_audio(&source, &mut progress)?;
            print_info(&controller);
            Ok(())
        }
        Command::Play {
            source, start, end, ..
        } => {
            controller.open_audio(&source, &mut progress)?;
            play(&mut controller, start, end)
        }
        Command::Export {
            source,
            output,
            start,
            end,
        } => {
            controller.open_audio(&source, &mut progress)?;
            controller.save_clip(&output, TimeRange::new(start, end))?;
            println!("Wrote {}", output.display());
            Ok(())
        }
    }
}

fn print_info(controller: &PlaybackController) {
    let Some(provider) = controller.provider() else {
        return;
    };
    println!("Source:      {}", provider.source_name());
    println!("Sample rate: {} Hz", provider.sample_rate());
    println!("Channels:    {}", provider.channels());
    println!("Bit depth:   {}", provider.bytes_per_sample() * 8);
    println!("Frames:      {}", provider.num_samples());
    println!("Duration:    {}", format_ms(controller.duration_ms()));
}

/// Drive the controller's timer until playback ends
fn play(controller: &mut PlaybackController, start: u64, end: Option<u64>) -> Result<(), AudioError> {
    let events = controller.subscribe();
    match end {
        Some(end) => controller.play_range(TimeRange::new(start, end))?,
        None => controller.play_to_end(start)?,
    }

    let interval = controller.tick_interval();
    let mut last_second = None;
    while controller.is_playing() {
        std::thread::sleep(interval);
        controller.tick();

        for event in events.try_iter() {
            match event {
                PlaybackEvent::Position(ms) if last_second != Some(ms / 1000) => {
                    last_second = Some(ms / 1000);
                    println!("{}", format_ms(ms));
                }
                PlaybackEvent::Error(msg) => return Err(AudioError::Decode(msg)),
                _ => {}
            }
        }
    }

    Ok(())
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}.{:03}", secs / 60, secs % 60, ms % 1000)
}
