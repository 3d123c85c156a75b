use anyhow::{Context, Result, anyhow};
use clicktrack::audio::{
    AudioOutput, CancellationToken, ClickKind, ClickSource, ClickTrackFactory, DeviceOutput,
    FALLBACK_SAMPLE_RATE, Metronome, NullOutput, SynthClickSource, SystemClock, TempoConfig,
    TrackBuilder, WavClickSource, enumerate_output_devices, export_click_track,
};
use clicktrack::logging::{LogMode, init_logger};
use clicktrack::settings::{DEFAULT_SETTINGS_FILE, EngineSettings};
use clicktrack::ui::{TempoControls, TerminalUI};
use crossbeam::channel;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn print_help() {
    println!("Clicktrack - Terminal metronome with a drift-free beat display");
    println!();
    println!("USAGE:");
    println!("    clicktrack [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message");
    println!("    --debug              Write debug logging to debug.log");
    println!("    --config <path>      Settings file (default: clicktrack.toml)");
    println!("    --bpm <n>            Starting tempo in beats per minute (default: 120)");
    println!("    --beats <n>          Beats per measure (default: 4)");
    println!("    --export <path>      Write one measure of the click track to a WAV file and exit");
    println!("    --list-devices       List audio output devices and exit");
    println!();
    println!("CONTROLS:");
    println!("    Space      Play/Pause");
    println!("    ↑↓         BPM ±1");
    println!("    PgUp/PgDn  BPM ±10");
    println!("    +/-        Beats per measure");
    println!("    ←→         Skip (restart the visible count)");
    println!("    M          Mute/unmute");
    println!("    Q          Quit");
    println!();
    println!("EXAMPLES:");
    println!("    clicktrack                           # 4 beats at 120 bpm");
    println!("    clicktrack --beats 3 --bpm 90        # Waltz time");
    println!("    clicktrack --export measure.wav      # Render one measure");
}

#[derive(Debug)]
struct Args {
    help: bool,
    debug: bool,
    list_devices: bool,
    config: PathBuf,
    bpm: f64,
    beats: u32,
    export: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args {
        help: false,
        debug: false,
        list_devices: false,
        config: PathBuf::from(DEFAULT_SETTINGS_FILE),
        bpm: 120.0,
        beats: 4,
        export: None,
    };

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{} needs a value", name))
        };
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "--debug" => parsed.debug = true,
            "--list-devices" => parsed.list_devices = true,
            "--config" => parsed.config = PathBuf::from(value("--config")?),
            "--bpm" => {
                parsed.bpm = value("--bpm")?
                    .parse()
                    .context("--bpm must be a number")?
            }
            "--beats" => {
                parsed.beats = value("--beats")?
                    .parse()
                    .context("--beats must be a whole number")?
            }
            "--export" => parsed.export = Some(PathBuf::from(value("--export")?)),
            other => return Err(anyhow!("unknown option '{}' (try --help)", other)),
        }
    }
    Ok(parsed)
}

fn click_source(settings: &EngineSettings) -> Arc<dyn ClickSource> {
    if let Some(dir) = &settings.asset_dir {
        let source = WavClickSource::new(dir);
        if source.is_complete() {
            info!("Using click samples from {}", dir.display());
            return Arc::new(source);
        }
        warn!(
            "{} is missing {} or {}; using built-in clicks",
            dir.display(),
            ClickKind::Accent.file_name(),
            ClickKind::Regular.file_name()
        );
    }
    Arc::new(SynthClickSource::default())
}

fn export(path: &Path, config: TempoConfig, source: Arc<dyn ClickSource>) -> Result<()> {
    let sample_rate = source.load(ClickKind::Accent)?.sample_rate;
    let factory = ClickTrackFactory::new(source);
    let track = factory.build(config, sample_rate, &CancellationToken::new())?;
    export_click_track(path, &track)?;
    println!(
        "Wrote {} ({} frames, {:.3}s)",
        path.display(),
        track.frames(),
        track.duration_secs()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    if args.help {
        print_help();
        return Ok(());
    }

    if args.list_devices {
        for name in enumerate_output_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut settings = EngineSettings::load_or_default(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    settings.debug |= args.debug;

    let mode = if settings.debug {
        LogMode::DebugFile
    } else if args.export.is_some() {
        LogMode::Batch
    } else {
        LogMode::Interactive
    };
    init_logger(mode);

    let source = click_source(&settings);

    if let Some(path) = &args.export {
        let config = TempoConfig::new(args.beats, args.bpm)?;
        return export(path, config, source);
    }

    if settings.debug {
        println!("Starting Clicktrack in DEBUG mode (logging to debug.log)...");
    } else {
        println!("Starting Clicktrack...");
    }

    // The device stream lives on the scheduler thread; it reports back which
    // output it ended up with.
    let (name_tx, name_rx) = channel::bounded::<String>(1);
    let device_name = settings.output_device.clone();
    let open_output = move || -> Box<dyn AudioOutput> {
        let output: Box<dyn AudioOutput> = match DeviceOutput::open(device_name.as_deref()) {
            Ok(device) => Box::new(device),
            Err(e) => {
                warn!("{}; continuing without sound", e);
                Box::new(NullOutput::new(FALLBACK_SAMPLE_RATE))
            }
        };
        let _ = name_tx.send(output.name().to_string());
        output
    };

    let metronome = Metronome::new(settings, open_output, source, Arc::new(SystemClock))?;
    let output_name = name_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap_or_else(|_| "unknown".to_string());

    let controls = TempoControls::new(args.beats, args.bpm);
    let mut ui = TerminalUI::new(metronome, controls, &output_name)
        .map_err(|e| anyhow!("UI creation failed: {}", e))?;
    ui.run().map_err(|e| anyhow!("UI run failed: {}", e))?;
    drop(ui);

    println!("Clicktrack stopped.");
    Ok(())
}
