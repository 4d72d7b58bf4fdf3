//! dimuse CLI: headless playback and WAV export.
//!
//! Usage:
//!   cargo run --bin dm-cli -- music.imus speech.voc
//!   cargo run --bin dm-cli -- music.imus --wav output.wav --config engine.toml

use clap::{Parser, ValueEnum};
use dm_formats::{probe_header, Probe};
use dm_ir::MapEvent;
use dm_master::{
    prepare_sound, Command, Controller, EngineConfig, Group, ParamId, Residency, SoundId, SoundKind,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dm-cli", about = "Play or render iMUS, VOC and WAV sounds")]
struct Args {
    /// Sound files, started together as sounds 1, 2, ...
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Render to this WAV file instead of playing
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Engine configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Longest render, in seconds
    #[arg(long, default_value_t = 300)]
    seconds: u32,

    /// Volume group for every sound
    #[arg(long, value_enum, default_value_t = GroupArg::Music)]
    group: GroupArg,

    /// Read sounds through stream buffers instead of from memory
    #[arg(long)]
    stream: bool,

    /// Jump hook set on every sound after it starts
    #[arg(long)]
    hook: Option<i32>,

    /// Track volume, 0-127
    #[arg(long)]
    volume: Option<i32>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GroupArg {
    Music,
    Speech,
    Sfx,
}

impl From<GroupArg> for Group {
    fn from(arg: GroupArg) -> Self {
        match arg {
            GroupArg::Music => Group::Music,
            GroupArg::Speech => Group::Speech,
            GroupArg::Sfx => Group::Sfx,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = args.config.as_deref().map(load_config).unwrap_or_default();
    tracing::debug!(?config, "engine configuration");
    println!(
        "Output:   {} Hz, {}-bit, {} channel(s)",
        config.output.sample_rate, config.output.word_size, config.output.channels
    );

    let mut ctrl = Controller::new(config).unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {e}");
        exit(1);
    });

    let residency = if args.stream { Residency::Streamed } else { Residency::Resource };
    let mut sounds: Vec<SoundId> = Vec::new();
    for (i, path) in args.files.iter().enumerate() {
        let sound = i as SoundId + 1;
        let data = std::fs::read(path).unwrap_or_else(|e| {
            eprintln!("Failed to read {}: {e}", path.display());
            exit(1);
        });
        let (file, kind) = prepare_sound(data).unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {e}", path.display());
            exit(1);
        });
        describe(sound, path, kind, &file);
        if let Err(e) = ctrl.load_sound(sound, file, residency) {
            eprintln!("Failed to load {}: {e}", path.display());
            exit(1);
        }
        sounds.push(sound);
    }
    println!();

    for &sound in &sounds {
        start(&ctrl, sound, &args);
    }

    match &args.wav {
        Some(wav) => render_to_wav(&mut ctrl, wav, args.seconds),
        None => play_audio(&mut ctrl),
    }
}

fn load_config(path: &Path) -> EngineConfig {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {e}", path.display());
        exit(1);
    });
    toml::from_str(&text).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {e}", path.display());
        exit(1);
    })
}

fn describe(sound: SoundId, path: &Path, kind: SoundKind, file: &[u8]) {
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let detail = match probe_header(file) {
        Ok(Probe::Imus(header)) => {
            let jumps = header
                .map
                .blocks()
                .iter()
                .filter(|b| matches!(b.event, MapEvent::Jump { .. }))
                .count();
            format!("{} map events, {} jumps, {} data bytes", header.map.len(), jumps, header.data_len)
        }
        Ok(Probe::Voc(header)) => format!("version {:#06x}, blocks at {}", header.version, header.data_start),
        _ => String::new(),
    };
    println!("Sound {sound}: {name} ({kind:?}) {detail}");
}

fn start(ctrl: &Controller, sound: SoundId, args: &Args) {
    let group = Group::from(args.group);
    if let Err(e) = ctrl.execute(Command::StartSound { sound, priority: 64, group }) {
        eprintln!("Failed to start sound {sound}: {e}");
        exit(1);
    }
    if let Some(hook) = args.hook {
        let _ = ctrl.execute(Command::SetHook { sound, hook });
    }
    if let Some(value) = args.volume {
        if let Err(e) = ctrl.execute(Command::SetParam { sound, param: ParamId::Volume, value }) {
            eprintln!("Bad volume: {e}");
            exit(1);
        }
    }
}

fn play_audio(ctrl: &mut Controller) {
    let rate = ctrl.config().output.sample_rate as u64;
    ctrl.play(true);
    println!("Playing...");
    println!();

    while ctrl.is_playing() {
        let secs = ctrl.frames_played() / rate.max(1);
        print!("\r{:02}:{:02} | {} sound(s)", secs / 60, secs % 60, ctrl.active_sounds());
        let _ = std::io::stdout().flush();
        std::thread::sleep(Duration::from_millis(50));
    }

    println!("\rDone.                    ");
}

fn render_to_wav(ctrl: &mut Controller, path: &Path, max_seconds: u32) {
    println!(
        "Rendering to {} at {} Hz...",
        path.display(),
        ctrl.config().output.sample_rate
    );

    let wav = ctrl.render_to_wav(max_seconds);
    println!("Rendered {} bytes", wav.len());

    std::fs::write(path, &wav).unwrap_or_else(|e| {
        eprintln!("Failed to write {}: {e}", path.display());
        exit(1);
    });

    println!("Done.");
}
