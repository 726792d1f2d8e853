use clap::Parser;
use log::{info, warn};
use pixelboy_core::{
    Cartridge, EmulatorConfig, GameBoy,
    audio_queue::{AudioPump, AudioSink},
    hardware::Model,
};
use std::error::Error;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const PUMP_CADENCE: Duration = Duration::from_millis(5);

#[derive(Parser, Debug)]
#[command(version, about = "Headless Game Boy / Game Boy Color runner")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Emulator settings in TOML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to boot ROM file
    #[arg(long)]
    boot_rom: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long, default_value_t = 600)]
    frames: u32,

    /// Force DMG mode
    #[arg(long, conflicts_with = "cgb")]
    dmg: bool,

    /// Force CGB mode
    #[arg(long, conflicts_with = "dmg")]
    cgb: bool,

    /// Write raw 16-bit little-endian stereo PCM to this file
    #[arg(long)]
    audio_out: Option<PathBuf>,

    /// Print bytes sent over the link port
    #[arg(long)]
    serial: bool,
}

impl Args {
    fn model_override(&self) -> Option<Model> {
        if self.dmg {
            Some(Model::Dmg)
        } else if self.cgb {
            Some(Model::Cgb)
        } else {
            None
        }
    }
}

/// Interleaved PCM file fed from the audio pump thread.
struct PcmFile {
    out: BufWriter<File>,
    frames: u64,
    error: Option<io::Error>,
}

impl PcmFile {
    fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            frames: 0,
            error: None,
        })
    }

    fn finish(mut self) -> io::Result<u64> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.out.flush()?;
        Ok(self.frames)
    }
}

impl AudioSink for PcmFile {
    fn write_frames(&mut self, frames: &[[i16; 2]]) {
        if self.error.is_some() {
            return;
        }
        for [left, right] in frames {
            let res = self
                .out
                .write_all(&left.to_le_bytes())
                .and_then(|()| self.out.write_all(&right.to_le_bytes()));
            if let Err(err) = res {
                self.error = Some(err);
                return;
            }
        }
        self.frames += frames.len() as u64;
    }
}

fn load_config(args: &Args) -> EmulatorConfig {
    let mut config = match &args.config {
        Some(path) => EmulatorConfig::load(path).unwrap_or_else(|e| {
            warn!("Ignoring config {}: {e}", path.display());
            EmulatorConfig::default()
        }),
        None => EmulatorConfig::default(),
    };
    if let Some(model) = args.model_override() {
        config.model = model;
    }
    config
}

fn print_serial(bytes: &[u8]) {
    for &b in bytes {
        if b.is_ascii_graphic() || b == b' ' || b == b'\n' {
            print!("{}", b as char);
        } else {
            print!("\\x{b:02X}");
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args);

    let cart = Cartridge::load(fs::read(&args.rom)?)?;
    let has_battery = cart.has_battery();
    let has_rtc = cart.has_rtc();
    let title = cart.title().to_owned();
    let mut gb = GameBoy::new(config);
    gb.load_cartridge(cart);
    info!(
        "Running \"{title}\" in {} mode",
        if gb.cgb { "CGB" } else { "DMG" }
    );

    if let Some(path) = &args.boot_rom {
        match fs::read(path) {
            Ok(data) => gb.load_boot_rom(data),
            Err(e) => warn!("Boot ROM {} not loaded: {e}", path.display()),
        }
    }

    let sav_path = args.rom.with_extension("sav");
    let rtc_path = args.rom.with_extension("rtc");
    if has_battery {
        match fs::read(&sav_path) {
            Ok(blob) => gb.load_ram(&blob),
            Err(e) => warn!("No save loaded from {}: {e}", sav_path.display()),
        }
    }
    if has_rtc && let Ok(blob) = fs::read(&rtc_path) && !gb.load_rtc_state(&blob) {
        warn!("Ignoring malformed clock state in {}", rtc_path.display());
    }

    let pump = match &args.audio_out {
        Some(path) => Some(AudioPump::spawn(
            gb.enable_audio(),
            PcmFile::create(path)?,
            PUMP_CADENCE,
        )),
        None => None,
    };

    let start = Instant::now();
    let mut cycles = 0u64;
    for _ in 0..args.frames {
        cycles += gb.run_frame()? as u64;
        if args.serial {
            print_serial(&gb.take_serial());
        }
    }
    if args.serial {
        println!();
    }
    info!(
        "Ran {} frames ({cycles} cycles) in {:.2?}",
        args.frames,
        start.elapsed()
    );
    if gb.is_locked_up() {
        warn!("CPU locked up: {}", gb.cpu.debug_state());
    }
    gb.disable_audio();

    if let Some(pump) = pump {
        match pump.stop() {
            Some(sink) => info!("Wrote {} audio frames", sink.finish()?),
            None => warn!("Audio thread exited abnormally"),
        }
    }

    if has_battery && let Some(ram) = gb.save_ram() {
        fs::write(&sav_path, ram)?;
        info!("Saved {}", sav_path.display());
    }
    if let Some(rtc) = gb.rtc_state() {
        fs::write(&rtc_path, rtc)?;
    }
    Ok(())
}
