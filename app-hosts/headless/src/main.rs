//! Headless development host for the hotpatch sandbox
//!
//! Runs the render loop at a fixed rate, hot-swaps the watched sketch on
//! every save and accepts `{"type":"run","code":...}` lines on stdin.

mod hotreload;
mod output;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use hotreload::{HotReloader, SourceLoader, DEFAULT_DEBOUNCE};
use output::{Format, Printer};
use vm::audio::SyntheticAudio;
use vm::{
    CapabilityTable, EventLoop, HeadlessPeripheral, InboundMessage, Peripheral, SandboxConfig,
    StatusBus, Supervisor, SwapRequest,
};

#[derive(Parser)]
#[command(name = "hotpatch-host")]
#[command(about = "Headless host that hot-swaps live-coded sketches", long_about = None)]
struct Cli {
    /// Sketch file to run and re-run on every save
    #[arg(long)]
    watch: Option<PathBuf>,

    /// Frames per second of the render loop
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Exit after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// JSON sandbox configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print status reports as JSON lines
    #[arg(long)]
    json: bool,

    /// Zero the clock on every file change
    #[arg(long)]
    soft_reset: bool,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,
}

fn load_config(path: &Path) -> Result<SandboxConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    SandboxConfig::from_json(&json).with_context(|| format!("invalid config {}", path.display()))
}

/// Stdin lines arrive on a channel; the render loop polls it between ticks
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn handle_line(supervisor: &Supervisor, line: &str) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    match InboundMessage::parse(line) {
        Ok(message) => {
            supervisor
                .submit(message.into())
                .context("failed to submit inbound revision")?;
        }
        Err(e) => log::warn!("ignoring inbound message: {}", e),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.fps == 0 {
        bail!("--fps must be at least 1");
    }
    let frame = Duration::from_secs_f64(1.0 / f64::from(cli.fps));
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SandboxConfig::default(),
    };

    let host = Rc::new(EventLoop::new());
    let bus = Rc::new(StatusBus::new());
    let canvas = Rc::new(HeadlessPeripheral::with_limits(
        cli.width,
        cli.height,
        bus.clone(),
        config.limits,
    ));
    host.attach_renderer(canvas.clone());

    let mut data_sources = CapabilityTable::new();
    for source in SyntheticAudio::sources(&host) {
        data_sources.register(source);
    }

    let printer = Printer::new(if cli.json { Format::Json } else { Format::Text });
    bus.subscribe(move |report| printer.print(report));

    let supervisor = Supervisor::new(config, host.clone(), canvas.clone(), data_sources, bus);
    supervisor.init();

    let mut watched = match &cli.watch {
        Some(path) => {
            let mut loader = SourceLoader::new(path);
            if let Some(code) = loader.load_if_changed()? {
                supervisor.submit(SwapRequest::run(code))?;
            }
            Some((HotReloader::new(path, DEFAULT_DEBOUNCE)?, loader))
        }
        None => None,
    };

    let inbound = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut frames = 0u64;

    loop {
        let started = Instant::now();

        while stdin_open {
            match inbound.try_recv() {
                Ok(line) => handle_line(&supervisor, &line)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => stdin_open = false,
            }
        }

        if let Some((reloader, loader)) = watched.as_mut() {
            if reloader.check_for_changes() {
                match loader.load_if_changed() {
                    Ok(Some(code)) => {
                        let request = if cli.soft_reset {
                            SwapRequest::soft_reset(code)
                        } else {
                            SwapRequest::run(code)
                        };
                        supervisor.submit(request)?;
                    }
                    Ok(None) => log::debug!("sketch saved without changes"),
                    Err(e) => log::warn!("{:#}", e),
                }
            }
        }

        host.tick(frame);
        frames += 1;

        match cli.frames {
            Some(limit) if frames >= limit => break,
            None if !stdin_open && watched.is_none() && !supervisor.has_pending_swap() => break,
            _ => {}
        }

        if let Some(remaining) = frame.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    supervisor.dispose();
    log::info!(
        "stopped after {} frames ({} swaps, {} rollbacks, {} frames rendered)",
        frames,
        supervisor.swap_count(),
        supervisor.rollback_count(),
        canvas.frame_count()
    );
    Ok(())
}
