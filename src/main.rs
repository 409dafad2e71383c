// SPDX-License-Identifier: MPL-2.0

//! `avif-play`: decode an AVIF and play it off-screen, optionally writing
//! every presented frame out as a PNG.

use std::{
    cell::RefCell,
    path::PathBuf,
    rc::Rc,
    time::{Duration, Instant},
};

use avif_playback::{
    AvifPlayer, Config, ImageSource, PlayerChannel, PlayerEvent, RenderTarget, SharedSurface,
    Surface, handler,
};
use calloop::{
    EventLoop,
    signals::{Signal, Signals},
};
use clap::{Parser, ValueEnum};
use eyre::WrapErr;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "avif-play", version, about = "Play an animated AVIF off-screen")]
struct Cli {
    /// AVIF file path, or a file:// or http(s):// URL
    input: String,

    /// Write every presented frame into this directory as PNG
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Loop playback
    #[arg(long = "loop")]
    looping: bool,

    /// Use the parallel pixel path
    #[arg(long)]
    webgl: bool,

    /// Refresh rate in Hz
    #[arg(long)]
    refresh_rate: Option<u32>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<f64>,

    /// Options file to use instead of the one in the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Off-screen surface that optionally dumps each presented frame.
struct FrameDumpSurface {
    width: u32,
    height: u32,
    canvas: Vec<u8>,
    output: Option<PathBuf>,
    presented: usize,
    started: Instant,
}

impl FrameDumpSurface {
    fn new(output: Option<PathBuf>) -> Self {
        Self {
            width: 0,
            height: 0,
            canvas: Vec::new(),
            output,
            presented: 0,
            started: Instant::now(),
        }
    }

    fn write_png(&self, path: &std::path::Path) -> image::ImageResult<()> {
        // Canvas is little-endian XRGB8888: B, G, R, X.
        let image = image::RgbImage::from_fn(self.width, self.height, |x, y| {
            let offset = (y as usize * self.width as usize + x as usize) * 4;
            let px = &self.canvas[offset..offset + 4];
            image::Rgb([px[2], px[1], px[0]])
        });
        image.save(path)
    }
}

impl Surface for FrameDumpSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.canvas = vec![0; width as usize * height as usize * 4];
    }

    fn canvas_mut(&mut self) -> &mut [u8] {
        &mut self.canvas
    }

    fn present(&mut self, index: usize) {
        let at_ms = self.started.elapsed().as_millis();
        tracing::debug!(frame = index, at_ms, "present");

        if let Some(dir) = &self.output {
            let path = dir.join(format!("{:05}-frame{index:04}.png", self.presented));
            if let Err(err) = self.write_png(&path) {
                error!(path = %path.display(), error = %err, "failed to write frame");
            }
        }
        self.presented += 1;
    }
}

struct App {
    exit: bool,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Config file error, falling back to defaults");
            Config::default()
        }
    };

    let mut options = config.options;
    options.looping |= cli.looping;
    options.webgl |= cli.webgl;
    if let Some(rate) = cli.refresh_rate {
        options.refresh_rate = rate;
    }

    if let Some(dir) = &cli.output {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
    }

    let mut event_loop: EventLoop<App> = EventLoop::try_new()?;

    let surface = Rc::new(RefCell::new(FrameDumpSurface::new(cli.output.clone())));
    let shared: SharedSurface = surface.clone();
    let player = AvifPlayer::builder(ImageSource::Url(cli.input.clone()), RenderTarget::Surface(shared))
        .options(options)
        .build(&event_loop.handle())
        .wrap_err("invalid player arguments")?;

    let outcome: Rc<RefCell<Option<eyre::Result<()>>>> = Rc::new(RefCell::new(None));
    let finished = outcome.clone();
    player.events().on(
        PlayerChannel::Ended,
        handler(move |_: &PlayerEvent, _| *finished.borrow_mut() = Some(Ok(()))),
    );
    let failed = outcome.clone();
    player.events().on(
        PlayerChannel::Failed,
        handler(move |event: &PlayerEvent, _| {
            if let PlayerEvent::Failed(err) = event {
                *failed.borrow_mut() = Some(Err(eyre::Report::new(err.clone())));
            }
        }),
    );
    player.events().on(
        PlayerChannel::Ready,
        handler(|event: &PlayerEvent, _| {
            if let PlayerEvent::Ready { version } = event {
                info!(%version, "decoder ready");
            }
        }),
    );
    player.events().on(
        PlayerChannel::Resized,
        handler(|event: &PlayerEvent, _| {
            if let PlayerEvent::Resized { width, height } = event {
                info!(width, height, "image size");
            }
        }),
    );

    // Graceful shutdown on Ctrl-C and SIGTERM.
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    event_loop
        .handle()
        .insert_source(signals, |event, _, app: &mut App| {
            info!(signal = ?event.signal(), "stopping");
            app.exit = true;
        })
        .map_err(|err| err.error)?;

    player.play();

    let deadline = cli
        .duration
        .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
    let mut app = App { exit: false };
    loop {
        event_loop.dispatch(Some(Duration::from_millis(100)), &mut app)?;

        if app.exit || outcome.borrow().is_some() {
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("duration reached");
            break;
        }
    }

    let stats = player.scheduler().map(|scheduler| scheduler.stats());
    player.destroy();
    info!(
        presented = surface.borrow().presented,
        stats = ?stats,
        "done"
    );

    outcome.take().unwrap_or(Ok(()))
}
