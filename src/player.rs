// SPDX-License-Identifier: MPL-2.0

//! Top-level controller tying input, decode session, playback and surface
//! together.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use avif_playback_config::PlayerOptions;
use calloop::LoopHandle;
use tracing::{debug, error, info, warn};

use crate::{
    emitter::{ChannelEmitter, Message, handler},
    error::{ConfigurationError, FetchError, PipelineError},
    identity::ResourceIdentity,
    native::{DecoderFactory, default_factory},
    playback::{FrameSource, PlaybackChannel, PlaybackEvent, PlaybackScheduler, PlaybackState},
    render::{Renderer, SharedSurface, SurfaceRegistry, sink_for},
    session::{DecodeSession, SessionChannel, SessionEvent},
    source::{ImageSource, RenderTarget, spawn_fetch},
};

/// What a host application hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The decoder is up.
    Ready { version: String },
    /// The surface took on the image's dimensions.
    Resized { width: u32, height: u32 },
    FrameRendered { index: usize },
    /// A non-looping sequence finished.
    Ended,
    Failed(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerChannel {
    Ready,
    Resized,
    FrameRendered,
    Ended,
    Failed,
}

impl Message for PlayerEvent {
    type Channel = PlayerChannel;

    fn channel(&self) -> PlayerChannel {
        match self {
            PlayerEvent::Ready { .. } => PlayerChannel::Ready,
            PlayerEvent::Resized { .. } => PlayerChannel::Resized,
            PlayerEvent::FrameRendered { .. } => PlayerChannel::FrameRendered,
            PlayerEvent::Ended => PlayerChannel::Ended,
            PlayerEvent::Failed(_) => PlayerChannel::Failed,
        }
    }
}

pub struct AvifPlayerBuilder<'a> {
    input: ImageSource,
    target: RenderTarget,
    options: PlayerOptions,
    surfaces: Option<&'a SurfaceRegistry>,
    factory: Option<DecoderFactory>,
}

impl<'a> AvifPlayerBuilder<'a> {
    #[must_use]
    pub fn options(mut self, options: PlayerOptions) -> Self {
        self.options = options;
        self
    }

    /// Registry used to resolve [`RenderTarget::Id`].
    #[must_use]
    pub fn surfaces(mut self, registry: &'a SurfaceRegistry) -> Self {
        self.surfaces = Some(registry);
        self
    }

    /// Use a custom native decoder instead of libavif.
    #[must_use]
    pub fn decoder(mut self, factory: DecoderFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Validate the arguments and start the pipeline on `handle`'s loop.
    ///
    /// Only argument problems are reported here. Everything after, including
    /// fetch and decode failures, arrives as [`PlayerEvent::Failed`].
    pub fn build<D: 'static>(
        self,
        handle: &LoopHandle<'static, D>,
    ) -> Result<AvifPlayer<D>, ConfigurationError> {
        self.input.validate()?;
        let surface = self.target.resolve(self.surfaces)?;
        let factory = self
            .factory
            .or_else(default_factory)
            .ok_or(ConfigurationError::NoDecoder)?;

        let inner = Rc::new(PlayerInner {
            handle: handle.clone(),
            options: self.options,
            factory,
            surface,
            pipeline: RefCell::new(None),
            events: ChannelEmitter::new(),
            generation: Cell::new(0),
            destroyed: Cell::new(false),
        });
        inner.install(self.input)?;

        Ok(AvifPlayer { inner })
    }
}

/// Everything that belongs to one input.
struct Pipeline<D: 'static> {
    identity: ResourceIdentity,
    session: DecodeSession<D>,
    scheduler: PlaybackScheduler<D>,
    /// Taken when decoding starts.
    input: Option<ImageSource>,
    play_requested: bool,
    surface_sized: bool,
}

struct PlayerInner<D: 'static> {
    handle: LoopHandle<'static, D>,
    options: PlayerOptions,
    factory: DecoderFactory,
    surface: SharedSurface,
    pipeline: RefCell<Option<Pipeline<D>>>,
    events: ChannelEmitter<PlayerEvent>,
    /// Distinguishes callbacks of the current pipeline from stale ones.
    generation: Cell<u64>,
    destroyed: Cell<bool>,
}

/// Plays one animated (or still) AVIF onto a surface.
///
/// ```no_run
/// # use avif_playback::{AvifPlayer, MemorySurface, RenderTarget, SharedSurface};
/// # use std::{cell::RefCell, rc::Rc};
/// let mut event_loop = calloop::EventLoop::<()>::try_new()?;
/// let surface: SharedSurface = Rc::new(RefCell::new(MemorySurface::new()));
/// let player = AvifPlayer::builder("clip.avif", RenderTarget::Surface(surface))
///     .build(&event_loop.handle())?;
/// player.play();
/// event_loop.run(None, &mut (), |_| {})?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct AvifPlayer<D: 'static> {
    inner: Rc<PlayerInner<D>>,
}

impl AvifPlayer<()> {
    pub fn builder<'a>(
        input: impl Into<ImageSource>,
        target: impl Into<RenderTarget>,
    ) -> AvifPlayerBuilder<'a> {
        AvifPlayerBuilder {
            input: input.into(),
            target: target.into(),
            options: PlayerOptions::default(),
            surfaces: None,
            factory: None,
        }
    }
}

impl<D: 'static> AvifPlayer<D> {
    /// Start playback, decoding first if needed. Resumes when paused.
    pub fn play(&self) {
        self.inner.play();
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Replace the input. The current session is torn down and a new one
    /// starts according to the player's options.
    pub fn load(&self, input: impl Into<ImageSource>) -> Result<(), ConfigurationError> {
        let input = input.into();
        input.validate()?;
        self.inner.teardown();
        self.inner.install(input)
    }

    /// Release the worker and every registration. Idempotent; the player is
    /// inert afterwards.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn events(&self) -> &ChannelEmitter<PlayerEvent> {
        &self.inner.events
    }

    pub fn options(&self) -> &PlayerOptions {
        &self.inner.options
    }

    pub fn surface(&self) -> &SharedSurface {
        &self.inner.surface
    }

    pub fn session(&self) -> Option<DecodeSession<D>> {
        self.inner.with_pipeline(|pipeline| pipeline.session.clone())
    }

    pub fn scheduler(&self) -> Option<PlaybackScheduler<D>> {
        self.inner.with_pipeline(|pipeline| pipeline.scheduler.clone())
    }

    pub fn identity(&self) -> Option<ResourceIdentity> {
        self.inner.with_pipeline(|pipeline| pipeline.identity)
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.scheduler()
            .map_or(PlaybackState::Stopped, |scheduler| scheduler.state())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }
}

impl<D: 'static> Drop for AvifPlayer<D> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<D: 'static> fmt::Debug for AvifPlayer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvifPlayer")
            .field("identity", &self.identity())
            .field("state", &self.playback_state())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<D: 'static> PlayerInner<D> {
    fn with_pipeline<T>(&self, f: impl FnOnce(&Pipeline<D>) -> T) -> Option<T> {
        self.pipeline.borrow().as_ref().map(f)
    }

    fn with_pipeline_mut<T>(&self, f: impl FnOnce(&mut Pipeline<D>) -> T) -> Option<T> {
        self.pipeline.borrow_mut().as_mut().map(f)
    }

    /// Build a session and scheduler for `input` and wire them up.
    fn install(self: &Rc<Self>, input: ImageSource) -> Result<(), ConfigurationError> {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let identity = ResourceIdentity::of(&input);
        let session = DecodeSession::new(
            &self.handle,
            identity,
            self.factory.clone(),
            self.options.response_timeout(),
        )?;
        let renderer = Renderer::new(sink_for(self.options.webgl), self.surface.clone());
        let scheduler = PlaybackScheduler::new(
            &self.handle,
            Rc::new(session.clone()),
            renderer,
            self.options.looping,
            self.options.tick_interval(),
        );

        info!(
            %identity,
            autoplay = self.options.autoplay,
            looping = self.options.looping,
            "player created"
        );
        self.bind(&session, &scheduler);
        *self.pipeline.borrow_mut() = Some(Pipeline {
            identity,
            session: session.clone(),
            scheduler,
            input: Some(input),
            play_requested: false,
            surface_sized: false,
        });

        if self.options.autoplay {
            let weak = Rc::downgrade(self);
            session.events().once(
                SessionChannel::Initialized,
                handler(move |_: &SessionEvent, _| {
                    if let Some(inner) = weak.upgrade() {
                        debug!("autoplay");
                        inner.play();
                    }
                }),
            );
        }
        if self.options.decode_immediately {
            self.ensure_decoding();
        }
        Ok(())
    }

    fn bind(self: &Rc<Self>, session: &DecodeSession<D>, scheduler: &PlaybackScheduler<D>) {
        let weak: Weak<Self> = Rc::downgrade(self);
        let on_session = handler(move |event: &SessionEvent, _| {
            if let Some(inner) = weak.upgrade() {
                inner.on_session_event(event);
            }
        });
        for channel in [
            SessionChannel::Initialized,
            SessionChannel::ParseComplete,
            SessionChannel::DecodeFailed,
        ] {
            session.events().on(channel, on_session.clone());
        }

        let weak: Weak<Self> = Rc::downgrade(self);
        let on_playback = handler(move |event: &PlaybackEvent, _| {
            if let Some(inner) = weak.upgrade() {
                match event {
                    PlaybackEvent::FrameRendered { index } => inner
                        .events
                        .emit(&PlayerEvent::FrameRendered { index: *index }, None),
                    PlaybackEvent::Ended => inner.events.emit(&PlayerEvent::Ended, None),
                    _ => 0,
                };
            }
        });
        for channel in [PlaybackChannel::FrameRendered, PlaybackChannel::Ended] {
            scheduler.events().on(channel, on_playback.clone());
        }
    }

    fn on_session_event(self: &Rc<Self>, event: &SessionEvent) {
        match event {
            SessionEvent::Initialized { version } => {
                self.events.emit(
                    &PlayerEvent::Ready {
                        version: version.clone(),
                    },
                    None,
                );
            }
            SessionEvent::ParseComplete(info) => {
                let resize = self
                    .with_pipeline_mut(|pipeline| !std::mem::replace(&mut pipeline.surface_sized, true))
                    .unwrap_or(false);
                if resize {
                    debug!(width = info.width, height = info.height, "sizing surface");
                    self.surface.borrow_mut().resize(info.width, info.height);
                    self.events.emit(
                        &PlayerEvent::Resized {
                            width: info.width,
                            height: info.height,
                        },
                        None,
                    );
                }

                let requested = self
                    .with_pipeline(|pipeline| pipeline.play_requested)
                    .unwrap_or(false);
                if requested {
                    self.start_playback();
                }
            }
            SessionEvent::DecodeFailed(error) => self.fail(error.clone()),
            SessionEvent::FrameDecoded { .. } | SessionEvent::DecodeComplete { .. } => {}
        }
    }

    fn play(self: &Rc<Self>) {
        if self.destroyed.get() {
            warn!("play on destroyed player ignored");
            return;
        }
        let Some((session, scheduler)) = self.with_pipeline(|pipeline| {
            (pipeline.session.clone(), pipeline.scheduler.clone())
        }) else {
            return;
        };

        match scheduler.state() {
            PlaybackState::Playing => {}
            PlaybackState::Paused => self.start_playback(),
            PlaybackState::Stopped => {
                if session.has_failed() {
                    warn!("play after decode failure ignored");
                    return;
                }
                self.with_pipeline_mut(|pipeline| pipeline.play_requested = true);
                self.ensure_decoding();
                if session.is_parsed() {
                    self.start_playback();
                }
            }
        }
    }

    fn pause(&self) {
        let scheduler = self.with_pipeline_mut(|pipeline| {
            pipeline.play_requested = false;
            pipeline.scheduler.clone()
        });
        if let Some(scheduler) = scheduler {
            scheduler.pause();
        }
    }

    fn start_playback(&self) {
        let scheduler = self.with_pipeline_mut(|pipeline| {
            pipeline.play_requested = false;
            pipeline.scheduler.clone()
        });
        if let Some(Err(err)) = scheduler.map(|scheduler| scheduler.play()) {
            warn!(error = %err, "playback could not start");
        }
    }

    /// Start fetching and decoding the input unless already under way.
    fn ensure_decoding(self: &Rc<Self>) {
        let Some(input) = self.with_pipeline_mut(|pipeline| pipeline.input.take()).flatten() else {
            return;
        };

        match input {
            ImageSource::Bytes(bytes) => self.start_decode(bytes),
            ImageSource::Url(url) => {
                let weak = Rc::downgrade(self);
                let generation = self.generation.get();
                let spawned = spawn_fetch(&self.handle, url, move |result| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if inner.generation.get() != generation || inner.destroyed.get() {
                        debug!("discarding fetch for replaced input");
                        return;
                    }
                    match result {
                        Ok(bytes) => inner.start_decode(bytes),
                        Err(err) => inner.fail(err.into()),
                    }
                });
                if let Err(err) = spawned {
                    self.fetch_not_started(&err);
                }
            }
        }
    }

    fn fetch_not_started(&self, err: &calloop::Error) {
        self.fail(FetchError::Spawn(err.to_string()).into());
    }

    fn start_decode(&self, bytes: Vec<u8>) {
        let Some(session) = self.with_pipeline(|pipeline| pipeline.session.clone()) else {
            return;
        };
        let mut decode = session.decoder(bytes);
        // Rejections settle immediately without a session event.
        if let Some(Err(err)) = decode.try_outcome() {
            self.fail(err);
        }
    }

    fn fail(&self, error: PipelineError) {
        error!(%error, "player failed");
        let scheduler = self.with_pipeline_mut(|pipeline| {
            pipeline.play_requested = false;
            pipeline.scheduler.clone()
        });
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
        self.events.emit(&PlayerEvent::Failed(error), None);
    }

    fn teardown(&self) {
        let pipeline = self.pipeline.borrow_mut().take();
        if let Some(pipeline) = pipeline {
            debug!(identity = %pipeline.identity, "tearing down pipeline");
            pipeline.scheduler.stop();
            pipeline.session.destroy();
        }
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.teardown();
        self.events.clear();
        debug!("player destroyed");
    }
}
