// SPDX-License-Identifier: MPL-2.0

//! Frame-accurate playback of a progressively decoded frame buffer.
//!
//! The scheduler is ticked at the display refresh interval. Each tick adds
//! the wall-clock time since the previous tick to the time the current frame
//! has been on screen, then advances through as many frames as that time
//! covers. Only the last frame reached is painted; frames passed over on the
//! way are counted as skipped.
//!
//! When playback catches up with the decoder it stalls on the last decoded
//! frame without accumulating time, and resumes once the next frame lands.

use std::{
    cell::{Cell, Ref, RefCell},
    fmt,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use calloop::LoopHandle;
use tracing::{debug, info, trace};

use crate::{
    emitter::{ChannelEmitter, Message},
    error::UsageError,
    event_loop::run_every,
    render::Renderer,
    session::FrameBuffer,
};

/// Progress of a decode as seen by playback.
pub trait FrameSource {
    fn is_parsed(&self) -> bool;
    fn is_complete(&self) -> bool;
    fn has_failed(&self) -> bool;
    fn frames(&self) -> Ref<'_, FrameBuffer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// Playback statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Frames painted onto the surface.
    pub frames_rendered: u64,
    /// Frames passed over without being painted to keep up with the clock.
    pub frames_skipped: u64,
    /// Times playback caught up with the decoder.
    pub underruns: u64,
    /// Completed passes through the sequence.
    pub loops: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    FrameRendered { index: usize },
    /// Playback is waiting for frame `index` to be decoded.
    Underrun { index: usize },
    Looped { count: u64 },
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackChannel {
    StateChanged,
    FrameRendered,
    Underrun,
    Looped,
    Ended,
}

impl Message for PlaybackEvent {
    type Channel = PlaybackChannel;

    fn channel(&self) -> PlaybackChannel {
        match self {
            PlaybackEvent::StateChanged(_) => PlaybackChannel::StateChanged,
            PlaybackEvent::FrameRendered { .. } => PlaybackChannel::FrameRendered,
            PlaybackEvent::Underrun { .. } => PlaybackChannel::Underrun,
            PlaybackEvent::Looped { .. } => PlaybackChannel::Looped,
            PlaybackEvent::Ended => PlaybackChannel::Ended,
        }
    }
}

#[derive(Debug, Default)]
struct Cursor {
    index: usize,
    /// Time the current frame has been on screen.
    elapsed: Duration,
    /// Whether the frame at `index` has been painted.
    shown: bool,
    last_tick: Option<Instant>,
    stalled: bool,
    /// A non-looping sequence ran to completion.
    ended: bool,
}

struct SchedulerInner<D: 'static> {
    handle: LoopHandle<'static, D>,
    source: Rc<dyn FrameSource>,
    renderer: Renderer,
    looping: bool,
    interval: Duration,
    state: Cell<PlaybackState>,
    cursor: RefCell<Cursor>,
    stats: Cell<PlaybackStats>,
    /// Bumped whenever the running tick timer must stop.
    generation: Cell<u64>,
    events: ChannelEmitter<PlaybackEvent>,
}

/// Drives frame presentation from a [`FrameSource`]. Cheap to clone.
pub struct PlaybackScheduler<D: 'static> {
    inner: Rc<SchedulerInner<D>>,
}

impl<D: 'static> Clone for PlaybackScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: 'static> PlaybackScheduler<D> {
    /// `interval` is the refresh period the scheduler ticks at while playing.
    pub fn new(
        handle: &LoopHandle<'static, D>,
        source: Rc<dyn FrameSource>,
        renderer: Renderer,
        looping: bool,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                handle: handle.clone(),
                source,
                renderer,
                looping,
                interval,
                state: Cell::new(PlaybackState::Stopped),
                cursor: RefCell::new(Cursor::default()),
                stats: Cell::new(PlaybackStats::default()),
                generation: Cell::new(0),
                events: ChannelEmitter::new(),
            }),
        }
    }

    pub fn play(&self) -> Result<(), UsageError> {
        self.play_at(Instant::now())
    }

    /// Start or resume playback as of `now`.
    ///
    /// Resuming keeps the current frame and the time it was already shown.
    /// Starting after a non-looping sequence ended restarts from frame 0.
    pub fn play_at(&self, now: Instant) -> Result<(), UsageError> {
        self.inner.play_at(now)
    }

    pub fn pause(&self) {
        self.pause_at(Instant::now());
    }

    /// Freeze playback as of `now`. Time up to `now` still counts towards
    /// the current frame. Ignored unless playing.
    pub fn pause_at(&self, now: Instant) {
        self.inner.pause_at(now);
    }

    /// Stop and rewind to frame 0.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Advance playback to `now`. Returns whether playback is still running.
    ///
    /// Normally called by the scheduler's own refresh timer; hosts with a
    /// real vsync signal may call it from their frame callback instead.
    pub fn tick_at(&self, now: Instant) -> bool {
        self.inner.tick_at(now)
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state.get()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Index of the frame currently on screen (or about to be).
    pub fn current_frame(&self) -> usize {
        self.inner.cursor.borrow().index
    }

    pub fn stats(&self) -> PlaybackStats {
        self.inner.stats.get()
    }

    pub fn events(&self) -> &ChannelEmitter<PlaybackEvent> {
        &self.inner.events
    }

    pub fn renderer(&self) -> &Renderer {
        &self.inner.renderer
    }
}

impl<D: 'static> fmt::Debug for PlaybackScheduler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("state", &self.inner.state.get())
            .field("cursor", &*self.inner.cursor.borrow())
            .field("stats", &self.inner.stats.get())
            .finish()
    }
}

impl<D: 'static> SchedulerInner<D> {
    fn play_at(self: &Rc<Self>, now: Instant) -> Result<(), UsageError> {
        if self.source.has_failed() {
            return Err(UsageError::DecodeFailed);
        }
        if !self.source.is_parsed() {
            return Err(UsageError::NotParsed);
        }

        match self.state.get() {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Paused => {
                debug!(frame = self.cursor.borrow().index, "resuming playback");
            }
            PlaybackState::Stopped => {
                let mut cursor = self.cursor.borrow_mut();
                if cursor.ended {
                    *cursor = Cursor::default();
                }
                debug!(frame = cursor.index, "starting playback");
            }
        }
        self.cursor.borrow_mut().last_tick = Some(now);

        self.set_state(PlaybackState::Playing);
        self.start_timer();
        self.tick_at(now);
        Ok(())
    }

    fn pause_at(self: &Rc<Self>, now: Instant) {
        if self.state.get() != PlaybackState::Playing {
            return;
        }
        self.tick_at(now);
        // The tick may have ended a non-looping sequence.
        if self.state.get() != PlaybackState::Playing {
            return;
        }

        self.stop_timer();
        self.cursor.borrow_mut().last_tick = None;
        debug!(frame = self.cursor.borrow().index, "playback paused");
        self.set_state(PlaybackState::Paused);
    }

    fn stop(&self) {
        self.stop_timer();
        *self.cursor.borrow_mut() = Cursor::default();
        if self.state.get() != PlaybackState::Stopped {
            self.set_state(PlaybackState::Stopped);
        }
    }

    fn start_timer(self: &Rc<Self>) {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let weak: Weak<Self> = Rc::downgrade(self);
        run_every(&self.handle, self.interval, move || {
            weak.upgrade().is_some_and(|inner| {
                inner.generation.get() == generation && inner.tick_at(Instant::now())
            })
        });
    }

    fn stop_timer(&self) {
        self.generation.set(self.generation.get() + 1);
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.set(state);
        self.events.emit(&PlaybackEvent::StateChanged(state), None);
    }

    fn tick_at(&self, now: Instant) -> bool {
        if self.state.get() != PlaybackState::Playing {
            return false;
        }
        if self.source.has_failed() {
            debug!("decode failed, stopping playback");
            self.stop_timer();
            self.set_state(PlaybackState::Stopped);
            return false;
        }

        let mut events = Vec::new();
        let mut stats = self.stats.get();
        let mut ended = false;
        {
            let frames = self.source.frames();
            let complete = self.source.is_complete();
            let mut cursor = self.cursor.borrow_mut();

            let delta = cursor
                .last_tick
                .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
            cursor.last_tick = Some(now);

            if frames.is_empty() {
                trace!("waiting for first frame");
                return true;
            }

            let mut paint = !cursor.shown;
            if cursor.shown {
                cursor.elapsed += delta;
            }

            let mut advanced = 0u64;
            while let Some(frame) = frames.get(cursor.index) {
                if cursor.elapsed < frame.duration {
                    break;
                }

                let next = cursor.index + 1;
                if next < frames.len() {
                    cursor.elapsed -= frame.duration;
                    cursor.index = next;
                    cursor.stalled = false;
                    advanced += 1;
                } else if !complete {
                    // Hold the last decoded frame without accumulating time.
                    cursor.elapsed = frame.duration;
                    if !cursor.stalled {
                        cursor.stalled = true;
                        stats.underruns += 1;
                        debug!(waiting_for = next, "playback underrun");
                        events.push(PlaybackEvent::Underrun { index: next });
                    }
                    break;
                } else if self.looping {
                    cursor.elapsed -= frame.duration;
                    cursor.index = 0;
                    advanced += 1;
                    stats.loops += 1;
                    events.push(PlaybackEvent::Looped { count: stats.loops });

                    // Skip whole passes after a long gap between ticks.
                    let total = frames.total_duration();
                    if !total.is_zero() && cursor.elapsed >= total {
                        let rest = cursor.elapsed.as_nanos() % total.as_nanos();
                        cursor.elapsed = Duration::from_nanos(rest as u64);
                    }
                } else {
                    ended = true;
                    cursor.ended = true;
                    break;
                }
            }

            if advanced > 0 {
                paint = true;
                stats.frames_skipped += advanced - 1;
            }

            // The final frame of an ended sequence is still shown.
            if paint {
                if let Some(frame) = frames.get(cursor.index) {
                    cursor.shown = true;
                    self.renderer.render(frame);
                    stats.frames_rendered += 1;
                    trace!(frame = cursor.index, "frame rendered");
                    events.push(PlaybackEvent::FrameRendered {
                        index: cursor.index,
                    });
                }
            }
        }
        self.stats.set(stats);

        if ended {
            self.stop_timer();
            info!(
                rendered = stats.frames_rendered,
                skipped = stats.frames_skipped,
                "playback ended"
            );
            self.state.set(PlaybackState::Stopped);
            events.push(PlaybackEvent::StateChanged(PlaybackState::Stopped));
            events.push(PlaybackEvent::Ended);
        }

        for event in &events {
            self.events.emit(event, None);
        }
        !ended && self.state.get() == PlaybackState::Playing
    }
}

#[cfg(test)]
mod tests {
    use calloop::EventLoop;
    use image::RgbaImage;

    use super::*;
    use crate::{
        emitter::handler,
        render::{MemorySurface, SharedSurface, Surface, sink_for},
        session::FrameRecord,
    };

    #[derive(Default)]
    struct FakeSource {
        parsed: Cell<bool>,
        complete: Cell<bool>,
        failed: Cell<bool>,
        frames: RefCell<FrameBuffer>,
    }

    impl FakeSource {
        fn push(&self, millis: u64) {
            let mut frames = self.frames.borrow_mut();
            let index = frames.len();
            frames
                .push(FrameRecord {
                    index,
                    duration: Duration::from_millis(millis),
                    image: RgbaImage::new(1, 1),
                })
                .unwrap();
        }
    }

    impl FrameSource for FakeSource {
        fn is_parsed(&self) -> bool {
            self.parsed.get()
        }

        fn is_complete(&self) -> bool {
            self.complete.get()
        }

        fn has_failed(&self) -> bool {
            self.failed.get()
        }

        fn frames(&self) -> Ref<'_, FrameBuffer> {
            self.frames.borrow()
        }
    }

    struct Harness {
        _event_loop: EventLoop<'static, ()>,
        source: Rc<FakeSource>,
        surface: Rc<RefCell<MemorySurface>>,
        scheduler: PlaybackScheduler<()>,
        start: Instant,
    }

    impl Harness {
        fn new(durations: &[u64], complete: bool, looping: bool) -> Self {
            let event_loop = EventLoop::<()>::try_new().unwrap();
            let source = Rc::new(FakeSource::default());
            source.parsed.set(true);
            source.complete.set(complete);
            for millis in durations {
                source.push(*millis);
            }

            let surface = Rc::new(RefCell::new(MemorySurface::new()));
            surface.borrow_mut().resize(1, 1);
            let shared: SharedSurface = surface.clone();
            let scheduler = PlaybackScheduler::new(
                &event_loop.handle(),
                source.clone(),
                Renderer::new(sink_for(false), shared),
                looping,
                Duration::from_millis(16),
            );

            Self {
                _event_loop: event_loop,
                source,
                surface,
                scheduler,
                start: Instant::now(),
            }
        }

        fn at(&self, millis: u64) -> Instant {
            self.start + Duration::from_millis(millis)
        }

        fn tick(&self, millis: u64) -> bool {
            self.scheduler.tick_at(self.at(millis))
        }

        fn presented(&self) -> Vec<usize> {
            self.surface.borrow().presented().to_vec()
        }
    }

    #[test]
    fn play_requires_parsed_source() {
        let harness = Harness::new(&[], false, false);
        harness.source.parsed.set(false);
        assert_eq!(harness.scheduler.play(), Err(UsageError::NotParsed));

        harness.source.failed.set(true);
        assert_eq!(harness.scheduler.play(), Err(UsageError::DecodeFailed));
        assert_eq!(harness.scheduler.state(), PlaybackState::Stopped);
    }

    #[test]
    fn frames_follow_their_durations() {
        let harness = Harness::new(&[100, 100, 100], true, false);
        harness.scheduler.play_at(harness.at(0)).unwrap();
        assert_eq!(harness.presented(), vec![0]);

        harness.tick(50);
        harness.tick(99);
        assert_eq!(harness.presented(), vec![0]);

        harness.tick(100);
        assert_eq!(harness.presented(), vec![0, 1]);

        harness.tick(216);
        assert_eq!(harness.presented(), vec![0, 1, 2]);
        assert_eq!(harness.scheduler.stats().frames_skipped, 0);
    }

    #[test]
    fn uniform_sequence_renders_on_schedule() {
        let harness = Harness::new(&[100; 10], true, false);
        harness.scheduler.play_at(harness.at(0)).unwrap();

        let mut rendered_at = vec![0];
        let mut now = 0;
        while harness.scheduler.is_playing() {
            now += 4;
            let before = harness.presented().len();
            harness.tick(now);
            if harness.presented().len() > before {
                rendered_at.push(now);
            }
        }

        assert_eq!(rendered_at, (0..10).map(|n| n * 100).collect::<Vec<u64>>());
        assert_eq!(harness.presented(), (0..10).collect::<Vec<usize>>());
        assert_eq!(now, 1000);
    }

    #[test]
    fn late_tick_skips_intermediate_frames() {
        let harness = Harness::new(&[100, 100, 100, 100], true, false);
        harness.scheduler.play_at(harness.at(0)).unwrap();

        harness.tick(250);
        assert_eq!(harness.presented(), vec![0, 2]);
        assert_eq!(harness.scheduler.current_frame(), 2);
        assert_eq!(harness.scheduler.stats().frames_skipped, 1);

        // 50ms carried over from the late tick.
        harness.tick(299);
        assert_eq!(harness.presented(), vec![0, 2]);
        harness.tick(300);
        assert_eq!(harness.presented(), vec![0, 2, 3]);
    }

    #[test]
    fn non_looping_sequence_stops_after_last_frame() {
        let harness = Harness::new(&[100, 100], true, false);
        let ended = Rc::new(Cell::new(false));
        let flag = ended.clone();
        harness.scheduler.events().on(
            PlaybackChannel::Ended,
            handler(move |_: &PlaybackEvent, _| flag.set(true)),
        );

        harness.scheduler.play_at(harness.at(0)).unwrap();
        assert!(harness.tick(100));
        assert!(harness.tick(150));
        assert!(!harness.tick(200));

        assert!(ended.get());
        assert_eq!(harness.scheduler.state(), PlaybackState::Stopped);
        assert_eq!(harness.presented(), vec![0, 1]);

        // Playing again restarts from the first frame.
        harness.scheduler.play_at(harness.at(500)).unwrap();
        assert_eq!(harness.presented(), vec![0, 1, 0]);
    }

    #[test]
    fn looping_wraps_to_first_frame() {
        let harness = Harness::new(&[100, 100, 100], true, true);
        harness.scheduler.play_at(harness.at(0)).unwrap();

        harness.tick(100);
        harness.tick(200);
        harness.tick(300);
        harness.tick(400);

        assert_eq!(harness.presented(), vec![0, 1, 2, 0, 1]);
        assert_eq!(harness.scheduler.stats().loops, 1);
        assert!(harness.scheduler.is_playing());
    }

    #[test]
    fn long_gap_while_looping_keeps_phase() {
        let harness = Harness::new(&[100, 100, 100], true, true);
        harness.scheduler.play_at(harness.at(0)).unwrap();

        // 10 full passes plus 150ms: frame 1, 50ms in.
        harness.tick(3150);
        assert_eq!(harness.scheduler.current_frame(), 1);
        harness.tick(3199);
        assert_eq!(harness.scheduler.current_frame(), 1);
        harness.tick(3200);
        assert_eq!(harness.scheduler.current_frame(), 2);
    }

    #[test]
    fn underrun_stalls_on_last_decoded_frame() {
        let harness = Harness::new(&[100, 100], false, true);
        let underruns = Rc::new(RefCell::new(Vec::new()));
        let sink = underruns.clone();
        harness.scheduler.events().on(
            PlaybackChannel::Underrun,
            handler(move |event: &PlaybackEvent, _| sink.borrow_mut().push(event.clone())),
        );

        harness.scheduler.play_at(harness.at(0)).unwrap();
        harness.tick(100);
        harness.tick(400);
        harness.tick(900);
        assert_eq!(harness.presented(), vec![0, 1]);
        assert_eq!(*underruns.borrow(), vec![PlaybackEvent::Underrun { index: 2 }]);
        assert_eq!(harness.scheduler.stats().underruns, 1);

        // The stall held frame 1 at exactly its duration.
        harness.source.push(100);
        harness.tick(901);
        assert_eq!(harness.presented(), vec![0, 1, 2]);
        harness.tick(1000);
        assert_eq!(harness.presented(), vec![0, 1, 2]);
    }

    #[test]
    fn waits_for_first_frame() {
        let harness = Harness::new(&[], false, false);
        harness.scheduler.play_at(harness.at(0)).unwrap();
        assert!(harness.presented().is_empty());

        harness.source.push(100);
        harness.tick(500);
        assert_eq!(harness.presented(), vec![0]);
        harness.tick(599);
        assert_eq!(harness.presented(), vec![0]);
    }

    #[test]
    fn pause_preserves_position_and_elapsed_time() {
        let harness = Harness::new(&[100; 8], true, false);
        harness.scheduler.play_at(harness.at(0)).unwrap();

        harness.tick(400);
        harness.scheduler.pause_at(harness.at(440));
        assert_eq!(harness.scheduler.state(), PlaybackState::Paused);
        assert_eq!(harness.scheduler.current_frame(), 4);

        // Ticks while paused do nothing.
        assert!(!harness.tick(700));
        harness.scheduler.pause_at(harness.at(800));
        assert_eq!(harness.scheduler.state(), PlaybackState::Paused);

        harness.scheduler.play_at(harness.at(940)).unwrap();
        assert_eq!(harness.scheduler.current_frame(), 4);
        harness.tick(999);
        assert_eq!(harness.scheduler.current_frame(), 4);
        harness.tick(1000);
        assert_eq!(harness.scheduler.current_frame(), 5);
    }

    #[test]
    fn zero_duration_frames_still_advance_on_a_clock() {
        let harness = Harness::new(&[0, 0], true, true);
        harness.scheduler.play_at(harness.at(0)).unwrap();

        assert!(harness.tick(250));
        assert_eq!(harness.scheduler.current_frame(), 0);
        assert!(harness.scheduler.is_playing());
    }

    #[test]
    fn stop_rewinds() {
        let harness = Harness::new(&[100, 100], true, true);
        harness.scheduler.play_at(harness.at(0)).unwrap();
        harness.tick(100);
        harness.scheduler.stop();

        assert_eq!(harness.scheduler.state(), PlaybackState::Stopped);
        assert_eq!(harness.scheduler.current_frame(), 0);
    }
}
