// SPDX-License-Identifier: MPL-2.0

//! Decode session: drives one worker through parse and frame decode for a
//! single input, buffering frames as they arrive.
//!
//! State only ever moves forward:
//!
//! ```text
//! created ─▶ initialized ─▶ parse complete ─▶ image complete
//!                │                 │
//!                └──────┬──────────┘
//!                       ▼
//!                    failed
//! ```

use std::{
    cell::{Cell, Ref, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use calloop::{LoopHandle, RegistrationToken};
use futures_channel::oneshot;
use image::RgbaImage;
use tracing::{debug, error, info, trace, warn};

use crate::{
    emitter::{ChannelEmitter, Message, handler},
    error::{DecodeFailure, PipelineError, TransportError, UsageError},
    event_loop::{remove_source_later, run_after},
    identity::ResourceIdentity,
    native::{DecoderFactory, ImageInfo, normalize_duration},
    playback::FrameSource,
    transfer::Transfer,
    worker::{WorkerChannel, WorkerEvent, WorkerLink, WorkerRequest},
};

/// A decoded frame paired with its display duration.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub index: usize,
    pub duration: Duration,
    pub image: RgbaImage,
}

/// Append-only, index-ordered frame storage.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: Vec<FrameRecord>,
    expected: Option<usize>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame count announced by the header. The count comes from
    /// the file and is not used to size storage.
    pub fn expect(&mut self, frame_count: usize) {
        self.expected = Some(frame_count);
    }

    /// Lower the expected count to the frames already buffered, for a
    /// stream that ended early.
    pub fn close(&mut self) {
        self.expected = Some(self.frames.len());
    }

    /// Append the next frame. Frames must arrive in index order and never
    /// exceed the announced count. The duration is normalized on the way in.
    pub fn push(&mut self, mut record: FrameRecord) -> Result<(), TransportError> {
        if record.index != self.frames.len() {
            return Err(TransportError::Protocol(format!(
                "frame {} arrived, expected frame {}",
                record.index,
                self.frames.len()
            )));
        }
        if self.expected.is_some_and(|expected| record.index >= expected) {
            return Err(TransportError::Protocol(format!(
                "frame {} exceeds announced frame count",
                record.index
            )));
        }
        record.duration = normalize_duration(record.duration);
        self.frames.push(record);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&FrameRecord> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.frames.iter()
    }

    /// Sum of the durations of the frames decoded so far.
    pub fn total_duration(&self) -> Duration {
        self.frames.iter().map(|frame| frame.duration).sum()
    }
}

/// Snapshot of a session's progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeState {
    pub initialized: bool,
    pub parse_complete: bool,
    pub image_complete: bool,
    pub version: Option<String>,
    pub info: Option<ImageInfo>,
    pub failure: Option<PipelineError>,
    pub destroyed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Initialized { version: String },
    ParseComplete(ImageInfo),
    FrameDecoded { index: usize, duration: Duration },
    DecodeComplete { frames: usize },
    DecodeFailed(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionChannel {
    Initialized,
    ParseComplete,
    FrameDecoded,
    DecodeComplete,
    DecodeFailed,
}

impl Message for SessionEvent {
    type Channel = SessionChannel;

    fn channel(&self) -> SessionChannel {
        match self {
            SessionEvent::Initialized { .. } => SessionChannel::Initialized,
            SessionEvent::ParseComplete(_) => SessionChannel::ParseComplete,
            SessionEvent::FrameDecoded { .. } => SessionChannel::FrameDecoded,
            SessionEvent::DecodeComplete { .. } => SessionChannel::DecodeComplete,
            SessionEvent::DecodeFailed(_) => SessionChannel::DecodeFailed,
        }
    }
}

type Outcome = Result<(), PipelineError>;

/// Settles once every frame has been decoded, or with the failure that
/// stopped decoding.
pub struct DecodeFuture {
    state: FutureState,
}

enum FutureState {
    Settled(Option<Outcome>),
    Waiting(oneshot::Receiver<Outcome>),
}

impl DecodeFuture {
    fn settled(outcome: Outcome) -> Self {
        Self {
            state: FutureState::Settled(Some(outcome)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Outcome>) -> Self {
        Self {
            state: FutureState::Waiting(receiver),
        }
    }

    /// The outcome if it is already known, without blocking. Returns the
    /// outcome at most once.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match &mut self.state {
            FutureState::Settled(outcome) => outcome.take(),
            FutureState::Waiting(receiver) => match receiver.try_recv() {
                Ok(Some(outcome)) => {
                    self.state = FutureState::Settled(None);
                    Some(outcome)
                }
                Ok(None) => None,
                Err(oneshot::Canceled) => {
                    self.state = FutureState::Settled(None);
                    Some(Err(TransportError::Terminated.into()))
                }
            },
        }
    }
}

impl Future for DecodeFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        match &mut self.state {
            FutureState::Settled(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(TransportError::Terminated.into())))
            }
            FutureState::Waiting(receiver) => Pin::new(receiver).poll(cx).map(|outcome| {
                outcome.unwrap_or_else(|oneshot::Canceled| Err(TransportError::Terminated.into()))
            }),
        }
    }
}

impl fmt::Debug for DecodeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            FutureState::Settled(outcome) => f.debug_tuple("Settled").field(outcome).finish(),
            FutureState::Waiting(_) => f.write_str("Waiting"),
        }
    }
}

/// The outstanding decode request.
struct Pending {
    id: u64,
    /// Held back until the worker reports readiness.
    queued: Option<Vec<u8>>,
    settle: Option<oneshot::Sender<Outcome>>,
    timeout: Option<RegistrationToken>,
}

struct SessionInner<D: 'static> {
    handle: LoopHandle<'static, D>,
    link: WorkerLink<D>,
    identity: ResourceIdentity,
    response_timeout: Duration,
    state: RefCell<DecodeState>,
    frames: RefCell<FrameBuffer>,
    pending: RefCell<Option<Pending>>,
    decode_requested: Cell<bool>,
    next_request: Cell<u64>,
    events: ChannelEmitter<SessionEvent>,
}

/// One input's trip through the decode worker. Cheap to clone; clones share
/// the same session.
pub struct DecodeSession<D: 'static> {
    inner: Rc<SessionInner<D>>,
}

impl<D: 'static> Clone for DecodeSession<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: 'static> DecodeSession<D> {
    /// Spawn a worker for `identity` and start listening to it.
    ///
    /// A worker that stays silent for `response_timeout` while a decode is
    /// outstanding fails the session.
    pub fn new(
        handle: &LoopHandle<'static, D>,
        identity: ResourceIdentity,
        factory: DecoderFactory,
        response_timeout: Duration,
    ) -> Result<Self, calloop::Error> {
        let link = WorkerLink::spawn(handle, factory)?;
        let inner = Rc::new(SessionInner {
            handle: handle.clone(),
            link,
            identity,
            response_timeout,
            state: RefCell::new(DecodeState::default()),
            frames: RefCell::new(FrameBuffer::new()),
            pending: RefCell::new(None),
            decode_requested: Cell::new(false),
            next_request: Cell::new(0),
            events: ChannelEmitter::new(),
        });

        let weak = Rc::downgrade(&inner);
        let on_worker = handler(move |event: &WorkerEvent, transfer: Option<&Transfer>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_worker_event(event, transfer);
            }
        });
        for channel in WorkerChannel::ALL {
            inner.link.onmessage(channel, on_worker.clone());
        }

        debug!(identity = %identity, "decode session created");
        Ok(Self { inner })
    }

    /// Hand the complete file to the worker and decode every frame.
    ///
    /// Invalid calls settle immediately with a [`UsageError`] and leave the
    /// session untouched. If the worker is not ready yet the request is
    /// queued and sent as soon as it is.
    pub fn decoder(&self, buffer: Vec<u8>) -> DecodeFuture {
        self.inner.decoder(buffer)
    }

    /// Terminate the worker, drop every listener and settle an outstanding
    /// decode as terminated. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn events(&self) -> &ChannelEmitter<SessionEvent> {
        &self.inner.events
    }

    pub fn link(&self) -> &WorkerLink<D> {
        &self.inner.link
    }

    pub fn identity(&self) -> ResourceIdentity {
        self.inner.identity
    }

    pub fn state(&self) -> DecodeState {
        self.inner.state.borrow().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.borrow().initialized
    }

    pub fn info(&self) -> Option<ImageInfo> {
        self.inner.state.borrow().info
    }

    pub fn version(&self) -> Option<String> {
        self.inner.state.borrow().version.clone()
    }

    pub fn failure(&self) -> Option<PipelineError> {
        self.inner.state.borrow().failure.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }
}

impl<D: 'static> FrameSource for DecodeSession<D> {
    fn is_parsed(&self) -> bool {
        self.inner.state.borrow().parse_complete
    }

    fn is_complete(&self) -> bool {
        self.inner.state.borrow().image_complete
    }

    fn has_failed(&self) -> bool {
        self.inner.state.borrow().failure.is_some()
    }

    fn frames(&self) -> Ref<'_, FrameBuffer> {
        self.inner.frames.borrow()
    }
}

impl<D: 'static> fmt::Debug for DecodeSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeSession")
            .field("identity", &self.inner.identity)
            .field("state", &*self.inner.state.borrow())
            .field("frames", &self.inner.frames.borrow().len())
            .finish()
    }
}

impl<D: 'static> SessionInner<D> {
    fn decoder(self: &Rc<Self>, buffer: Vec<u8>) -> DecodeFuture {
        let rejected = {
            let state = self.state.borrow();
            if state.destroyed {
                Some(UsageError::SessionDestroyed.into())
            } else if buffer.is_empty() {
                Some(UsageError::EmptyBuffer.into())
            } else if self.pending.borrow().is_some() {
                Some(UsageError::DecodeInProgress.into())
            } else if self.decode_requested.get() {
                Some(UsageError::AlreadyDecoded.into())
            } else {
                // The worker never came up.
                state.failure.clone()
            }
        };
        if let Some(error) = rejected {
            debug!(%error, "decode request rejected");
            return DecodeFuture::settled(Err(error));
        }

        self.decode_requested.set(true);
        let id = self.next_request.get();
        self.next_request.set(id + 1);

        let (settle, receiver) = oneshot::channel();
        let initialized = self.state.borrow().initialized;
        let mut pending = Pending {
            id,
            queued: None,
            settle: Some(settle),
            timeout: None,
        };

        if initialized {
            *self.pending.borrow_mut() = Some(pending);
            self.post_parse(buffer);
        } else {
            debug!(bytes = buffer.len(), "worker not ready, decode request queued");
            pending.queued = Some(buffer);
            *self.pending.borrow_mut() = Some(pending);
            self.arm_timeout();
        }

        DecodeFuture::waiting(receiver)
    }

    fn post_parse(self: &Rc<Self>, buffer: Vec<u8>) {
        debug!(identity = %self.identity, bytes = buffer.len(), "posting decode request");
        self.link.post_message(WorkerRequest::Parse, Some(buffer));
        self.arm_timeout();
    }

    /// (Re)start the inactivity timer of the outstanding request.
    fn arm_timeout(self: &Rc<Self>) {
        let mut pending = self.pending.borrow_mut();
        let Some(pending) = pending.as_mut() else {
            return;
        };
        if let Some(token) = pending.timeout.take() {
            remove_source_later(&self.handle, token);
        }

        let weak: Weak<Self> = Rc::downgrade(self);
        let id = pending.id;
        pending.timeout = run_after(&self.handle, self.response_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(id);
            }
        });
    }

    fn on_timeout(self: &Rc<Self>, id: u64) {
        let expired = self
            .pending
            .borrow_mut()
            .as_mut()
            .filter(|pending| pending.id == id)
            // The timer source drops itself after firing.
            .map(|pending| pending.timeout.take())
            .is_some();

        if expired {
            warn!(
                identity = %self.identity,
                timeout_ms = self.response_timeout.as_millis(),
                "decode worker stopped responding"
            );
            self.fail(TransportError::Timeout(self.response_timeout).into());
        }
    }

    fn on_worker_event(self: &Rc<Self>, event: &WorkerEvent, transfer: Option<&Transfer>) {
        if self.state.borrow().destroyed {
            return;
        }
        match event {
            WorkerEvent::Ready(Ok(version)) => self.on_initialized(version),
            WorkerEvent::Ready(Err(error)) => self.fail(error.clone().into()),
            WorkerEvent::ParseResult(info) => self.on_parsed(*info),
            WorkerEvent::FrameResult {
                index,
                width,
                height,
                duration,
            } => self.on_frame(*index, *width, *height, *duration, transfer),
            WorkerEvent::StreamEnded { frames } => self.on_stream_ended(*frames),
            WorkerEvent::DecodeFailed(failure) => self.fail(failure.clone().into()),
        }
    }

    fn on_initialized(self: &Rc<Self>, version: &str) {
        {
            let mut state = self.state.borrow_mut();
            if state.initialized {
                warn!("duplicate readiness report ignored");
                return;
            }
            state.initialized = true;
            state.version = Some(version.to_string());
        }
        info!(identity = %self.identity, version, "decoder initialized");

        self.events.emit(
            &SessionEvent::Initialized {
                version: version.to_string(),
            },
            None,
        );

        let queued = self
            .pending
            .borrow_mut()
            .as_mut()
            .and_then(|pending| pending.queued.take());
        if let Some(buffer) = queued {
            self.post_parse(buffer);
        }
    }

    fn on_parsed(self: &Rc<Self>, info: ImageInfo) {
        {
            let mut state = self.state.borrow_mut();
            if state.failure.is_some() {
                return;
            }
            if state.parse_complete {
                warn!("duplicate parse result ignored");
                return;
            }
            state.parse_complete = true;
            state.info = Some(info);
        }
        self.frames.borrow_mut().expect(info.frame_count);

        info!(
            identity = %self.identity,
            width = info.width,
            height = info.height,
            depth = info.depth,
            frames = info.frame_count,
            sequence = info.sequence,
            "image parsed"
        );
        self.arm_timeout();
        self.events.emit(&SessionEvent::ParseComplete(info), None);
    }

    fn on_frame(
        self: &Rc<Self>,
        index: usize,
        width: u32,
        height: u32,
        duration: Duration,
        transfer: Option<&Transfer>,
    ) {
        let (settled, info) = {
            let state = self.state.borrow();
            (
                state.failure.is_some() || state.image_complete,
                state.info.filter(|_| state.parse_complete),
            )
        };
        if settled {
            trace!(frame = index, "late frame ignored");
            return;
        }
        let Some(frame_count) = info.map(|info| info.frame_count) else {
            self.fail(TransportError::Protocol(format!("frame {index} before header")).into());
            return;
        };

        let Some(pixels) = transfer.and_then(Transfer::take) else {
            self.fail(TransportError::Protocol(format!("frame {index} without pixel data")).into());
            return;
        };
        let Some(image) = RgbaImage::from_raw(width, height, pixels) else {
            self.fail(
                DecodeFailure::FrameSize {
                    index,
                    width,
                    height,
                }
                .into(),
            );
            return;
        };

        let pushed = self.frames.borrow_mut().push(FrameRecord {
            index,
            duration,
            image,
        });
        if let Err(error) = pushed {
            self.fail(error.into());
            return;
        }

        debug!(frame = index, duration_ms = duration.as_millis(), "frame buffered");
        let complete = index + 1 == frame_count;
        if complete {
            self.state.borrow_mut().image_complete = true;
        }

        self.events
            .emit(&SessionEvent::FrameDecoded { index, duration }, None);

        if complete {
            info!(identity = %self.identity, frames = frame_count, "decode complete");
            self.settle(Ok(()));
            self.events.emit(
                &SessionEvent::DecodeComplete {
                    frames: frame_count,
                },
                None,
            );
        } else {
            self.arm_timeout();
        }
    }

    fn on_stream_ended(self: &Rc<Self>, frames: usize) {
        let (settled, parsed) = {
            let state = self.state.borrow();
            (
                state.failure.is_some() || state.image_complete,
                state.parse_complete,
            )
        };
        if settled {
            return;
        }
        if !parsed {
            self.fail(TransportError::Protocol("stream ended before header".into()).into());
            return;
        }
        let buffered = self.frames.borrow().len();
        if frames != buffered || frames == 0 {
            self.fail(
                TransportError::Protocol(format!(
                    "stream ended after {frames} frames, {buffered} buffered"
                ))
                .into(),
            );
            return;
        }

        self.frames.borrow_mut().close();
        {
            let mut state = self.state.borrow_mut();
            if let Some(info) = state.info.as_mut() {
                warn!(
                    identity = %self.identity,
                    announced = info.frame_count,
                    frames,
                    "stream ended before announced frame count"
                );
                info.frame_count = frames;
            }
            state.image_complete = true;
        }

        info!(identity = %self.identity, frames, "decode complete");
        self.settle(Ok(()));
        self.events
            .emit(&SessionEvent::DecodeComplete { frames }, None);
    }

    /// Record the first failure, settle the outstanding decode and notify.
    /// Anything after completion or a first failure is ignored.
    fn fail(self: &Rc<Self>, error: PipelineError) {
        {
            let mut state = self.state.borrow_mut();
            if state.image_complete || state.failure.is_some() {
                debug!(%error, "failure after session settled ignored");
                return;
            }
            state.failure = Some(error.clone());
        }
        error!(identity = %self.identity, %error, "decode failed");

        self.settle(Err(error.clone()));
        self.events.emit(&SessionEvent::DecodeFailed(error), None);
    }

    fn settle(&self, outcome: Outcome) {
        let pending = self.pending.borrow_mut().take();
        let Some(mut pending) = pending else {
            return;
        };
        if let Some(token) = pending.timeout.take() {
            remove_source_later(&self.handle, token);
        }
        if let Some(settle) = pending.settle.take() {
            let _ = settle.send(outcome);
        }
    }

    fn destroy(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            if !state.image_complete && state.failure.is_none() {
                state.failure = Some(TransportError::Terminated.into());
            }
        }
        debug!(identity = %self.identity, "destroying decode session");

        self.link.terminate();
        self.events.clear();
        self.settle(Err(TransportError::Terminated.into()));
    }
}
