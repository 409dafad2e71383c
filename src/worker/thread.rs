// SPDX-License-Identifier: MPL-2.0

//! Body of the decode worker thread.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
};

use calloop::channel::Sender;
use tracing::{debug, debug_span, info, warn};

use super::protocol::{WorkerEvent, WorkerRequest};
use crate::{
    error::{DecodeFailure, TransportError},
    native::{DecoderFactory, NativeDecoder, detection::sniff_brand, normalize_duration},
    transfer::Envelope,
};

pub(super) struct WorkerContext {
    pub requests: mpsc::Receiver<Envelope<WorkerRequest>>,
    pub events: Sender<Envelope<WorkerEvent>>,
    pub terminated: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Returns `false` once the controller side is gone.
    fn post(&self, envelope: Envelope<WorkerEvent>) -> bool {
        self.events.send(envelope).is_ok()
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// Reports an unexpected exit of the worker thread, including unwinding
/// out of it.
struct ExitGuard {
    events: Sender<Envelope<WorkerEvent>>,
    terminated: Arc<AtomicBool>,
    armed: bool,
}

impl ExitGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.armed && !self.terminated.load(Ordering::Acquire) {
            warn!("decode worker exiting unexpectedly");
            let _ = self
                .events
                .send(Envelope::new(WorkerEvent::Ready(Err(TransportError::Exited))));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(super) fn run(ctx: WorkerContext, factory: DecoderFactory) {
    let guard = ExitGuard {
        events: ctx.events.clone(),
        terminated: ctx.terminated.clone(),
        armed: true,
    };

    let startup = match panic::catch_unwind(AssertUnwindSafe(|| factory())) {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload)),
    };
    let mut decoder = match startup {
        Ok(decoder) => decoder,
        Err(reason) => {
            warn!(%reason, "decoder failed to initialize");
            ctx.post(Envelope::new(WorkerEvent::Ready(Err(
                TransportError::Startup(reason),
            ))));
            guard.disarm();
            return;
        }
    };

    let version = decoder.version();
    info!(%version, "decoder ready");
    if !ctx.post(Envelope::new(WorkerEvent::Ready(Ok(version)))) {
        guard.disarm();
        return;
    }

    // Ends when the link drops its request sender.
    while let Ok(envelope) = ctx.requests.recv() {
        match envelope.message {
            WorkerRequest::Parse => {
                let data = envelope.transfer.unwrap_or_default();
                let span = debug_span!("worker::decode", bytes = data.len());
                let _enter = span.enter();

                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| decode_all(&mut *decoder, data, &ctx)));
                if let Err(payload) = outcome {
                    let reason = panic_message(payload);
                    warn!(%reason, "decoder panicked");
                    ctx.post(Envelope::new(WorkerEvent::Ready(Err(
                        TransportError::Panicked(reason),
                    ))));
                    // Decoder state is unknown after a panic.
                    break;
                }
            }
        }
    }

    debug!("decode worker stopped");
    guard.disarm();
}

/// Parse `data` and stream every frame back. Stops early on failure,
/// termination, or a vanished controller.
fn decode_all(decoder: &mut dyn NativeDecoder, data: Vec<u8>, ctx: &WorkerContext) {
    if data.is_empty() {
        ctx.post(Envelope::new(WorkerEvent::DecodeFailed(DecodeFailure::Parse(
            "input buffer is empty".into(),
        ))));
        return;
    }

    match sniff_brand(&data) {
        Some(brand) => debug!(
            brand = %brand.major_str(),
            sequence = brand.sequence,
            "container brand"
        ),
        None => debug!("no ftyp box at start of input"),
    }

    let info = match decoder.parse(data) {
        Ok(info) => info,
        Err(failure) => {
            debug!(%failure, "parse failed");
            ctx.post(Envelope::new(WorkerEvent::DecodeFailed(failure)));
            return;
        }
    };

    if info.frame_count == 0 {
        ctx.post(Envelope::new(WorkerEvent::DecodeFailed(DecodeFailure::NoFrames)));
        return;
    }

    debug!(
        width = info.width,
        height = info.height,
        frames = info.frame_count,
        "header parsed"
    );
    if !ctx.post(Envelope::new(WorkerEvent::ParseResult(info))) {
        return;
    }

    for index in 0..info.frame_count {
        if ctx.is_terminated() {
            debug!(frame = index, "terminated mid-decode");
            return;
        }

        let frame = match decoder.next_frame(index) {
            Ok(Some(frame)) => frame,
            Ok(None) if index == 0 => {
                ctx.post(Envelope::new(WorkerEvent::DecodeFailed(DecodeFailure::NoFrames)));
                return;
            }
            Ok(None) => {
                debug!(
                    frames = index,
                    announced = info.frame_count,
                    "no images remaining"
                );
                ctx.post(Envelope::new(WorkerEvent::StreamEnded { frames: index }));
                return;
            }
            Err(failure) => {
                debug!(frame = index, %failure, "frame decode failed");
                ctx.post(Envelope::new(WorkerEvent::DecodeFailed(failure)));
                return;
            }
        };

        let duration = normalize_duration(frame.duration);
        tracing::trace!(
            frame = index,
            duration_ms = duration.as_millis(),
            "frame decoded"
        );

        let event = WorkerEvent::FrameResult {
            index,
            width: frame.width,
            height: frame.height,
            duration,
        };
        if !ctx.post(Envelope::with_transfer(event, frame.pixels)) {
            return;
        }
    }
}
