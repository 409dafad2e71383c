// SPDX-License-Identifier: MPL-2.0

//! Controller-side handle to a running decode worker.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
};

use calloop::{LoopHandle, RegistrationToken, channel};
use tracing::{debug, trace, warn};

use super::{
    WORKER_THREAD_NAME,
    protocol::{WorkerChannel, WorkerEvent, WorkerRequest},
    thread::{self, WorkerContext},
};
use crate::{
    emitter::{ChannelEmitter, Handler},
    error::TransportError,
    event_loop::remove_source_later,
    native::DecoderFactory,
    transfer::{Envelope, Transfer},
};

/// Owns the worker thread's request channel and re-publishes everything the
/// worker sends on the loop thread, one typed channel per message kind.
///
/// Dropping the link terminates the worker.
pub struct WorkerLink<D: 'static> {
    handle: LoopHandle<'static, D>,
    requests: RefCell<Option<mpsc::Sender<Envelope<WorkerRequest>>>>,
    /// Clone of the worker's event sender, used to report failures that are
    /// detected on this side of the boundary.
    loopback: channel::Sender<Envelope<WorkerEvent>>,
    emitter: Rc<ChannelEmitter<WorkerEvent>>,
    token: Cell<Option<RegistrationToken>>,
    terminated: Arc<AtomicBool>,
}

impl<D: 'static> WorkerLink<D> {
    /// Register the inbound channel and start the worker thread.
    ///
    /// A thread that cannot be spawned is reported on
    /// [`WorkerChannel::Ready`] like any other startup failure.
    pub fn spawn(
        handle: &LoopHandle<'static, D>,
        factory: DecoderFactory,
    ) -> Result<Self, calloop::Error> {
        let (events_tx, events_rx) = channel::channel::<Envelope<WorkerEvent>>();
        let (requests_tx, requests_rx) = mpsc::channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let emitter = Rc::new(ChannelEmitter::new());

        let weak: Weak<ChannelEmitter<WorkerEvent>> = Rc::downgrade(&emitter);
        let flag = terminated.clone();
        let token = handle
            .insert_source(events_rx, move |event, _, _| match event {
                channel::Event::Msg(envelope) => {
                    if flag.load(Ordering::Acquire) {
                        trace!(message = ?envelope.message, "dropping message from terminated worker");
                        return;
                    }
                    let Some(emitter) = weak.upgrade() else {
                        return;
                    };
                    let transfer = envelope.transfer.map(Transfer::new);
                    emitter.emit(&envelope.message, transfer.as_ref());
                }
                channel::Event::Closed => debug!("worker channel closed"),
            })
            .map_err(|err| err.error)?;

        let ctx = WorkerContext {
            requests: requests_rx,
            events: events_tx.clone(),
            terminated: terminated.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || thread::run(ctx, factory));
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn decode worker");
            let _ = events_tx.send(Envelope::new(WorkerEvent::Ready(Err(
                TransportError::Startup(err.to_string()),
            ))));
        }

        Ok(Self {
            handle: handle.clone(),
            requests: RefCell::new(Some(requests_tx)),
            loopback: events_tx,
            emitter,
            token: Cell::new(Some(token)),
            terminated,
        })
    }

    /// Send a request to the worker, moving `transfer` across the boundary.
    ///
    /// If the worker is gone the failure is reported asynchronously on
    /// [`WorkerChannel::Ready`].
    pub fn post_message(&self, request: WorkerRequest, transfer: Option<Vec<u8>>) {
        if self.is_terminated() {
            warn!(?request, "post to terminated worker ignored");
            return;
        }

        let envelope = Envelope {
            message: request,
            transfer,
        };
        let sent = self
            .requests
            .borrow()
            .as_ref()
            .is_some_and(|requests| requests.send(envelope).is_ok());

        if !sent {
            warn!(?request, "decode worker is not accepting requests");
            let _ = self
                .loopback
                .send(Envelope::new(WorkerEvent::Ready(Err(TransportError::Exited))));
        }
    }

    /// Subscribe to every message on `channel`.
    pub fn onmessage(&self, channel: WorkerChannel, handler: Handler<WorkerEvent>) {
        self.emitter.on(channel, handler);
    }

    /// Subscribe to the next message on `channel` only.
    pub fn onmessage_once(&self, channel: WorkerChannel, handler: Handler<WorkerEvent>) {
        self.emitter.once(channel, handler);
    }

    pub fn clear_onmessage(&self, channel: WorkerChannel, handler: &Handler<WorkerEvent>) -> bool {
        self.emitter.off(channel, handler)
    }

    /// Stop the worker and silence the link. Idempotent.
    ///
    /// A frame being decoded when this is called may still finish on the
    /// worker thread, but its result is never delivered.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("terminating decode worker");

        // Closing the request channel ends the worker's receive loop.
        self.requests.borrow_mut().take();
        self.emitter.clear();
        if let Some(token) = self.token.take() {
            remove_source_later(&self.handle, token);
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

impl<D: 'static> Drop for WorkerLink<D> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use calloop::EventLoop;

    use super::*;
    use crate::{emitter::handler, test_utils::{ScriptedDecoder, dispatch_until}};

    fn collect(link: &WorkerLink<()>) -> Rc<RefCell<Vec<(WorkerEvent, Option<usize>)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for channel in WorkerChannel::ALL {
            let seen = seen.clone();
            link.onmessage(
                channel,
                handler(move |event: &WorkerEvent, transfer: Option<&Transfer>| {
                    let len = transfer.and_then(Transfer::take).map(|pixels| pixels.len());
                    seen.borrow_mut().push((event.clone(), len));
                }),
            );
        }
        seen
    }

    #[test]
    fn reports_ready_with_version() {
        let mut event_loop = EventLoop::<()>::try_new().unwrap();
        let link = WorkerLink::spawn(&event_loop.handle(), ScriptedDecoder::new(2, 2).factory())
            .unwrap();
        let seen = collect(&link);

        dispatch_until(&mut event_loop, || !seen.borrow().is_empty());

        assert_eq!(
            seen.borrow()[0].0,
            WorkerEvent::Ready(Ok(ScriptedDecoder::VERSION.to_string()))
        );
    }

    #[test]
    fn streams_parse_then_frames_in_order() {
        let mut event_loop = EventLoop::<()>::try_new().unwrap();
        let script = ScriptedDecoder::new(4, 3).frames(&[40, 40, 40]);
        let link = WorkerLink::spawn(&event_loop.handle(), script.factory()).unwrap();
        let seen = collect(&link);

        link.post_message(WorkerRequest::Parse, Some(vec![1; 32]));
        dispatch_until(&mut event_loop, || seen.borrow().len() == 5);

        let seen = seen.borrow();
        assert!(matches!(seen[0].0, WorkerEvent::Ready(Ok(_))));
        assert!(matches!(seen[1].0, WorkerEvent::ParseResult(info) if info.frame_count == 3));
        for (offset, (event, len)) in seen[2..].iter().enumerate() {
            match event {
                WorkerEvent::FrameResult { index, duration, .. } => {
                    assert_eq!(*index, offset);
                    assert_eq!(*duration, Duration::from_millis(40));
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(*len, Some(4 * 3 * 4));
        }
    }

    #[test]
    fn startup_failure_is_reported_on_ready() {
        let mut event_loop = EventLoop::<()>::try_new().unwrap();
        let script = ScriptedDecoder::new(1, 1).fail_startup("no codec");
        let link = WorkerLink::spawn(&event_loop.handle(), script.factory()).unwrap();
        let seen = collect(&link);

        dispatch_until(&mut event_loop, || !seen.borrow().is_empty());

        assert_eq!(
            seen.borrow()[0].0,
            WorkerEvent::Ready(Err(TransportError::Startup("no codec".into())))
        );
    }

    #[test]
    fn decoder_panic_is_reported_as_transport_failure() {
        let mut event_loop = EventLoop::<()>::try_new().unwrap();
        let script = ScriptedDecoder::new(2, 2).frames(&[50, 50]).panic_at(1);
        let link = WorkerLink::spawn(&event_loop.handle(), script.factory()).unwrap();
        let seen = collect(&link);

        link.post_message(WorkerRequest::Parse, Some(vec![1; 8]));
        dispatch_until(&mut event_loop, || {
            seen.borrow()
                .iter()
                .any(|(event, _)| matches!(event, WorkerEvent::Ready(Err(_))))
        });

        let seen = seen.borrow();
        assert!(matches!(
            seen.last().unwrap().0,
            WorkerEvent::Ready(Err(TransportError::Panicked(_)))
        ));
    }

    #[test]
    fn terminate_silences_link() {
        let mut event_loop = EventLoop::<()>::try_new().unwrap();
        let link = WorkerLink::spawn(&event_loop.handle(), ScriptedDecoder::new(2, 2).factory())
            .unwrap();
        let seen = collect(&link);

        link.terminate();
        link.terminate();
        assert!(link.is_terminated());

        link.post_message(WorkerRequest::Parse, Some(vec![1; 8]));
        for _ in 0..5 {
            event_loop
                .dispatch(Some(Duration::from_millis(10)), &mut ())
                .unwrap();
        }
        assert!(seen.borrow().is_empty());
    }
}
