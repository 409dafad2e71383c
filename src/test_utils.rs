// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for unit tests.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use calloop::EventLoop;

use crate::{
    error::DecodeFailure,
    native::{DecodedImage, DecoderFactory, ImageInfo, NativeDecoder},
};

/// Deterministic stand-in for the native decoder.
///
/// Every pixel byte of frame `n` equals `n`, so tests can tell frames apart.
#[derive(Debug, Clone)]
pub struct ScriptedDecoder {
    width: u32,
    height: u32,
    durations: Vec<Duration>,
    announced: Option<usize>,
    startup_error: Option<String>,
    parse_error: Option<DecodeFailure>,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    parse_delay: Duration,
    frame_delay: Duration,
    parsed: bool,
}

impl ScriptedDecoder {
    pub const VERSION: &'static str = "scripted 1.0";

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            durations: vec![Duration::from_millis(100)],
            announced: None,
            startup_error: None,
            parse_error: None,
            fail_at: None,
            panic_at: None,
            parse_delay: Duration::ZERO,
            frame_delay: Duration::ZERO,
            parsed: false,
        }
    }

    pub fn frames(mut self, millis: &[u64]) -> Self {
        self.durations = millis.iter().copied().map(Duration::from_millis).collect();
        self
    }

    /// Report `count` frames in the header regardless of how many the
    /// stream actually holds.
    pub fn announce(mut self, count: usize) -> Self {
        self.announced = Some(count);
        self
    }

    pub fn fail_startup(mut self, reason: &str) -> Self {
        self.startup_error = Some(reason.to_string());
        self
    }

    pub fn fail_parse(mut self, reason: &str) -> Self {
        self.parse_error = Some(DecodeFailure::Parse(reason.to_string()));
        self
    }

    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn panic_at(mut self, index: usize) -> Self {
        self.panic_at = Some(index);
        self
    }

    pub fn parse_delay(mut self, delay: Duration) -> Self {
        self.parse_delay = delay;
        self
    }

    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn factory(&self) -> DecoderFactory {
        let script = self.clone();
        Arc::new(move || match &script.startup_error {
            Some(reason) => Err(reason.clone()),
            None => Ok(Box::new(script.clone()) as Box<dyn NativeDecoder>),
        })
    }
}

impl NativeDecoder for ScriptedDecoder {
    fn version(&self) -> String {
        Self::VERSION.to_string()
    }

    fn parse(&mut self, _data: Vec<u8>) -> Result<ImageInfo, DecodeFailure> {
        std::thread::sleep(self.parse_delay);
        if let Some(failure) = self.parse_error.clone() {
            return Err(failure);
        }
        self.parsed = true;
        Ok(ImageInfo {
            width: self.width,
            height: self.height,
            depth: 8,
            frame_count: self.announced.unwrap_or(self.durations.len()),
            sequence: self.durations.len() > 1,
        })
    }

    fn next_frame(&mut self, index: usize) -> Result<Option<DecodedImage>, DecodeFailure> {
        assert!(self.parsed, "next_frame before parse");
        std::thread::sleep(self.frame_delay);
        if self.panic_at == Some(index) {
            panic!("scripted panic at frame {index}");
        }
        if self.fail_at == Some(index) {
            return Err(DecodeFailure::Frame {
                index,
                reason: "scripted failure".into(),
            });
        }
        let Some(&duration) = self.durations.get(index) else {
            return Ok(None);
        };
        Ok(Some(DecodedImage {
            pixels: vec![index as u8; (self.width * self.height * 4) as usize],
            width: self.width,
            height: self.height,
            duration,
        }))
    }
}

/// Dispatch `event_loop` until `done` holds, panicking after five seconds.
pub fn dispatch_until(event_loop: &mut EventLoop<'static, ()>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the event loop");
        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut ())
            .unwrap();
    }
}

/// Dispatch `event_loop` for roughly `period`.
pub fn dispatch_for(event_loop: &mut EventLoop<'static, ()>, period: Duration) {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        event_loop
            .dispatch(Some(Duration::from_millis(5)), &mut ())
            .unwrap();
    }
}
