// SPDX-License-Identifier: MPL-2.0

//! Boundary to the native AVIF decoder.
//!
//! The decoder is a black box that, given the whole file, reports the image
//! header and then yields RGBA8 frames one at a time together with their
//! display duration. It is created and driven exclusively on the decode
//! worker thread, so implementations do not need to be `Send`.
//!
//! # Module Structure
//!
//! - [`detection`]: ISOBMFF brand sniffing (`avif` vs. `avis`)
//! - `libavif`: libavif-sys backed decoder (feature `libavif`)

pub mod detection;
#[cfg(feature = "libavif")]
pub mod libavif;

use std::{sync::Arc, time::Duration};

use crate::error::DecodeFailure;

/// Frame duration used when the container carries no timing.
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(100);

/// Minimum frame duration to prevent excessive CPU usage (60 FPS cap).
pub const MIN_FRAME_DURATION: Duration = Duration::from_millis(16);

/// Header metadata known once the container has been parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Bits per channel of the coded image.
    pub depth: u32,
    pub frame_count: usize,
    /// Whether the container declares an image sequence (`avis`).
    pub sequence: bool,
}

/// One decoded frame as produced by the native decoder.
pub struct DecodedImage {
    /// Tightly packed RGBA8 pixels, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub duration: Duration,
}

pub trait NativeDecoder {
    /// Version string reported on readiness.
    fn version(&self) -> String;

    /// Parse the container header of `data`, which the decoder keeps.
    fn parse(&mut self, data: Vec<u8>) -> Result<ImageInfo, DecodeFailure>;

    /// Decode the next frame in display order. `Ok(None)` means the stream
    /// ran out of images before the announced frame count.
    fn next_frame(&mut self, index: usize) -> Result<Option<DecodedImage>, DecodeFailure>;
}

/// Constructs a decoder on the worker thread. An `Err` is reported as a
/// worker startup failure.
pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn NativeDecoder>, String> + Send + Sync>;

/// Apply the frame timing policy: missing timing falls back to
/// [`DEFAULT_FRAME_DURATION`], everything is clamped to [`MIN_FRAME_DURATION`].
#[must_use]
pub fn normalize_duration(duration: Duration) -> Duration {
    if duration.is_zero() {
        DEFAULT_FRAME_DURATION
    } else {
        duration.max(MIN_FRAME_DURATION)
    }
}

/// The decoder used when none is injected.
#[must_use]
pub fn default_factory() -> Option<DecoderFactory> {
    #[cfg(feature = "libavif")]
    {
        Some(libavif::factory())
    }
    #[cfg(not(feature = "libavif"))]
    {
        None
    }
}
