// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy for the decode and playback pipeline.
//!
//! Only [`ConfigurationError`] is ever returned synchronously from a
//! constructor. Everything raised once the pipeline is running travels as a
//! value: a settled [`DecodeFuture`](crate::session::DecodeFuture) or a
//! failure event on the session's channels.

use std::time::Duration;

/// Bad constructor arguments, reported before any asynchronous work starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("an AVIF file URL or byte buffer is required")]
    EmptyInput,
    #[error("a render target element id must not be empty")]
    EmptyTargetId,
    #[error("no render surface is registered under id `{0}`")]
    UnknownTarget(String),
    #[error("no AVIF decoder is available; enable the `libavif` feature or inject one")]
    NoDecoder,
    #[error("failed to register with the event loop: {0}")]
    EventLoop(#[from] calloop::Error),
}

/// The decode worker could not be reached or stopped responding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("decode worker failed to start: {0}")]
    Startup(String),
    #[error("decode worker panicked: {0}")]
    Panicked(String),
    #[error("decode worker exited unexpectedly")]
    Exited,
    #[error("decode worker was terminated")]
    Terminated,
    #[error("decode worker did not respond within {0:?}")]
    Timeout(Duration),
    #[error("decode worker violated the protocol: {0}")]
    Protocol(String),
}

/// The native decoder rejected the bitstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeFailure {
    #[error("failed to parse container: {0}")]
    Parse(String),
    #[error("image contains no frames")]
    NoFrames,
    #[error("failed to decode frame {index}: {reason}")]
    Frame { index: usize, reason: String },
    #[error("frame {index} pixel data does not match {width}x{height}")]
    FrameSize {
        index: usize,
        width: u32,
        height: u32,
    },
}

/// Resource fetch failed before decoding could start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },
    #[error("{0} returned an empty body")]
    Empty(String),
    #[error("fetching {0} requires the `http` feature")]
    Unsupported(String),
    #[error("could not start fetching: {0}")]
    Spawn(String),
}

/// A call that is not valid in the current state. Rejected per call, never
/// corrupting session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("decode input buffer is empty")]
    EmptyBuffer,
    #[error("a decode is already outstanding for this session")]
    DecodeInProgress,
    #[error("this session has already decoded its input")]
    AlreadyDecoded,
    #[error("the session has been destroyed")]
    SessionDestroyed,
    #[error("playback requires the image header to be parsed")]
    NotParsed,
    #[error("decoding failed, nothing to play")]
    DecodeFailed,
}

/// Any failure of a running pipeline, delivered to every interested listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeFailure),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl PipelineError {
    /// Whether the failure came from the decoder itself rather than from the
    /// machinery around it.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, PipelineError::Decode(_))
    }
}
