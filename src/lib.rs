// SPDX-License-Identifier: MPL-2.0

//! Animated AVIF playback with off-thread decoding.
//!
//! An [`AvifPlayer`] takes a file (URL or bytes) and a render target, hands
//! the file to a decode worker thread, buffers frames as they arrive and
//! presents them on the target honoring every frame's duration.
//!
//! Everything runs on a [`calloop`] event loop owned by the host:
//!
//! ```text
//! AvifPlayer ─▶ DecodeSession ─▶ WorkerLink ═══▶ worker thread (NativeDecoder)
//!     │              ▲  frames        ◀═══ ready / parse / frame / failed
//!     ▼              │
//! PlaybackScheduler ─┴─▶ RenderSink ─▶ Surface
//! ```

pub mod emitter;
pub mod error;
mod event_loop;
pub mod identity;
pub mod native;
pub mod playback;
pub mod player;
pub mod render;
pub mod session;
pub mod source;
pub mod transfer;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use avif_playback_config::{Config, ConfigError, PlayerOptions};
pub use emitter::{ChannelEmitter, Handler, Message, handler};
pub use error::{
    ConfigurationError, DecodeFailure, FetchError, PipelineError, TransportError, UsageError,
};
pub use identity::ResourceIdentity;
pub use native::{DecodedImage, DecoderFactory, ImageInfo, NativeDecoder};
pub use playback::{
    FrameSource, PlaybackChannel, PlaybackEvent, PlaybackScheduler, PlaybackState, PlaybackStats,
};
pub use player::{AvifPlayer, AvifPlayerBuilder, PlayerChannel, PlayerEvent};
pub use render::{
    BlitSink, MemorySurface, ParallelSink, RenderSink, Renderer, SharedSurface, Surface,
    SurfaceRegistry,
};
pub use session::{
    DecodeFuture, DecodeSession, DecodeState, FrameBuffer, FrameRecord, SessionChannel,
    SessionEvent,
};
pub use source::{ImageSource, RenderTarget};
