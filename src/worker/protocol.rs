// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use crate::{
    emitter::Message,
    error::{DecodeFailure, TransportError},
    native::ImageInfo,
};

/// Controller to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Parse and fully decode the transferred file buffer.
    Parse,
}

/// Worker to controller.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The decoder finished initializing (with its version) or could not
    /// be brought up. Also carries transport failures raised after startup.
    Ready(Result<String, TransportError>),
    /// The container header was parsed.
    ParseResult(ImageInfo),
    /// One frame was decoded; its RGBA pixels travel as the transfer.
    FrameResult {
        index: usize,
        width: u32,
        height: u32,
        duration: Duration,
    },
    /// The stream held only `frames` images, fewer than announced. No
    /// further results follow.
    StreamEnded { frames: usize },
    /// The decoder rejected the bitstream. No further results follow.
    DecodeFailed(DecodeFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerChannel {
    Ready,
    ParseResult,
    FrameResult,
    StreamEnded,
    DecodeFailed,
}

impl WorkerChannel {
    pub const ALL: [WorkerChannel; 5] = [
        WorkerChannel::Ready,
        WorkerChannel::ParseResult,
        WorkerChannel::FrameResult,
        WorkerChannel::StreamEnded,
        WorkerChannel::DecodeFailed,
    ];
}

impl Message for WorkerEvent {
    type Channel = WorkerChannel;

    fn channel(&self) -> WorkerChannel {
        match self {
            WorkerEvent::Ready(_) => WorkerChannel::Ready,
            WorkerEvent::ParseResult(_) => WorkerChannel::ParseResult,
            WorkerEvent::FrameResult { .. } => WorkerChannel::FrameResult,
            WorkerEvent::StreamEnded { .. } => WorkerChannel::StreamEnded,
            WorkerEvent::DecodeFailed(_) => WorkerChannel::DecodeFailed,
        }
    }
}
