// SPDX-License-Identifier: MPL-2.0

//! Off-loop decode worker and the controller-side link that talks to it.
//!
//! The worker runs on its own thread so that decoding never blocks the
//! event loop. Requests flow to it over a standard channel, results come back
//! through a calloop channel and are re-published on the loop thread as
//! typed [`WorkerEvent`]s.

mod link;
mod protocol;
mod thread;

pub use link::WorkerLink;
pub use protocol::{WorkerChannel, WorkerEvent, WorkerRequest};

/// Thread name of the decode worker.
pub const WORKER_THREAD_NAME: &str = "avif-decoder";
