// SPDX-License-Identifier: MPL-2.0

//! Ownership-moving hand-off of binary regions across the worker boundary.
//!
//! Large buffers (the encoded file, decoded pixels) never get copied on their
//! way between threads. The sender moves a `Vec<u8>` into an [`Envelope`];
//! the receiving side wraps it in a [`Transfer`], from which exactly one
//! listener can [`take`](Transfer::take) it.

use std::cell::RefCell;
use std::fmt;

/// Unit of cross-thread transmission: a message plus an optional binary region.
pub struct Envelope<M> {
    pub message: M,
    pub transfer: Option<Vec<u8>>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            transfer: None,
        }
    }

    pub fn with_transfer(message: M, buffer: Vec<u8>) -> Self {
        Self {
            message,
            transfer: Some(buffer),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Envelope<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("transfer", &self.transfer.as_ref().map(Vec::len))
            .finish()
    }
}

/// A received binary region that can be claimed once.
pub struct Transfer {
    buffer: RefCell<Option<Vec<u8>>>,
    len: usize,
}

impl Transfer {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            len: buffer.len(),
            buffer: RefCell::new(Some(buffer)),
        }
    }

    /// Claim the buffer. Every later call returns `None`.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.buffer.borrow_mut().take()
    }

    /// Whether the buffer has already been claimed.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.buffer.borrow().is_none()
    }

    /// Length of the region as it was received.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transfer({} bytes", self.len)?;
        if self.is_detached() {
            write!(f, ", detached")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_claimed_once() {
        let transfer = Transfer::new(vec![1, 2, 3]);
        assert!(!transfer.is_detached());

        assert_eq!(transfer.take(), Some(vec![1, 2, 3]));
        assert!(transfer.is_detached());
        assert_eq!(transfer.take(), None);
        assert_eq!(transfer.byte_len(), 3);
    }

    #[test]
    fn envelope_moves_buffer_without_copy() {
        let buffer = vec![7u8; 1024];
        let ptr = buffer.as_ptr();

        let envelope = Envelope::with_transfer((), buffer);
        let transfer = Transfer::new(envelope.transfer.unwrap());

        assert_eq!(transfer.take().unwrap().as_ptr(), ptr);
    }
}
