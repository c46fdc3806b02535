//! Message framing over a byte stream.
//!
//! The engine accumulates received bytes in a primary buffer and asks a
//! completion predicate whether a whole message is present. Bytes received
//! past the end of that message are moved to a surplus buffer and become the
//! start of the next message on the following `get()`.
//!
//! Writes are tracked the same way across calls: a payload handed to `put()`
//! is written as far as the socket allows, and the caller passes the same
//! payload again until `put()` reports it done.

use crate::error::Error;
use crate::transport::{IoStatus, Want, Wire};
use std::sync::Arc;
use tracing::{debug, trace};

/// Granularity of receive and surplus buffer growth.
pub const CHUNK: usize = 4096;

/// Completion predicate: given the bytes accumulated so far, returns the
/// length of the complete message at their start, or 0 if more bytes are
/// needed.
pub type Completion = Arc<dyn Fn(&[u8]) -> usize + Send + Sync>;

/// Result of a [`get()`](crate::Connection::get).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A complete message of this many bytes is available through
    /// [`message()`](crate::Connection::message).
    Message(usize),
    /// More bytes are needed. Call again once the link is ready in the given
    /// direction.
    Incomplete(Want),
    /// The peer ended the stream.
    Closed,
}

/// Result of an operation that may need several calls to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// Call again, with the same arguments, once the link is ready in the
    /// given direction.
    InProgress(Want),
}

/// Capacity of the receive buffer before the next receive.
///
/// The first receive gets one chunk plus room for the terminator; after that
/// the buffer doubles whenever less than a chunk is free.
pub fn next_capacity(capacity: usize, filled: usize) -> usize {
    if capacity == 0 {
        CHUNK + 1
    } else if capacity - filled < CHUNK {
        capacity * 2
    } else {
        capacity
    }
}

/// Capacity needed to hold `needed` surplus bytes, in whole chunks.
pub fn surplus_capacity(needed: usize) -> usize {
    needed.div_ceil(CHUNK) * CHUNK
}

#[derive(Debug, Clone, Copy)]
struct WriteProgress {
    to_write: usize,
    written: usize,
}

#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    // `buf.len()` is the capacity; `len` is how much of it holds data.
    buf: Vec<u8>,
    len: usize,
    // Set while the message at the start of `buf` belongs to the caller.
    delivered: Option<usize>,
    surplus: Vec<u8>,
    surplus_len: usize,
    write: Option<WriteProgress>,
}

impl FrameBuffer {
    /// The last message returned by `get()`.
    pub(crate) fn message(&self) -> &[u8] {
        match self.delivered {
            Some(len) => &self.buf[..len],
            None => &[],
        }
    }

    /// Bytes accumulated towards the next message.
    pub(crate) fn buffered(&self) -> usize {
        match self.delivered {
            Some(_) => self.surplus_len,
            None => self.len + self.surplus_len,
        }
    }

    pub(crate) fn get<W: Wire + ?Sized>(
        &mut self,
        wire: &mut W,
        complete: &dyn Fn(&[u8]) -> usize,
        max_message_bytes: usize,
    ) -> Result<Frame, Error> {
        if self.delivered.take().is_some() {
            self.len = 0;
        }
        if self.len == 0 && self.surplus_len > 0 {
            std::mem::swap(&mut self.buf, &mut self.surplus);
            self.len = self.surplus_len;
            self.surplus_len = 0;
            trace!(len = self.len, "Resuming from surplus");
        }

        let msg_len = loop {
            let found = complete(&self.buf[..self.len]);
            if found > 0 && found <= self.len {
                if found > max_message_bytes {
                    return Err(Error::BufferSizeExceeded {
                        max: max_message_bytes,
                    });
                }
                break found;
            }
            if self.len > max_message_bytes {
                return Err(Error::BufferSizeExceeded {
                    max: max_message_bytes,
                });
            }

            let capacity = next_capacity(self.buf.len(), self.len);
            if capacity != self.buf.len() {
                self.buf.resize(capacity, 0);
            }

            match wire.recv(&mut self.buf[self.len..])? {
                IoStatus::Ready(0) => {
                    debug!(buffered = self.len, "Peer closed stream");
                    return Ok(Frame::Closed);
                }
                IoStatus::Ready(sz) => self.len += sz,
                IoStatus::Blocked(want) => return Ok(Frame::Incomplete(want)),
            }
        };

        let extra = self.len - msg_len;
        if extra > 0 {
            if self.surplus.len() < extra {
                self.surplus.resize(surplus_capacity(extra), 0);
            }
            self.surplus[..extra].copy_from_slice(&self.buf[msg_len..self.len]);
            self.surplus_len = extra;
        }

        // Terminate for consumers that treat the message as a C string.
        if self.buf.len() <= msg_len {
            self.buf.resize(msg_len + 1, 0);
        }
        self.buf[msg_len] = 0;

        self.len = msg_len;
        self.delivered = Some(msg_len);
        debug!(len = msg_len, surplus = extra, "Received message");
        Ok(Frame::Message(msg_len))
    }

    /// Whether the surplus alone already holds a complete message.
    pub(crate) fn more(&self, complete: &dyn Fn(&[u8]) -> usize) -> bool {
        if self.surplus_len == 0 {
            return false;
        }
        let found = complete(&self.surplus[..self.surplus_len]);
        found > 0 && found <= self.surplus_len
    }

    pub(crate) fn put<W: Wire + ?Sized>(&mut self, wire: &mut W, data: &[u8]) -> Result<Progress, Error> {
        let mut progress = match self.write {
            Some(progress) if progress.to_write != data.len() => {
                return Err(Error::WrongBuffer {
                    expected: progress.to_write,
                    got: data.len(),
                })
            }
            Some(progress) => progress,
            None => WriteProgress {
                to_write: data.len(),
                written: 0,
            },
        };

        while progress.written < progress.to_write {
            match wire.send(&data[progress.written..]) {
                Ok(IoStatus::Ready(sz)) => progress.written += sz,
                Ok(IoStatus::Blocked(want)) => {
                    trace!(written = progress.written, total = progress.to_write, "Partial write");
                    self.write = Some(progress);
                    return Ok(Progress::InProgress(want));
                }
                Err(err) => {
                    self.write = Some(progress);
                    return Err(err);
                }
            }
        }

        // Everything is handed to the link; it may still be holding some of
        // it (TLS records).
        match wire.flush() {
            Ok(IoStatus::Blocked(want)) => {
                self.write = Some(progress);
                Ok(Progress::InProgress(want))
            }
            Ok(IoStatus::Ready(_)) => {
                self.write = None;
                debug!(len = progress.to_write, "Sent message");
                Ok(Progress::Done)
            }
            Err(err) => {
                self.write = Some(progress);
                Err(err)
            }
        }
    }

    /// Drops everything buffered in either direction.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
