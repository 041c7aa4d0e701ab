use std::{
    collections::TryReserveError,
    fmt,
    io::{self, Read},
};

/// Largest chunk pulled off a socket by one read, and therefore the largest
/// message the relay ever forwards.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Largest read chunk the command line accepts.
pub const MAX_READ_CHUNK_SIZE: usize = 1 << 20;

/// An immutable payload queued for one destination.
///
/// The length is whatever the read returned; payloads are never scanned for a
/// terminator, so binary data passes through untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    payload: Box<[u8]>,
}

impl Message {
    /// Copies `bytes` into a freshly allocated message.
    ///
    /// Allocation goes through `try_reserve_exact` so an exhausted allocator
    /// surfaces as an error instead of aborting the process.
    pub fn copy_from(bytes: &[u8]) -> Result<Self, TryReserveError> {
        let mut payload = Vec::new();
        payload.try_reserve_exact(bytes.len())?;
        payload.extend_from_slice(bytes);
        Ok(Self {
            payload: payload.into_boxed_slice(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Result of a single bounded read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<'a> {
    /// The peer sent `bytes`; always non-empty.
    Data(&'a [u8]),
    /// The read returned zero bytes: the peer closed its side.
    Closed,
}

/// Fixed-capacity scratch buffer reused for every read on the relay thread.
pub struct ReadBuffer {
    buf: Box<[u8]>,
}

impl ReadBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes (at least one).
    ///
    /// Like [`Message::copy_from`], a capacity the allocator cannot satisfy is
    /// an error rather than a panic.
    pub fn try_new(capacity: usize) -> Result<Self, TryReserveError> {
        let capacity = capacity.max(1);
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf: buf.into_boxed_slice(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Performs exactly one `read` call into the buffer.
    ///
    /// Errors, including `WouldBlock`, are returned untouched so the caller can
    /// tell a spurious wakeup from a broken connection.
    pub fn read_from<R>(&mut self, reader: &mut R) -> io::Result<ReadOutcome<'_>>
    where
        R: Read + ?Sized,
    {
        let read = reader.read(&mut self.buf)?;
        if read == 0 {
            return Ok(ReadOutcome::Closed);
        }
        Ok(ReadOutcome::Data(&self.buf[..read]))
    }
}
