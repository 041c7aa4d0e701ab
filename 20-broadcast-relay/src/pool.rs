//! The set of live connections and the readiness bookkeeping around them.
//!
//! The pool never touches the poller. It records which handles *should* be
//! watched for read and write readiness, and the relay turns those sets into
//! poller registrations before every wait.

use std::{
    collections::{BTreeMap, BTreeSet, TryReserveError},
    fmt, io,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    connection::{Connection, OutboundQueue},
    message::Message,
};

/// Descriptor-like identifier of a watched endpoint.
///
/// The relay uses the socket's raw file descriptor, so handles are unique
/// among live endpoints and may be reused once an endpoint is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sd {}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("out of memory while buffering")]
    OutOfMemory(#[from] TryReserveError),
    #[error("no connection registered for {0}")]
    NotFound(Handle),
    #[error("{0} is already registered")]
    AlreadyRegistered(Handle),
    #[error("write to {handle} failed")]
    WriteFailed {
        handle: Handle,
        #[source]
        source: io::Error,
    },
}

/// What a single `flush_one` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The oldest message was written in full and freed.
    Sent { remaining: usize },
    /// The transport would block; the message stays at the head of the queue.
    Blocked,
    /// Nothing was queued.
    Idle,
}

/// Counts released by [`ConnectionPool::teardown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub connections_closed: usize,
    pub messages_discarded: usize,
}

#[derive(Debug)]
pub struct ConnectionPool<S> {
    connections: BTreeMap<Handle, Connection<S>>,
    listener: Option<Handle>,
    read_interest: BTreeSet<Handle>,
    write_interest: BTreeSet<Handle>,
    max_handle: Option<Handle>,
}

impl<S> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionPool<S> {
    /// An empty pool: no listener, no connections, nothing watched.
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            listener: None,
            read_interest: BTreeSet::new(),
            write_interest: BTreeSet::new(),
            max_handle: None,
        }
    }

    pub fn watch_listener(&mut self, handle: Handle) {
        if let Some(previous) = self.listener.replace(handle) {
            self.read_interest.remove(&previous);
        }
        self.read_interest.insert(handle);
        self.recompute_max_handle();
    }

    pub fn unwatch_listener(&mut self) -> Option<Handle> {
        let handle = self.listener.take()?;
        self.read_interest.remove(&handle);
        if self.max_handle == Some(handle) {
            self.recompute_max_handle();
        }
        Some(handle)
    }

    pub fn add_connection(&mut self, handle: Handle, transport: S) -> Result<(), PoolError> {
        if self.connections.contains_key(&handle) || self.listener == Some(handle) {
            return Err(PoolError::AlreadyRegistered(handle));
        }

        let connection = Connection::new(handle, transport)?;
        self.connections.insert(handle, connection);
        self.read_interest.insert(handle);
        if self.max_handle.is_none_or(|max| handle > max) {
            self.max_handle = Some(handle);
        }
        Ok(())
    }

    /// Removes a connection and closes its transport.
    ///
    /// Returns how many queued messages were discarded with it.
    pub fn remove_connection(&mut self, handle: Handle) -> Result<usize, PoolError> {
        if !self.connections.contains_key(&handle) {
            return Err(PoolError::NotFound(handle));
        }

        self.read_interest.remove(&handle);
        self.write_interest.remove(&handle);
        if self.max_handle == Some(handle) {
            self.recompute_max_handle();
        }

        let Some(mut connection) = self.connections.remove(&handle) else {
            return Err(PoolError::NotFound(handle));
        };
        let discarded = connection.queue_mut().purge();
        // Dropping the connection closes its transport, after the queue and
        // the interest flags are gone.
        drop(connection);
        debug!(%handle, discarded, "connection removed from pool");
        Ok(discarded)
    }

    /// Queues a copy of `payload` for every connection except `source`.
    ///
    /// Destinations are visited in ascending handle order. If an allocation
    /// fails partway, destinations already visited keep their copy.
    pub fn broadcast(&mut self, source: Handle, payload: &[u8]) -> Result<usize, PoolError> {
        let mut delivered = 0;
        for (&handle, connection) in self
            .connections
            .iter_mut()
            .filter(|(handle, _)| **handle != source)
        {
            let message = Message::copy_from(payload)?;
            connection.queue_mut().push(message)?;
            self.write_interest.insert(handle);
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let handles: Vec<Handle> = self.connections.keys().copied().collect();
        for handle in handles {
            if let Ok(discarded) = self.remove_connection(handle) {
                report.connections_closed += 1;
                report.messages_discarded += discarded;
            }
        }
        self.unwatch_listener();
        report
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.connections.contains_key(&handle)
    }

    pub fn listener(&self) -> Option<Handle> {
        self.listener
    }

    /// Highest handle currently watched, listener included.
    pub fn max_handle(&self) -> Option<Handle> {
        self.max_handle
    }

    pub fn is_read_interested(&self, handle: Handle) -> bool {
        self.read_interest.contains(&handle)
    }

    pub fn is_write_interested(&self, handle: Handle) -> bool {
        self.write_interest.contains(&handle)
    }

    pub fn read_interest(&self) -> impl Iterator<Item = Handle> + '_ {
        self.read_interest.iter().copied()
    }

    pub fn write_interest(&self) -> impl Iterator<Item = Handle> + '_ {
        self.write_interest.iter().copied()
    }

    /// Connection handles in ascending order.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.connections.keys().copied()
    }

    pub fn queued_len(&self, handle: Handle) -> Option<usize> {
        self.connections
            .get(&handle)
            .map(|connection| connection.queue().len())
    }

    pub fn queue(&self, handle: Handle) -> Option<&OutboundQueue> {
        self.connections.get(&handle).map(Connection::queue)
    }

    pub fn transport_mut(&mut self, handle: Handle) -> Option<&mut S> {
        self.connections
            .get_mut(&handle)
            .map(Connection::transport_mut)
    }

    fn recompute_max_handle(&mut self) {
        self.max_handle = self.read_interest.last().copied();
    }
}

impl<S> ConnectionPool<S>
where
    S: io::Write,
{
    /// Writes the oldest queued message for `handle` with a single write.
    ///
    /// A short write is reported as `WriteFailed`; partially sent messages are
    /// never resumed.
    pub fn flush_one(&mut self, handle: Handle) -> Result<FlushOutcome, PoolError> {
        let connection = self
            .connections
            .get_mut(&handle)
            .ok_or(PoolError::NotFound(handle))?;
        let (transport, queue) = connection.parts_mut();

        let Some(message) = queue.front() else {
            self.write_interest.remove(&handle);
            return Ok(FlushOutcome::Idle);
        };

        match transport.write(message.as_bytes()) {
            Ok(written) if written == message.len() => {}
            Ok(written) => {
                return Err(PoolError::WriteFailed {
                    handle,
                    source: io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write: {written} of {} bytes", message.len()),
                    ),
                });
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(FlushOutcome::Blocked);
            }
            Err(source) => return Err(PoolError::WriteFailed { handle, source }),
        }

        queue.pop();
        let remaining = queue.len();
        if remaining == 0 {
            self.write_interest.remove(&handle);
        }
        Ok(FlushOutcome::Sent { remaining })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn pool_with(handles: &[usize]) -> ConnectionPool<Vec<u8>> {
        let mut pool = ConnectionPool::new();
        for &handle in handles {
            pool.add_connection(Handle(handle), Vec::new())
                .expect("add connection");
        }
        pool
    }

    fn drain(pool: &mut ConnectionPool<Vec<u8>>, handle: Handle) -> Vec<u8> {
        while let FlushOutcome::Sent { .. } = pool.flush_one(handle).expect("flush") {}
        std::mem::take(pool.transport_mut(handle).expect("transport"))
    }

    #[test]
    fn new_pool_watches_nothing() {
        let pool = ConnectionPool::<Vec<u8>>::new();
        assert!(pool.is_empty());
        assert_eq!(pool.max_handle(), None);
        assert_eq!(pool.read_interest().count(), 0);
        assert_eq!(pool.write_interest().count(), 0);
    }

    #[test]
    fn added_connection_is_read_interested_only() {
        let mut pool = pool_with(&[]);
        pool.watch_listener(Handle(3));
        pool.add_connection(Handle(6), Vec::new()).expect("add");

        assert!(pool.is_read_interested(Handle(6)));
        assert!(!pool.is_write_interested(Handle(6)));
        assert_eq!(pool.queued_len(Handle(6)), Some(0));
        assert_eq!(pool.max_handle(), Some(Handle(6)));
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let mut pool = pool_with(&[5]);
        let err = pool
            .add_connection(Handle(5), Vec::new())
            .expect_err("duplicate");
        assert!(matches!(err, PoolError::AlreadyRegistered(Handle(5))));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn removing_max_handle_recomputes_from_remaining() {
        let mut pool = pool_with(&[3, 5, 7, 9]);
        assert_eq!(pool.max_handle(), Some(Handle(9)));

        pool.remove_connection(Handle(9)).expect("remove 9");
        assert_eq!(pool.max_handle(), Some(Handle(7)));
    }

    #[test]
    fn listener_counts_toward_max_handle() {
        let mut pool = pool_with(&[5, 7, 9]);
        pool.watch_listener(Handle(3));

        pool.remove_connection(Handle(9)).expect("remove 9");
        pool.remove_connection(Handle(7)).expect("remove 7");
        pool.remove_connection(Handle(5)).expect("remove 5");
        assert_eq!(pool.max_handle(), Some(Handle(3)));

        assert_eq!(pool.unwatch_listener(), Some(Handle(3)));
        assert_eq!(pool.max_handle(), None);
    }

    #[test]
    fn removing_non_max_handle_keeps_max() {
        let mut pool = pool_with(&[3, 5, 7, 9]);
        pool.remove_connection(Handle(5)).expect("remove 5");
        assert_eq!(pool.max_handle(), Some(Handle(9)));
    }

    #[test]
    fn removing_unknown_handle_is_not_found() {
        let mut pool = pool_with(&[4]);
        let err = pool.remove_connection(Handle(8)).expect_err("unknown");
        assert!(matches!(err, PoolError::NotFound(Handle(8))));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn broadcast_skips_the_source() {
        let mut pool = pool_with(&[4, 5, 6]);
        let delivered = pool.broadcast(Handle(5), b"hello").expect("broadcast");

        assert_eq!(delivered, 2);
        assert_eq!(pool.queued_len(Handle(4)), Some(1));
        assert_eq!(pool.queued_len(Handle(5)), Some(0));
        assert_eq!(pool.queued_len(Handle(6)), Some(1));
        assert!(pool.is_write_interested(Handle(4)));
        assert!(!pool.is_write_interested(Handle(5)));
        assert!(pool.is_write_interested(Handle(6)));

        assert_eq!(drain(&mut pool, Handle(4)), b"hello");
        assert_eq!(drain(&mut pool, Handle(6)), b"hello");
        assert!(drain(&mut pool, Handle(5)).is_empty());
    }

    #[test]
    fn broadcast_without_other_connections_is_noop() {
        let mut pool = pool_with(&[4]);
        assert_eq!(pool.broadcast(Handle(4), b"alone").expect("broadcast"), 0);
        assert_eq!(pool.queued_len(Handle(4)), Some(0));
        assert_eq!(pool.write_interest().count(), 0);

        let mut empty = pool_with(&[]);
        assert_eq!(empty.broadcast(Handle(4), b"nobody").expect("broadcast"), 0);
    }

    #[test]
    fn delivery_order_is_fifo_across_sources() {
        let mut pool = pool_with(&[4, 5, 6]);
        pool.broadcast(Handle(4), b"a1").expect("a1");
        pool.broadcast(Handle(5), b"b1").expect("b1");
        pool.broadcast(Handle(4), b"a2").expect("a2");

        assert_eq!(drain(&mut pool, Handle(6)), b"a1b1a2");
        assert_eq!(drain(&mut pool, Handle(5)), b"a1a2");
        assert_eq!(drain(&mut pool, Handle(4)), b"b1");
    }

    #[test]
    fn write_interest_tracks_queue_emptiness() {
        let mut pool = pool_with(&[4, 5]);
        pool.broadcast(Handle(4), b"one").expect("one");
        pool.broadcast(Handle(4), b"two").expect("two");

        assert_eq!(
            pool.flush_one(Handle(5)).expect("flush"),
            FlushOutcome::Sent { remaining: 1 }
        );
        assert!(pool.is_write_interested(Handle(5)));
        assert_eq!(
            pool.flush_one(Handle(5)).expect("flush"),
            FlushOutcome::Sent { remaining: 0 }
        );
        assert!(!pool.is_write_interested(Handle(5)));
        assert_eq!(pool.flush_one(Handle(5)).expect("flush"), FlushOutcome::Idle);
    }

    #[test]
    fn removal_purges_queue_and_interest() {
        let mut pool = pool_with(&[4, 5, 6]);
        pool.broadcast(Handle(4), b"x").expect("x");
        pool.broadcast(Handle(4), b"y").expect("y");

        assert_eq!(pool.remove_connection(Handle(6)).expect("remove"), 2);
        assert!(!pool.contains(Handle(6)));
        assert!(!pool.is_read_interested(Handle(6)));
        assert!(!pool.is_write_interested(Handle(6)));
        assert_eq!(pool.write_interest().collect::<Vec<_>>(), vec![Handle(5)]);
    }

    struct Scripted {
        result: Option<io::Result<usize>>,
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.result.take().unwrap_or(Ok(buf.len()))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted_pool(result: io::Result<usize>) -> ConnectionPool<Scripted> {
        let mut pool = ConnectionPool::new();
        pool.add_connection(Handle(4), Scripted { result: None })
            .expect("add source");
        pool.add_connection(
            Handle(5),
            Scripted {
                result: Some(result),
            },
        )
        .expect("add destination");
        pool.broadcast(Handle(4), b"payload").expect("broadcast");
        pool
    }

    #[test]
    fn short_write_is_a_write_failure() {
        let mut pool = scripted_pool(Ok(3));
        let err = pool.flush_one(Handle(5)).expect_err("short write");
        assert!(matches!(err, PoolError::WriteFailed { handle: Handle(5), .. }));
        assert_eq!(pool.queued_len(Handle(5)), Some(1));
    }

    #[test]
    fn hard_write_error_is_a_write_failure() {
        let mut pool = scripted_pool(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        let err = pool.flush_one(Handle(5)).expect_err("broken pipe");
        match err {
            PoolError::WriteFailed { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn would_block_keeps_message_queued() {
        let mut pool = scripted_pool(Err(io::Error::from(io::ErrorKind::WouldBlock)));
        assert_eq!(pool.flush_one(Handle(5)).expect("flush"), FlushOutcome::Blocked);
        assert_eq!(pool.queued_len(Handle(5)), Some(1));
        assert!(pool.is_write_interested(Handle(5)));

        assert_eq!(
            pool.flush_one(Handle(5)).expect("retry"),
            FlushOutcome::Sent { remaining: 0 }
        );
    }

    #[test]
    fn flushing_unknown_handle_is_not_found() {
        let mut pool = pool_with(&[4]);
        assert!(matches!(
            pool.flush_one(Handle(9)),
            Err(PoolError::NotFound(Handle(9)))
        ));
    }

    #[test]
    fn teardown_releases_everything() {
        let mut pool = pool_with(&[4, 5, 6]);
        pool.watch_listener(Handle(3));
        pool.broadcast(Handle(4), b"one").expect("one");
        pool.broadcast(Handle(5), b"two").expect("two");

        let report = pool.teardown();
        assert_eq!(
            report,
            TeardownReport {
                connections_closed: 3,
                messages_discarded: 4,
            }
        );
        assert!(pool.is_empty());
        assert_eq!(pool.listener(), None);
        assert_eq!(pool.max_handle(), None);
        assert_eq!(pool.read_interest().count(), 0);
        assert_eq!(pool.write_interest().count(), 0);
    }
}
