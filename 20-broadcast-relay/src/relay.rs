//! The readiness loop that drives the relay.
//!
//! One thread owns the poller, the listener and the [`ConnectionPool`]. Each
//! cycle re-arms every watched handle from the pool's interest sets, blocks in
//! `Poll::poll` without a timeout, then services the ready handles in
//! ascending order: reads first, then writes, for each handle.

use std::{
    collections::BTreeMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    os::fd::AsRawFd,
};

use anyhow::{Context, Result};
use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, trace, warn};

use crate::{
    listener::{self, DEFAULT_BACKLOG},
    message::{READ_CHUNK_SIZE, ReadBuffer, ReadOutcome},
    pool::{ConnectionPool, FlushOutcome, Handle},
    shutdown::ShutdownHandle,
};

// Socket descriptors never reach this value.
const WAKER_TOKEN: Token = Token(usize::MAX);
const DEFAULT_EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to listen on. Use port 0 for an ephemeral port.
    pub listen: SocketAddr,
    pub backlog: u32,
    /// Upper bound on the bytes taken from a socket per readiness event.
    pub read_chunk_size: usize,
    /// Writes are held back until this many read events have been serviced.
    pub min_events_before_flush: u64,
    pub events_capacity: usize,
}

impl RelayConfig {
    /// Default settings listening on every local interface.
    pub fn on_port(port: u16) -> Self {
        Self {
            listen: (Ipv4Addr::UNSPECIFIED, port).into(),
            ..Self::default()
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: (Ipv4Addr::UNSPECIFIED, 0).into(),
            backlog: DEFAULT_BACKLOG,
            read_chunk_size: READ_CHUNK_SIZE,
            min_events_before_flush: 0,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Idle,
    Waiting,
    Dispatching,
    Terminating,
}

/// What the relay released when it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub connections_closed: usize,
    pub messages_discarded: usize,
    pub read_events: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
}

pub struct Relay {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    listener_handle: Handle,
    pool: ConnectionPool<TcpStream>,
    buffer: ReadBuffer,
    shutdown: ShutdownHandle,
    min_events_before_flush: u64,
    read_events: u64,
    state: DispatchState,
}

impl Relay {
    pub fn bind(config: RelayConfig) -> Result<Self> {
        let buffer = ReadBuffer::try_new(config.read_chunk_size).with_context(|| {
            format!("failed to allocate a {} byte read buffer", config.read_chunk_size)
        })?;
        let poll = Poll::new().context("failed to create poller")?;
        let mut listener = listener::bind(config.listen, config.backlog)?;
        let listener_handle = handle_of(&listener);
        poll.registry()
            .register(&mut listener, token(listener_handle), Interest::READABLE)
            .context("failed to watch listening socket")?;
        let shutdown = ShutdownHandle::new(poll.registry(), WAKER_TOKEN)
            .context("failed to create shutdown waker")?;

        let mut pool = ConnectionPool::new();
        pool.watch_listener(listener_handle);

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            listener,
            listener_handle,
            pool,
            buffer,
            shutdown,
            min_events_before_flush: config.min_events_before_flush,
            read_events: 0,
            state: DispatchState::Idle,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the loop until a shutdown is requested or the wait itself fails.
    ///
    /// A failed wait still tears the pool down before the error is returned.
    pub fn run(mut self) -> Result<RelayReport> {
        loop {
            self.transition(DispatchState::Idle);
            self.arm();

            self.transition(DispatchState::Waiting);
            info!(
                max_handle = ?self.pool.max_handle().map(|handle| handle.0),
                connections = self.pool.len(),
                "waiting for readiness"
            );
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    if self.shutdown.is_requested() {
                        break;
                    }
                    continue;
                }
                let report = self.terminate();
                warn!(?report, "relay stopped after readiness wait failure");
                return Err(err).context("readiness wait failed");
            }

            self.transition(DispatchState::Dispatching);
            let ready = self.collect_ready();
            self.dispatch(ready);

            if self.shutdown.is_requested() {
                break;
            }
        }

        Ok(self.terminate())
    }

    fn transition(&mut self, next: DispatchState) {
        trace!(from = ?self.state, to = ?next, "dispatch state");
        self.state = next;
    }

    fn flush_gate_open(&self) -> bool {
        self.read_events >= self.min_events_before_flush
    }

    /// Re-registers every watched handle with its current interest.
    ///
    /// mio reports readiness edge-triggered; re-registering before each wait
    /// makes a still-ready handle show up again, like `select` would.
    fn arm(&mut self) {
        let registry = self.poll.registry();
        if let Err(error) = registry.reregister(
            &mut self.listener,
            token(self.listener_handle),
            Interest::READABLE,
        ) {
            warn!(?error, "failed to re-arm listening socket");
        }

        let flush_open = self.flush_gate_open();
        let handles: Vec<Handle> = self.pool.handles().collect();
        let mut broken = Vec::new();
        for handle in handles {
            let interest = if flush_open && self.pool.is_write_interested(handle) {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let Some(stream) = self.pool.transport_mut(handle) else {
                continue;
            };
            if let Err(error) = registry.reregister(stream, token(handle), interest) {
                warn!(%handle, ?error, "failed to re-arm connection");
                broken.push(handle);
            }
        }

        for handle in broken {
            self.close_connection(handle);
        }
    }

    fn collect_ready(&self) -> BTreeMap<Handle, Readiness> {
        let mut ready: BTreeMap<Handle, Readiness> = BTreeMap::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let entry = ready.entry(Handle(event.token().0)).or_default();
            // Errors and hang-ups surface through the next read.
            entry.readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            entry.writable |= event.is_writable();
        }
        ready
    }

    fn dispatch(&mut self, ready: BTreeMap<Handle, Readiness>) {
        trace!(ready = ready.len(), "dispatching ready handles");

        for (handle, readiness) in ready {
            if handle == self.listener_handle {
                if readiness.readable {
                    self.read_events += 1;
                    self.accept();
                }
                continue;
            }

            if readiness.readable {
                self.read_events += 1;
                self.service_read(handle);
            }
            if readiness.writable && self.flush_gate_open() && self.pool.contains(handle) {
                self.service_write(handle);
            }
        }
    }

    fn accept(&mut self) {
        match self.listener.accept() {
            Ok((mut stream, peer)) => {
                let handle = handle_of(&stream);
                info!(%handle, %peer, "new incoming connection");
                if let Err(error) =
                    self.poll
                        .registry()
                        .register(&mut stream, token(handle), Interest::READABLE)
                {
                    warn!(%handle, ?error, "failed to watch accepted connection");
                    return;
                }
                if let Err(error) = self.pool.add_connection(handle, stream) {
                    warn!(%handle, %error, "failed to register accepted connection");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!("listener had nothing to accept");
            }
            Err(error) => warn!(?error, "failed to accept connection"),
        }
    }

    fn service_read(&mut self, handle: Handle) {
        let Some(stream) = self.pool.transport_mut(handle) else {
            warn!(%handle, "readable handle is not in the pool");
            return;
        };

        debug!(%handle, "descriptor is readable");
        match self.buffer.read_from(stream) {
            Ok(ReadOutcome::Data(bytes)) => {
                info!(%handle, bytes = bytes.len(), "bytes received");
                match self.pool.broadcast(handle, bytes) {
                    Ok(destinations) => debug!(%handle, destinations, "message fanned out"),
                    Err(error) => warn!(%handle, %error, "dropping message"),
                }
            }
            Ok(ReadOutcome::Closed) => {
                info!(%handle, "connection closed by peer");
                self.close_connection(handle);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                trace!(%handle, "spurious read readiness");
            }
            Err(error) => {
                warn!(%handle, ?error, "read failed");
                self.close_connection(handle);
            }
        }
    }

    fn service_write(&mut self, handle: Handle) {
        match self.pool.flush_one(handle) {
            Ok(FlushOutcome::Sent { remaining }) => {
                debug!(%handle, remaining, "message delivered");
            }
            Ok(FlushOutcome::Blocked) => trace!(%handle, "write would block"),
            Ok(FlushOutcome::Idle) => {}
            Err(error) => {
                warn!(%handle, error = ?anyhow::Error::from(error), "write failed");
                self.close_connection(handle);
            }
        }
    }

    fn close_connection(&mut self, handle: Handle) {
        if let Some(stream) = self.pool.transport_mut(handle) {
            if let Err(error) = self.poll.registry().deregister(stream) {
                debug!(%handle, ?error, "failed to deregister connection");
            }
        }

        info!(%handle, "removing connection");
        match self.pool.remove_connection(handle) {
            Ok(discarded) if discarded > 0 => {
                debug!(%handle, discarded, "discarded undelivered messages");
            }
            Ok(_) => {}
            Err(error) => warn!(%handle, %error, "connection was already gone"),
        }
    }

    fn terminate(&mut self) -> RelayReport {
        self.transition(DispatchState::Terminating);

        let handles: Vec<Handle> = self.pool.handles().collect();
        for handle in handles {
            info!(%handle, "removing connection");
            if let Some(stream) = self.pool.transport_mut(handle) {
                if let Err(error) = self.poll.registry().deregister(stream) {
                    debug!(%handle, ?error, "failed to deregister connection");
                }
            }
        }
        let teardown = self.pool.teardown();

        if let Err(error) = self.poll.registry().deregister(&mut self.listener) {
            debug!(?error, "failed to deregister listening socket");
        }
        info!(handle = %self.listener_handle, "closing listening socket");

        RelayReport {
            connections_closed: teardown.connections_closed,
            messages_discarded: teardown.messages_discarded,
            read_events: self.read_events,
        }
    }
}

fn handle_of<S: AsRawFd>(source: &S) -> Handle {
    // Open descriptors are never negative.
    Handle(source.as_raw_fd() as usize)
}

fn token(handle: Handle) -> Token {
    Token(handle.0)
}
