use std::collections::{TryReserveError, VecDeque};

use crate::{message::Message, pool::Handle};

/// Slots reserved up front for a new connection's queue.
const INITIAL_QUEUE_CAPACITY: usize = 4;

/// Messages waiting to be written to one connection, oldest first.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<Message>,
}

impl OutboundQueue {
    pub fn with_reserved() -> Result<Self, TryReserveError> {
        let mut messages = VecDeque::new();
        messages.try_reserve(INITIAL_QUEUE_CAPACITY)?;
        Ok(Self { messages })
    }

    /// Appends behind every message already pending.
    pub fn push(&mut self, message: Message) -> Result<(), TryReserveError> {
        self.messages.try_reserve(1)?;
        self.messages.push_back(message);
        Ok(())
    }

    pub fn front(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Drops every pending message and returns how many there were.
    pub fn purge(&mut self) -> usize {
        let purged = self.messages.len();
        self.messages.clear();
        purged
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// One accepted client: its handle, its transport, and what it still owes.
#[derive(Debug)]
pub struct Connection<S> {
    handle: Handle,
    transport: S,
    queue: OutboundQueue,
}

impl<S> Connection<S> {
    pub fn new(handle: Handle, transport: S) -> Result<Self, TryReserveError> {
        Ok(Self {
            handle,
            transport,
            queue: OutboundQueue::with_reserved()?,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn transport_mut(&mut self) -> &mut S {
        &mut self.transport
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OutboundQueue {
        &mut self.queue
    }

    /// Splits the connection so the transport can be written while the queue
    /// head is borrowed.
    pub(crate) fn parts_mut(&mut self) -> (&mut S, &mut OutboundQueue) {
        (&mut self.transport, &mut self.queue)
    }
}
