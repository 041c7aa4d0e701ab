//! Single-threaded TCP broadcast relay.
//!
//! Every chunk of bytes a client sends is forwarded verbatim to every other
//! connected client and never echoed back. One thread multiplexes all sockets
//! through a `mio` readiness loop; each connection owns a FIFO of outbound
//! messages, so a slow reader only delays its own queue.
//!
//! - [`cli`] parses the command line into a [`relay::RelayConfig`].
//! - [`listener`] opens the non-blocking listening socket.
//! - [`message`] holds the immutable payload type and the bounded read buffer.
//! - [`connection`] pairs a transport with its outbound queue.
//! - [`pool`] tracks live connections, read/write interest and the highest
//!   watched handle.
//! - [`relay`] runs the readiness loop: accept, read and fan out, flush.
//! - [`shutdown`] lets another thread (or Ctrl-C) stop the loop.
//!
//! Each read is broadcast as one message. Nothing reassembles lines, so a
//! logical message split across two reads arrives as two messages.

pub mod cli;
pub mod connection;
pub mod listener;
pub mod message;
pub mod pool;
pub mod relay;
pub mod shutdown;
