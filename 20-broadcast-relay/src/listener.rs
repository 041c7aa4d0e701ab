use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpSocket;

/// Pending connections the kernel queues before `accept` catches up.
pub const DEFAULT_BACKLOG: u32 = 5;

/// Opens a non-blocking listening socket on `addr` with an explicit backlog.
///
/// `mio` only binds with its own fixed backlog, so the socket is set up through
/// Tokio's `TcpSocket` on a throwaway runtime and handed over as a std listener.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<mio::net::TcpListener> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to start listener setup runtime")?;

    let listener = runtime.block_on(async move {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to open server socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket
            .listen(backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;
        listener
            .into_std()
            .context("failed to detach listener from setup runtime")
    })?;

    listener
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;
    Ok(mio::net::TcpListener::from_std(listener))
}
