use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use mio::{Registry, Token, Waker};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Cross-thread stop request for a running relay.
///
/// Requesting shutdown sets a flag and wakes the poller. The relay reads the
/// flag once per dispatch pass, so in-flight reads and writes always finish.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Waker::new(registry, token)?),
        })
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(error) = self.waker.wake() {
            warn!(?error, "failed to wake relay for shutdown");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Turns the first Ctrl-C (SIGINT) into a shutdown request.
///
/// The signal is registered before this returns, so an interrupt that arrives
/// right after cannot fall through to the default handler. The watcher thread
/// is detached; it lives until the signal arrives or the process exits.
pub fn spawn_ctrl_c_watcher(shutdown: ShutdownHandle) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut interrupt = {
        let _guard = runtime.enter();
        signal(SignalKind::interrupt())?
    };

    thread::Builder::new()
        .name("ctrl-c-watcher".into())
        .spawn(move || {
            runtime.block_on(async move {
                if interrupt.recv().await.is_some() {
                    info!("ctrl-c received, stopping relay");
                    shutdown.request();
                } else {
                    warn!("ctrl-c stream closed before any signal arrived");
                }
            });
        })?;
    Ok(())
}
