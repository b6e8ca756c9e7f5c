//! Listening socket ownership, the accept loop, and the server
//! lifecycle.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{
    net::{TcpListener, TcpSocket},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    handler::ConnectionHandler,
    limiter::RateLimiter,
    settings::{Destination, Settings},
    Error, Result,
};

/// Listen backlog for the accepting socket.
const BACKLOG: u32 = 1024;

/// The proxy server: owns the listening socket while running, and the
/// rate limiter shared by every connection it accepts.
///
/// The lifecycle is start → stop → (optionally) start again; each start
/// binds a fresh listening socket from the same immutable [`Settings`]
/// snapshot.
pub struct ProxyServer {
    settings: Settings,
    state: Mutex<Option<Running>>,
}

/// Handles held while the server is between `start` and `stop`.
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    /// Completion tracker: every connection handler holds a clone of the
    /// sender half and drops it on exit; `recv` yields `None` once all
    /// of them are gone.
    done: mpsc::Receiver<()>,
}

impl ProxyServer {
    /// Create a server from an immutable settings snapshot. Nothing is
    /// bound until [`start`](Self::start) is called.
    pub fn new(settings: Settings) -> Self {
        ProxyServer {
            settings,
            state: Mutex::new(None),
        }
    }

    /// Bind the listening socket and begin accepting connections.
    ///
    /// Returns the bound address, which is how callers learn the actual
    /// port when the settings asked for port 0. Fails with
    /// [`Error::NoDestination`] when no destination is configured and
    /// with [`Error::Bind`] when the port cannot be bound; either way
    /// the server stays stopped. Calling `start` on a server that is
    /// already running is a no-op returning the existing address.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut state = self.lock_state();
        if let Some(running) = state.as_ref() {
            if !running.accept.is_finished() {
                return Ok(running.local_addr);
            }
        }

        let destination = self
            .settings
            .destination
            .clone()
            .ok_or(Error::NoDestination)?;
        let listener = bind(self.settings.listen_port)?;
        let local_addr = listener.local_addr().map_err(Error::Bind)?;

        match self.settings.bytes_per_second {
            0 => tracing::info!("proxy listening on {local_addr}, forwarding to {destination} unthrottled"),
            ceiling => tracing::info!(
                "proxy listening on {local_addr}, forwarding to {destination} at {ceiling} bytes/sec"
            ),
        }

        let limiter = Arc::new(RateLimiter::new(self.settings.bytes_per_second));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (done_tx, done) = mpsc::channel(1);
        let accept = tokio::spawn(accept_loop(
            listener,
            destination,
            limiter,
            shutdown_rx,
            done_tx,
        ));

        *state = Some(Running {
            local_addr,
            shutdown,
            accept,
            done,
        });
        Ok(local_addr)
    }

    /// Stop accepting new connections and wait for the in-flight ones.
    ///
    /// The listening socket closes right away; active handlers flush the
    /// chunk they are working on and exit. Returns only once every
    /// handler is done. Safe to call from any task; stopping a server
    /// that is not running does nothing.
    pub async fn stop(&self) {
        let Some(mut running) = self.lock_state().take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        let _ = running.accept.await;
        while running.done.recv().await.is_some() {}

        tracing::info!("proxy on {} stopped", running.local_addr);
    }

    /// Whether the server currently owns a listening socket.
    pub fn is_running(&self) -> bool {
        self.lock_state()
            .as_ref()
            .is_some_and(|running| !running.accept.is_finished())
    }

    /// The bound listening address, when running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().as_ref().map(|running| running.local_addr)
    }

    /// The settings snapshot this server was built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = TcpSocket::new_v4().map_err(Error::Bind)?;
    socket.set_reuseaddr(true).map_err(Error::Bind)?;
    socket.bind(addr).map_err(Error::Bind)?;
    socket.listen(BACKLOG).map_err(Error::Bind)
}

async fn accept_loop(
    listener: TcpListener,
    destination: Destination,
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
    done: mpsc::Sender<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!("failed to accept connection: {err}");
                    continue;
                }
            },
        };

        tracing::debug!("accepted connection from {peer}");
        let _ = stream.set_nodelay(true);

        let handler =
            ConnectionHandler::new(destination.clone(), limiter.clone(), shutdown.clone());
        let done = done.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle(stream, peer).await {
                tracing::error!("connection from {peer} failed: {err}");
            }
            drop(done);
        });
    }
    // Dropping the listener here releases the port before stop() returns.
}
