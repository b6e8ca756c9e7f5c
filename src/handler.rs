//! Per-connection forwarding logic.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{lookup_host, TcpStream},
    sync::watch,
    time::timeout,
};

use crate::{limiter::RateLimiter, relay::relay, settings::Destination, Error, Result};

/// How long a single upstream connection attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles one accepted client connection: dials the destination, relays
/// both directions through the shared limiter, and closes both sockets
/// when the exchange is over.
pub struct ConnectionHandler {
    destination: Destination,
    limiter: Arc<RateLimiter>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub fn new(
        destination: Destination,
        limiter: Arc<RateLimiter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ConnectionHandler {
            destination,
            limiter,
            shutdown,
        }
    }

    /// Run the connection to completion.
    ///
    /// A failed dial closes the inbound socket immediately and reports
    /// the failure; nothing is retried. Once both relays are up, each
    /// direction finishes independently — a fully sent request body does
    /// not cut off a response still streaming the other way. An I/O
    /// error on either direction tears the whole connection down, since
    /// the exchange is no longer coherent once one side fails.
    pub async fn handle(self, inbound: TcpStream, peer: SocketAddr) -> Result<()> {
        let ConnectionHandler {
            destination,
            limiter,
            mut shutdown,
        } = self;

        let outbound = match dial(&destination).await {
            Ok(stream) => stream,
            Err(source) => {
                // Dropping the inbound socket is the only signal the
                // client gets.
                drop(inbound);
                return Err(Error::Connect {
                    destination,
                    source,
                });
            }
        };

        tracing::debug!("relaying {peer} <-> {destination}");

        let (client_rd, client_wr) = inbound.into_split();
        let (upstream_rd, upstream_wr) = outbound.into_split();
        let (stop_tx, stop_rx) = watch::channel(false);

        let client_to_upstream = async {
            let res = relay(client_rd, upstream_wr, &limiter, stop_rx.clone()).await;
            if res.is_err() {
                // The exchange is broken; unblock the sibling relay too.
                let _ = stop_tx.send(true);
            }
            res
        };
        let upstream_to_client = async {
            let res = relay(upstream_rd, client_wr, &limiter, stop_rx.clone()).await;
            if res.is_err() {
                let _ = stop_tx.send(true);
            }
            res
        };

        let links = async { tokio::join!(client_to_upstream, upstream_to_client) };
        tokio::pin!(links);

        let finished = tokio::select! {
            res = &mut links => Some(res),
            _ = shutdown.changed() => None,
        };
        let (sent, received) = match finished {
            Some(res) => res,
            None => {
                // Server is stopping: let both relays flush the chunk
                // they are working on, then finish.
                let _ = stop_tx.send(true);
                links.await
            }
        };

        match (sent, received) {
            (Ok(sent), Ok(received)) => {
                tracing::info!("client {peer} wrote {sent} bytes and received {received} bytes");
                Ok(())
            }
            (Err(err), _) | (_, Err(err)) => Err(Error::Relay(err)),
        }
    }
}

/// Resolve the destination and try each address in order; the first
/// connection to succeed wins, with one bounded attempt per address.
async fn dial(destination: &Destination) -> io::Result<TcpStream> {
    let addrs = lookup_host((destination.host(), destination.port())).await?;

    let mut last_err = None;
    for addr in addrs {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(err)) => last_err = Some(err),
            Err(_) => {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "destination resolved to no addresses",
        )
    }))
}
