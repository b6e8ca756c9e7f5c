use std::net::SocketAddr;

use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use dialup::{
    server::ProxyServer,
    settings::{Destination, Settings},
};

/// Spawn an upstream that echoes every byte back to the sender.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    addr
}

/// Spawn an upstream that consumes everything it receives and reports
/// each connection's bytes on the returned channel once it closes.
pub async fn spawn_sink_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = socket.read_to_end(&mut received).await;
                let _ = tx.send(received);
            });
        }
    });

    (addr, rx)
}

/// Settings pointing at `upstream`, listening on an ephemeral port.
pub fn test_settings(upstream: SocketAddr, bytes_per_second: u64) -> Settings {
    Settings {
        listen_port: 0,
        destination: Some(Destination::new(upstream.ip().to_string(), upstream.port())),
        bytes_per_second,
    }
}

/// Connect one client through a started proxy.
pub async fn connect_through(server: &ProxyServer) -> TcpStream {
    let addr = server.local_addr().expect("server not started");
    let client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    client.set_nodelay(true).unwrap();
    client
}
