//! Unidirectional byte relay with bandwidth accounting.

use std::io;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};

use crate::limiter::RateLimiter;

/// How many bytes a relay moves per iteration; also the granularity at
/// which throttling decisions and stop signals take effect.
pub const CHUNK_SIZE: usize = 4096;

/// Copy bytes from `reader` to `writer` until end of stream, pacing each
/// chunk through `limiter` before it is forwarded.
///
/// Returns the number of bytes copied. The relay stops reading as soon
/// as `stop` observes a true value, but a chunk already read is always
/// written out first. On a clean end of stream the writer is shut down
/// so the peer sees the half-close; read and write failures are returned
/// to the caller untouched.
pub async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    limiter: &RateLimiter,
    mut stop: watch::Receiver<bool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        if *stop.borrow() {
            break;
        }

        let n = tokio::select! {
            res = reader.read(&mut buf) => res?,
            _ = stop.changed() => break,
        };
        if n == 0 {
            break;
        }

        limiter.acquire(n).await;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    // Half-close so the peer sees end of stream; if the connection is
    // already torn down there is nothing left to signal.
    let _ = writer.shutdown().await;
    Ok(total)
}
