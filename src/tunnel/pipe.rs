use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PIPE_BUFFER_SIZE: usize = 32 * 1024;

/// Copy until EOF, adding every chunk to `counter` as soon as it is written.
/// EOF on the reader is passed on as a write shutdown.
pub async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Which side of a pipe went away first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Local,
    Remote,
}

/// Pipe a local socket and a forwarded channel into each other. Bytes read
/// from `local` count as outbound, bytes read from `remote` as inbound.
///
/// The first direction to hit EOF or an error ends the pipe: both writers
/// are shut down and both streams dropped, so a client that hangs up never
/// leaves the channel open behind it.
pub async fn pipe<L, R>(local: L, remote: R, bytes_out: &AtomicU64, bytes_in: &AtomicU64) -> io::Result<PipeEnd>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let result = tokio::select! {
        res = copy_counted(&mut local_read, &mut remote_write, bytes_out) => res.map(|_| PipeEnd::Local),
        res = copy_counted(&mut remote_read, &mut local_write, bytes_in) => res.map(|_| PipeEnd::Remote),
    };
    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pipe_preserves_order_and_counts_both_ways() {
        let (local, mut client) = duplex(64);
        let (remote, mut server) = duplex(64);
        let out = AtomicU64::new(0);
        let inbound = AtomicU64::new(0);

        let peer = async {
            let payload: Vec<u8> = (0..200u8).collect();
            client.write_all(&payload).await.unwrap();

            let mut seen = vec![0u8; payload.len()];
            server.read_exact(&mut seen).await.unwrap();
            assert_eq!(seen, payload);
            server.write_all(b"done").await.unwrap();

            let mut reply = [0u8; 4];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"done");
            drop(client);

            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };

        let (piped, ()) = tokio::join!(pipe(local, remote, &out, &inbound), peer);
        assert_eq!(piped.unwrap(), PipeEnd::Local);
        assert_eq!(out.load(Ordering::Relaxed), 200);
        assert_eq!(inbound.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn remote_hangup_closes_local_side_while_client_stays_open() {
        let (local, mut client) = duplex(64);
        let (remote, server) = duplex(64);
        let out = AtomicU64::new(0);
        let inbound = AtomicU64::new(0);

        let peer = async {
            drop(server);
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };

        let (piped, ()) = tokio::join!(pipe(local, remote, &out, &inbound), peer);
        assert_eq!(piped.unwrap(), PipeEnd::Remote);
    }
}
