use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn timed_out(what: &str, limit: Duration) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out after {:?}", what, limit))
}

/// Read exactly `len` bytes within `limit` or fail
pub async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: usize,
    limit: Duration,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    match tokio::time::timeout(limit, reader.read_exact(&mut buf)).await {
        Ok(result) => {
            result?;
            Ok(buf)
        }
        Err(_) => Err(timed_out("read", limit)),
    }
}

/// Write all bytes within `limit` or fail
pub async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
    limit: Duration,
) -> io::Result<()> {
    let io = async {
        writer.write_all(buf).await?;
        writer.flush().await
    };
    match tokio::time::timeout(limit, io).await {
        Ok(result) => result,
        Err(_) => Err(timed_out("write", limit)),
    }
}
