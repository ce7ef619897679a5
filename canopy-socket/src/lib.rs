//! JSON-lines framing over the Canopy control socket.
//!
//! Both sides of the protocol exchange newline-delimited JSON values.
//! The daemon reads [`read_message`] / writes [`write_message`] per
//! connection; the CLI wraps a connected stream in a [`LineClient`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Upper bound on a single protocol line. Anything larger is a client bug
/// (log lines are truncated well below this).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Read one newline-terminated JSON message. Returns `Ok(None)` on a clean
/// EOF before any bytes of a new message.
pub async fn read_message<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_message_with_limit(reader, MAX_MESSAGE_BYTES).await
}

pub async fn read_message_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message exceeds {max_bytes} bytes ({} read)", buf.len()),
        ));
    }

    let text = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    serde_json::from_str::<T>(text)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Serialize `value` as one JSON line.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// A request/response client over a connected control socket.
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    pub fn new(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }

    /// Send one request and wait for one response.
    pub async fn request<Req, Resp>(&mut self, req: &Req) -> std::io::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send(req).await?;
        self.recv().await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the connection before responding",
            )
        })
    }

    pub async fn send<Req: Serialize>(&mut self, req: &Req) -> std::io::Result<()> {
        write_message(&mut self.writer, req).await
    }

    pub async fn recv<Resp: DeserializeOwned>(&mut self) -> std::io::Result<Option<Resp>> {
        read_message(&mut self.reader).await
    }
}
