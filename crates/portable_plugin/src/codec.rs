//! Newline-delimited JSON framing shared by host and plugin.
//!
//! Every frame is exactly one line of compact JSON. Blank lines are skipped so
//! a stray `\n` from either side never desynchronizes the stream.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame must not contain a newline")]
    EmbeddedNewline,
}

pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next non-empty line, or `None` once the peer closed the stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, CodecError> {
        while let Some(line) = self.lines.next_line().await? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        match self.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

/// Write an already encoded frame followed by the line terminator.
pub async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError> {
    if payload.contains(&b'\n') {
        return Err(CodecError::EmbeddedNewline);
    }
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(frame)?;
    write_raw(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Ack, Handshake};

    #[tokio::test]
    async fn frames_survive_blank_lines() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(server);

        write_frame(&mut client, &Handshake { name: "p1".into(), pid: 7 }).await.unwrap();
        client.write_all(b"\n\n").await.unwrap();
        write_frame(&mut client, &Ack::ok()).await.unwrap();
        drop(client);

        let hs: Handshake = reader.read().await.unwrap().unwrap();
        assert_eq!(hs.name, "p1");
        let ack: Ack = reader.read().await.unwrap().unwrap();
        assert!(ack.ok);
        assert!(reader.read::<Ack>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_frames_reject_newlines() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = write_raw(&mut client, b"{\"a\":\n1}").await.unwrap_err();
        assert!(matches!(err, CodecError::EmbeddedNewline));
    }
}
