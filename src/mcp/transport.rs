//! Newline-delimited JSON transport.
//!
//! This module implements the stdio framing used by MCP tool servers:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - The process's stdin receives requests, its stdout carries responses
//! - stderr is diagnostics only and never passes through this type
//!
//! # Cancellation
//!
//! Reads are cancel-safe: bytes of a partially received line are kept in an
//! internal buffer when a read is abandoned (for example when a call times
//! out), so the next read resumes mid-line instead of losing data.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// A line-framed JSON transport over an arbitrary reader/writer pair.
pub struct LineTransport<R, W> {
    /// Buffered reader for incoming lines.
    reader: BufReader<R>,
    /// Sink for outgoing lines.
    writer: W,
    /// Bytes of a line whose newline has not arrived yet.
    pending: Vec<u8>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a new transport.
    #[must_use]
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            pending: Vec::new(),
        }
    }

    /// Reads the next message line.
    ///
    /// Returns `None` if the reader is closed (EOF). A fragment that was cut
    /// short by EOF is returned as a final line.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the line is not valid UTF-8.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let bytes_read = self.reader.read_until(b'\n', &mut self.pending).await?;

        if bytes_read == 0 && !self.pending.ends_with(b"\n") {
            self.pending.clear();
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.pending);
        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        }

        String::from_utf8(line)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Serialises `message` and writes it as one line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message<T: Serialize + Sync>(&mut self, message: &T) -> io::Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.write_raw(&json).await
    }

    /// Writes a raw JSON string with newline termination.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    async fn write_raw(&mut self, json: &str) -> io::Result<()> {
        // Messages must not contain embedded newlines
        debug_assert!(
            !json.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Flushes and shuts down the writing half, signalling EOF to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
