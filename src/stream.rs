//! Buffered, message-framed access to a PostgreSQL connection.

use crate::protocol::{self, Message};

use bytes::{Buf, BytesMut};
use derive_where::derive_where;
use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const INITIAL_CAPACITY: usize = 8 * 1024;

/// A connection which reads and writes whole protocol messages.
///
/// Reads are cancel-safe: if a call to [PgStream::read_message] is dropped
/// while waiting for more bytes, everything received so far stays in the
/// read buffer for the next call.
///
/// Writes are buffered until [PgStream::flush] is called.
#[derive_where(Debug)]
pub struct PgStream<S> {
    #[derive_where(skip)]
    io: S,
    rbuf: BytesMut,
    wbuf: BytesMut,
    eof: bool,
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}

impl<S: AsyncRead + AsyncWrite + Unpin> PgStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            rbuf: BytesMut::with_capacity(INITIAL_CAPACITY),
            wbuf: BytesMut::with_capacity(INITIAL_CAPACITY),
            eof: false,
        }
    }

    /// Appends bytes to the write buffer without flushing.
    pub fn put(&mut self, bytes: &[u8]) {
        self.wbuf.extend_from_slice(bytes);
    }

    /// Access to the write buffer, for the encoders in [protocol].
    pub fn write_buf(&mut self) -> &mut BytesMut {
        &mut self.wbuf
    }

    /// The number of bytes waiting to be flushed.
    pub fn pending_write(&self) -> usize {
        self.wbuf.len()
    }

    /// Writes out everything buffered by [PgStream::put].
    pub async fn flush(&mut self) -> io::Result<()> {
        while self.wbuf.has_remaining() {
            self.io.write_all_buf(&mut self.wbuf).await?;
        }
        self.io.flush().await
    }

    /// Buffers `bytes` and flushes them.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.put(bytes);
        self.flush().await
    }

    // Reads more bytes into the read buffer, failing on EOF.
    async fn fill(&mut self) -> io::Result<()> {
        if self.eof {
            return Err(unexpected_eof());
        }
        let n = self.io.read_buf(&mut self.rbuf).await?;
        if n == 0 {
            self.eof = true;
            return Err(unexpected_eof());
        }
        Ok(())
    }

    /// Reads the next whole message.
    pub async fn read_message(&mut self) -> io::Result<Message> {
        loop {
            if let Some(msg) = protocol::split_message(&mut self.rbuf)? {
                return Ok(msg);
            }
            self.fill().await?;
        }
    }

    /// Reads the next startup packet, which unlike other messages carries
    /// no tag.
    pub async fn read_startup(&mut self) -> io::Result<BytesMut> {
        loop {
            if let Some(packet) = protocol::split_startup(&mut self.rbuf)? {
                return Ok(packet);
            }
            self.fill().await?;
        }
    }

    /// Reads a single byte, such as the answer to an SSLRequest.
    pub async fn read_byte(&mut self) -> io::Result<u8> {
        while self.rbuf.is_empty() {
            self.fill().await?;
        }
        Ok(self.rbuf.get_u8())
    }

    /// Returns true if anything has been received but not yet consumed.
    pub fn has_buffered(&self) -> bool {
        !self.rbuf.is_empty()
    }

    /// Checks if the peer is still connected, without blocking.
    ///
    /// Any bytes which happen to be available are kept in the read buffer.
    pub fn is_connected(&mut self) -> bool {
        if self.eof {
            return false;
        }
        match self.io.read_buf(&mut self.rbuf).now_or_never() {
            None => true,
            Some(Ok(0)) => {
                self.eof = true;
                false
            }
            Some(Ok(_)) => true,
            Some(Err(_)) => false,
        }
    }

    /// Returns the underlying connection.
    ///
    /// Fails if bytes are still buffered in either direction, since they
    /// would be lost.
    pub fn into_inner(self) -> Result<S, Self> {
        if self.rbuf.is_empty() && self.wbuf.is_empty() {
            Ok(self.io)
        } else {
            Err(self)
        }
    }

    /// Shuts down the write half of the connection.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}
