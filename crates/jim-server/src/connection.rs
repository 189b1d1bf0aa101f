//! A client socket owned by the event loop.

use crate::metrics::ConnectionMetricsGuard;
use bytes::{Buf, BytesMut};
use jim_core::ConnectionId;
use jim_protocol::{codec, Envelope, ProtocolError, MAX_FRAME_SIZE};
use std::io;
use std::net::SocketAddr;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

/// Bytes pulled from one socket before yielding to the others.
const READ_BUDGET: usize = 16 * MAX_FRAME_SIZE;

/// Unflushed output above which a connection stops being read.
pub const MAX_PENDING_OUTPUT: usize = 64 * MAX_FRAME_SIZE;

/// Result of draining a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Socket still open.
    Open,
    /// Peer closed its side.
    Eof,
}

/// A live connection with its buffers.
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Close once pending output is flushed; further input is ignored.
    pub closing: bool,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    _metrics: ConnectionMetricsGuard,
}

impl Connection {
    /// Wrap an accepted stream.
    #[must_use]
    pub fn new(id: ConnectionId, stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            closing: false,
            stream,
            read_buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
            write_buf: BytesMut::new(),
            _metrics: ConnectionMetricsGuard::new(),
        }
    }

    /// Readiness the event loop waits for.
    ///
    /// Readable while input is accepted, writable while output is pending.
    #[must_use]
    pub fn interest(&self) -> Interest {
        match (self.accepts_input(), self.write_buf.is_empty()) {
            (true, true) => Interest::READABLE,
            (true, false) => Interest::READABLE | Interest::WRITABLE,
            (false, _) => Interest::WRITABLE,
        }
    }

    /// Wait for the socket to match [`Connection::interest`].
    pub async fn ready(&self) -> io::Result<Ready> {
        self.stream.ready(self.interest()).await
    }

    /// Whether new requests are read.
    ///
    /// A closing connection reads nothing more, and a peer that leaves
    /// replies unread is not read until its backlog drains.
    #[must_use]
    pub fn accepts_input(&self) -> bool {
        !self.closing && !self.is_backlogged()
    }

    /// Whether unflushed output has reached [`MAX_PENDING_OUTPUT`].
    #[must_use]
    pub fn is_backlogged(&self) -> bool {
        self.write_buf.len() >= MAX_PENDING_OUTPUT
    }

    /// Read whatever the socket has without blocking.
    ///
    /// # Errors
    ///
    /// Returns any error other than `WouldBlock`.
    pub fn fill(&mut self) -> io::Result<ReadStatus> {
        let mut total = 0;
        while total < READ_BUDGET {
            self.read_buf.reserve(MAX_FRAME_SIZE);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadStatus::Open)
    }

    /// Decode the next buffered frame, if complete.
    ///
    /// # Errors
    ///
    /// Returns the codec error for a bad frame.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        codec::decode_from(&mut self.read_buf)
    }

    /// Append an envelope to the output buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn enqueue(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        codec::encode_into(envelope, &mut self.write_buf)
    }

    /// Whether output is waiting for the socket.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Write as much pending output as the socket takes.
    ///
    /// A full socket buffer is not an error; the rest stays pending.
    ///
    /// # Errors
    ///
    /// Returns any error other than `WouldBlock`.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.try_write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jim_protocol::Response;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn test_backlog_pauses_input() {
        let (stream, mut peer) = pair().await;
        let addr = stream.peer_addr().unwrap();
        let mut conn = Connection::new(ConnectionId::next(), stream, addr);
        assert!(conn.accepts_input());
        assert!(conn.interest() == Interest::READABLE);

        let reply = Envelope::Response(Response::accepted(vec!["alice".into()]));
        let frame_len = codec::encode(&reply).unwrap().len();
        let mut frames = 0;
        while !conn.is_backlogged() {
            conn.enqueue(&reply).unwrap();
            frames += 1;
        }
        assert!(!conn.accepts_input());
        assert!(conn.interest() == Interest::WRITABLE);

        // Once the peer catches up, input resumes
        let total = frames * frame_len;
        let reader = tokio::spawn(async move {
            let mut received = vec![0; total];
            peer.read_exact(&mut received).await.unwrap();
        });
        while conn.has_pending_output() {
            conn.flush().unwrap();
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
        assert!(conn.accepts_input());
        assert!(conn.interest() == Interest::READABLE);
    }

    #[tokio::test]
    async fn test_closing_only_waits_for_output() {
        let (stream, _peer) = pair().await;
        let addr = stream.peer_addr().unwrap();
        let mut conn = Connection::new(ConnectionId::next(), stream, addr);

        conn.closing = true;
        assert!(!conn.accepts_input());
        assert!(conn.interest() == Interest::WRITABLE);
    }
}
