//! Per-connection handler.
//!
//! One [`Connection`] is created for every accepted client and driven through
//!
//! ```text
//! Receiving -> AppendingAndReading -> Responding -> Closed
//!      \______________\___________________\________-> Error
//! ```
//!
//! A message ends at the first line feed or when the peer closes its side of
//! the connection. The whole message is appended to the [`LogStore`] and the
//! complete log, as it stands right after that append, is sent back. Any
//! failure ends this connection only; nothing propagates to the acceptor.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::store::LogStore;

/// Message terminator.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Phase of a connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading the client's message
    Receiving,
    /// Appending the message and snapshotting the log
    AppendingAndReading,
    /// Sending the snapshot back
    Responding,
    /// Finished normally
    Closed,
    /// Finished with an error
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Receiving => write!(f, "Receiving"),
            Self::AppendingAndReading => write!(f, "AppendingAndReading"),
            Self::Responding => write!(f, "Responding"),
            Self::Closed => write!(f, "Closed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// One accepted client.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    stream: TcpStream,
    /// Receive buffer; its length is the number of bytes received so far
    buffer: Vec<u8>,
    /// Minimum growth step for the receive buffer
    initial_capacity: usize,
    state: ConnectionState,
    sent: usize,
}

impl Connection {
    /// Wrap an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceExhausted` error if the initial receive buffer
    /// cannot be allocated.
    pub fn new(stream: TcpStream, peer: SocketAddr, initial_capacity: usize) -> Result<Self> {
        let initial_capacity = initial_capacity.max(1);
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(initial_capacity).map_err(|e| {
            Error::resource_exhausted(
                "receive buffer",
                format!("cannot allocate {initial_capacity} bytes for {peer}: {e}"),
            )
        })?;

        Ok(Self {
            peer,
            stream,
            buffer,
            initial_capacity,
            state: ConnectionState::Receiving,
            sent: 0,
        })
    }

    /// Remote address of the client.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of message bytes received so far.
    #[must_use]
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Run the connection to completion.
    ///
    /// The transport is released when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the connection-scoped error that moved the connection into
    /// the `Error` state. It has already been logged.
    #[instrument(name = "connection", skip_all, fields(peer = %self.peer))]
    pub async fn serve(mut self, store: &LogStore) -> Result<()> {
        let result = self.process(store).await;

        match &result {
            Ok(()) => self.transition(ConnectionState::Closed),
            Err(e) => {
                self.transition(ConnectionState::Error);
                warn!(
                    peer = %self.peer,
                    error = %e,
                    code = %e.code(),
                    "Connection failed"
                );
            }
        }

        info!(
            received = self.received(),
            sent = self.sent,
            "Closed connection from {}",
            self.peer.ip()
        );
        result
    }

    async fn process(&mut self, store: &LogStore) -> Result<()> {
        self.receive().await?;

        self.transition(ConnectionState::AppendingAndReading);
        let mut snapshot = Vec::new();
        store.append_and_snapshot(&self.buffer, &mut snapshot).await?;

        self.transition(ConnectionState::Responding);
        self.respond(&snapshot).await
    }

    /// Read until a line terminator arrives or the peer closes.
    async fn receive(&mut self) -> Result<()> {
        loop {
            self.ensure_spare_capacity()?;

            let start = self.buffer.len();
            let n = self.stream.read_buf(&mut self.buffer).await.map_err(|e| {
                Error::transport(
                    ErrorCode::TransportRead,
                    "Failed to receive from client",
                    Some(self.peer),
                    e,
                )
            })?;

            if n == 0 {
                debug!(received = self.received(), "Peer closed before line terminator");
                return Ok(());
            }

            trace!(bytes = n, total = self.received(), "Received data");
            if self.buffer[start..].contains(&LINE_TERMINATOR) {
                return Ok(());
            }
        }
    }

    /// Keep capacity strictly above the bytes already received so every
    /// read has room and nothing previously received is overwritten.
    fn ensure_spare_capacity(&mut self) -> Result<()> {
        if self.buffer.capacity() > self.buffer.len() {
            return Ok(());
        }

        let additional = self.buffer.capacity().max(self.initial_capacity);
        self.buffer.try_reserve(additional).map_err(|e| {
            Error::resource_exhausted(
                "receive buffer",
                format!(
                    "cannot grow beyond {} bytes for {}: {e}",
                    self.buffer.len(),
                    self.peer
                ),
            )
        })?;

        trace!(capacity = self.buffer.capacity(), "Receive buffer grown");
        Ok(())
    }

    async fn respond(&mut self, snapshot: &[u8]) -> Result<()> {
        let peer = self.peer;
        let send_error = |e| {
            Error::transport(
                ErrorCode::TransportWrite,
                "Failed to send log to client",
                Some(peer),
                e,
            )
        };

        self.stream.write_all(snapshot).await.map_err(send_error)?;
        self.stream.flush().await.map_err(send_error)?;
        self.sent = snapshot.len();
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(from = %self.state, to = %next, "Connection state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    /// Accept one connection on an ephemeral port and serve it against `store`.
    async fn serve_one(
        store: std::sync::Arc<LogStore>,
        initial_capacity: usize,
    ) -> (SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let connection = Connection::new(stream, peer, initial_capacity)?;
            assert_eq!(connection.state(), ConnectionState::Receiving);
            connection.serve(&store).await
        });
        (addr, task)
    }

    async fn exchange(addr: SocketAddr, message: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(message).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_message_is_appended_and_echoed_with_log() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let dir = tempdir().expect("Failed to create temporary directory");
            let store = std::sync::Arc::new(LogStore::create(dir.path().join("log"), false).unwrap());
            store.append(b"earlier\n").await.unwrap();

            let (addr, task) = serve_one(store.clone(), 1024).await;
            let response = exchange(addr, b"hello\n").await;
            task.await.unwrap().unwrap();

            assert_eq!(response, b"earlier\nhello\n");
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_buffer_grows_past_initial_capacity() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let dir = tempdir().expect("Failed to create temporary directory");
            let store = std::sync::Arc::new(LogStore::create(dir.path().join("log"), false).unwrap());

            let mut message: Vec<u8> = (0..4095u32).map(|i| b'a' + (i % 26) as u8).collect();
            message.push(LINE_TERMINATOR);

            let (addr, task) = serve_one(store.clone(), 16).await;
            let response = exchange(addr, &message).await;
            task.await.unwrap().unwrap();

            assert_eq!(response, message);
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_peer_close_ends_message() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let dir = tempdir().expect("Failed to create temporary directory");
            let store = std::sync::Arc::new(LogStore::create(dir.path().join("log"), false).unwrap());

            let (addr, task) = serve_one(store.clone(), 1024).await;
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"no newline").await.unwrap();
            client.shutdown().await.unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            task.await.unwrap().unwrap();

            assert_eq!(response, b"no newline");
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_store_failure_is_contained() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let dir = tempdir().expect("Failed to create temporary directory");
            let store = std::sync::Arc::new(LogStore::create(dir.path().join("log"), false).unwrap());
            store.discard().await.unwrap();

            let (addr, task) = serve_one(store.clone(), 1024).await;
            let response = exchange(addr, b"lost\n").await;
            let result = task.await.unwrap();

            // The client sees its connection closed without any content.
            assert!(response.is_empty());
            assert!(result.is_err());
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
