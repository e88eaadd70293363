//! A single channel connection to the hdc server.
//!
//! Each [`Connection`] owns one TCP socket for the lifetime of one command
//! exchange. The lifecycle is always: dial, banner handshake, zero or more
//! send/read cycles, close. Connections are never shared between
//! operations; streaming consumers (shell, hilog, screen capture) keep the
//! connection alive inside their handle until the caller closes it.
//!
//! # Handshake
//!
//! On accept the server sends one frame, its banner, which must begin with
//! the ASCII bytes `OHOS HDC`. The client replies with a single frame
//! containing the banner bytes followed by the target connect key in a
//! 32-byte zero-padded field. The empty key addresses the server itself.

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::Options;
use crate::protocol::{encode_handshake, HANDSHAKE_PREFIX};

/// Timeout for establishing the TCP connection to the server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced by channel connection I/O.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The server banner was missing or did not carry the expected prefix.
    #[error("handshake failed: bad server banner")]
    HandshakeFailed,

    /// The TCP connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An operation was attempted on a closed connection.
    #[error("connection closed")]
    NotConnected,

    /// An I/O error occurred on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One TCP connection to the hdc server, post-handshake.
pub struct Connection {
    stream: Option<TcpStream>,
}

impl Connection {
    /// Dial the server and perform the banner handshake for `connect_key`.
    ///
    /// The returned connection is ready for command frames. Fails with
    /// [`ConnectionError::HandshakeFailed`] if the first frame from the
    /// server does not start with `OHOS HDC`.
    pub async fn connect(opts: &Options, connect_key: &str) -> Result<Self, ConnectionError> {
        let addr = opts.server_addr();
        debug!(%addr, key = connect_key, "connecting to bridge");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::ConnectFailed(format!("{addr}: connect timed out")))?
            .map_err(|e| ConnectionError::ConnectFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();

        let mut conn = Self {
            stream: Some(stream),
        };

        let banner = conn.read_value().await.map_err(|e| match e {
            ConnectionError::Io(_) => ConnectionError::HandshakeFailed,
            other => other,
        })?;
        if banner.len() < HANDSHAKE_PREFIX.len()
            || &banner[..HANDSHAKE_PREFIX.len()] != HANDSHAKE_PREFIX
        {
            conn.close();
            return Err(ConnectionError::HandshakeFailed);
        }

        conn.send(&encode_handshake(&banner, connect_key)).await?;
        debug!(key = connect_key, "handshake complete");
        Ok(conn)
    }

    /// Write one frame: 4-byte BE length followed by the payload.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        trace!(payload_bytes = payload.len(), "sending frame");
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Read exactly one frame and return its payload.
    ///
    /// A zero-length frame yields an empty vector. An EOF before or inside
    /// the frame surfaces as an [`ErrorKind::UnexpectedEof`] I/O error;
    /// [`read_all`](Self::read_all) turns that into clean termination.
    pub async fn read_value(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        trace!(payload_bytes = len, "frame received");
        Ok(payload)
    }

    /// Read frames until the peer closes the stream, concatenating payloads.
    ///
    /// A clean close (EOF at a frame boundary or mid-frame) terminates the
    /// stream and returns everything accumulated so far. This is the
    /// designated consumer for streaming replies: shell output, hilog, and
    /// anything else where the server signals completion by closing.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut all = Vec::new();
        loop {
            match self.read_value().await {
                Ok(chunk) => all.extend_from_slice(&chunk),
                Err(ConnectionError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(all)
                }
                Err(ConnectionError::NotConnected) => return Ok(all),
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&mut self) {
        self.stream.take();
    }

    /// Whether the socket is still held.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
