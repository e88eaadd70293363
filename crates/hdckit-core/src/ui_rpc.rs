//! Wire protocol of the on-device uitest agent.
//!
//! The agent speaks a sentinel-delimited, session-multiplexed framing over
//! a dedicated TCP socket (reached through a forwarded port):
//!
//! ```text
//! [header:  28 bytes ASCII "_uitestkit_rpc_message_head_"]
//! [session: u32 big-endian]
//! [length:  u32 big-endian payload byte count]
//! [payload: length bytes]
//! [trailer: 28 bytes ASCII "_uitestkit_rpc_message_tail_"]
//! ```
//!
//! Payloads are JSON documents; replies carry either a `result` value or a
//! non-null `exception` object. Binary stream payloads (screen-capture
//! frames) are not JSON and pass through as raw bytes.
//!
//! Requests and replies are correlated by the client-chosen session id.
//! [`UiRpcConn`] keeps one reader task that fans each incoming frame out to
//! the pending caller with the matching id, or to the registered stream
//! handler when no caller is waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Frame header sentinel.
pub const RPC_HEADER: &[u8; 28] = b"_uitestkit_rpc_message_head_";

/// Frame trailer sentinel.
pub const RPC_TRAILER: &[u8; 28] = b"_uitestkit_rpc_message_tail_";

/// Bytes of header sentinel + session id + payload length.
const PREFIX_LEN: usize = 28 + 4 + 4;

/// Timeout for establishing the TCP connection to the agent.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors on the agent RPC surface.
#[derive(Error, Debug)]
pub enum UiRpcError {
    /// The TCP connection to the agent could not be established.
    #[error("agent connect failed: {0}")]
    ConnectFailed(String),

    /// An I/O error occurred on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// No reply arrived within the caller's window.
    #[error("agent call timed out")]
    Timeout,

    /// The connection closed while a reply was outstanding.
    #[error("agent connection closed")]
    Closed,

    /// The agent reported an exception for this call.
    #[error("agent exception: {0}")]
    Agent(String),
}

/// A decoded reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum UiReply {
    /// The JSON `result` value (may be `Null`).
    Value(serde_json::Value),
    /// Payload that was not JSON: a binary stream frame.
    Raw(Vec<u8>),
}

/// Handler for frames whose session id has no pending caller.
pub type StreamHandler = Box<dyn FnMut(u32, &[u8]) + Send>;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encode one frame: sentinels around the session id, payload length, and
/// payload.
pub fn encode_message(session: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len() + RPC_TRAILER.len());
    frame.extend_from_slice(RPC_HEADER);
    frame.extend_from_slice(&session.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(RPC_TRAILER);
    frame
}

/// Extract the next complete frame from an accumulation buffer.
///
/// Returns `None` when the buffer does not yet hold a full frame. A buffer
/// whose leading bytes do not match the header sentinel, or whose frame
/// does not end in the trailer sentinel, is discarded wholesale: framing is
/// lost and resynchronization starts from the next read.
pub fn extract_message(buf: &mut Vec<u8>) -> Option<(u32, Vec<u8>)> {
    if buf.len() < PREFIX_LEN {
        return None;
    }
    if &buf[..RPC_HEADER.len()] != RPC_HEADER {
        warn!(buffered = buf.len(), "agent framing lost, discarding buffer");
        buf.clear();
        return None;
    }
    let session = u32::from_be_bytes(buf[28..32].try_into().unwrap());
    let len = u32::from_be_bytes(buf[32..36].try_into().unwrap()) as usize;
    let total = PREFIX_LEN + len + RPC_TRAILER.len();
    if buf.len() < total {
        return None;
    }
    if &buf[PREFIX_LEN + len..total] != RPC_TRAILER {
        warn!(session, "agent frame missing trailer, discarding buffer");
        buf.clear();
        return None;
    }
    let payload = buf[PREFIX_LEN..PREFIX_LEN + len].to_vec();
    buf.drain(..total);
    Some((session, payload))
}

#[derive(Deserialize)]
struct ReplyEnvelope {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    exception: Option<ReplyException>,
}

#[derive(Deserialize)]
struct ReplyException {
    #[serde(default)]
    message: String,
}

/// Interpret a reply payload: JSON with a non-null `exception` fails the
/// call, JSON without one yields its `result` value, and anything that is
/// not a JSON object passes through raw.
fn interpret(payload: &[u8]) -> Result<UiReply, UiRpcError> {
    match serde_json::from_slice::<ReplyEnvelope>(payload) {
        Ok(envelope) => match envelope.exception {
            Some(e) => Err(UiRpcError::Agent(e.message)),
            None => Ok(UiReply::Value(envelope.result)),
        },
        Err(_) => Ok(UiReply::Raw(payload.to_vec())),
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

type PendingMap = HashMap<u32, oneshot::Sender<Result<UiReply, UiRpcError>>>;

struct Shared {
    pending: Mutex<PendingMap>,
    stream_handler: Mutex<Option<StreamHandler>>,
    closed: AtomicBool,
}

/// One RPC connection to the uitest agent.
///
/// Calls may be issued from multiple tasks; the single reader task resolves
/// each pending session exactly once. Session ids are unique for the life
/// of the connection.
pub struct UiRpcConn {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    next_session: AtomicU32,
}

impl UiRpcConn {
    /// Connect to the agent through its forwarded local port.
    pub async fn connect(port: u16) -> Result<Self, UiRpcError> {
        let addr = format!("127.0.0.1:{port}");
        debug!(%addr, "connecting to uitest agent");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| UiRpcError::ConnectFailed(format!("{addr}: connect timed out")))?
            .map_err(|e| UiRpcError::ConnectFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();

        // Capture streams idle between frames; keepalive stops the OS from
        // reclaiming the tunnel underneath them.
        let sock = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(15))
            .with_interval(Duration::from_secs(5));
        sock.set_tcp_keepalive(&keepalive).ok();

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            stream_handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));

        let seed = UNIX_EPOCH
            .elapsed()
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(1);

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            reader,
            next_session: AtomicU32::new(seed),
        })
    }

    /// Send a JSON message and wait for the matching reply.
    ///
    /// A zero `timeout` waits until the reply arrives or the connection is
    /// lost. A positive one fails with [`UiRpcError::Timeout`] once it
    /// elapses; the pending entry is removed so a late reply falls through
    /// to the stream handler (or is dropped).
    pub async fn call(
        &self,
        message: &serde_json::Value,
        call_timeout: Duration,
    ) -> Result<UiReply, UiRpcError> {
        self.call_with_session(message, call_timeout)
            .await
            .map(|(_, reply)| reply)
    }

    /// Like [`call`](Self::call), but also yields the session id the frame
    /// was sent with. Stream starters need the id: subsequent frames from
    /// the agent carry it, not anything from the reply body.
    pub async fn call_with_session(
        &self,
        message: &serde_json::Value,
        call_timeout: Duration,
    ) -> Result<(u32, UiReply), UiRpcError> {
        let payload = serde_json::to_vec(message)?;
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(session, tx);
        // The reader may have torn down the map just before the insert;
        // re-check so a dead connection can never strand a waiter.
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.pending.lock().unwrap().remove(&session);
            return Err(UiRpcError::Closed);
        }

        trace!(session, payload_bytes = payload.len(), "agent call");
        let frame = encode_message(session, &payload);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&frame).await {
                self.shared.pending.lock().unwrap().remove(&session);
                return Err(e.into());
            }
        }

        let outcome = if call_timeout.is_zero() {
            rx.await.map_err(|_| UiRpcError::Closed)?
        } else {
            match timeout(call_timeout, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => return Err(UiRpcError::Closed),
                Err(_) => {
                    self.shared.pending.lock().unwrap().remove(&session);
                    return Err(UiRpcError::Timeout);
                }
            }
        };
        outcome.map(|reply| (session, reply))
    }

    /// Install (or clear) the handler for frames no caller is waiting on.
    pub fn set_stream_handler(&self, handler: Option<StreamHandler>) {
        *self.shared.stream_handler.lock().unwrap() = handler;
    }

    /// Tear the connection down. Pending callers observe
    /// [`UiRpcError::Closed`].
    pub fn close(&self) {
        self.reader.abort();
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.pending.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }
}

impl Drop for UiRpcConn {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, shared: Arc<Shared>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Some((session, payload)) = extract_message(&mut buf) {
            dispatch(&shared, session, &payload);
        }
    }
    debug!("agent reader stopped");
    // Flag first, then drop the senders: a caller inserting concurrently
    // either gets cleared here or sees the flag on its re-check.
    shared.closed.store(true, Ordering::SeqCst);
    shared.pending.lock().unwrap().clear();
}

fn dispatch(shared: &Shared, session: u32, payload: &[u8]) {
    let waiter = shared.pending.lock().unwrap().remove(&session);
    if let Some(tx) = waiter {
        let _ = tx.send(interpret(payload));
        return;
    }
    if let Some(handler) = shared.stream_handler.lock().unwrap().as_mut() {
        handler(session, payload);
        return;
    }
    trace!(session, payload_bytes = payload.len(), "unclaimed agent frame dropped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    // -- codec --------------------------------------------------------------

    #[test]
    fn encode_layout() {
        let frame = encode_message(0xAABBCCDD, b"{}");
        assert_eq!(&frame[..28], RPC_HEADER);
        assert_eq!(&frame[28..32], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&frame[32..36], &2u32.to_be_bytes());
        assert_eq!(&frame[36..38], b"{}");
        assert_eq!(&frame[38..], RPC_TRAILER);
    }

    #[test]
    fn extract_round_trip() {
        let mut buf = encode_message(7, b"payload");
        let (session, payload) = extract_message(&mut buf).unwrap();
        assert_eq!(session, 7);
        assert_eq!(payload, b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_waits_for_complete_frame() {
        let frame = encode_message(1, b"split");
        let mut buf = frame[..10].to_vec();
        assert!(extract_message(&mut buf).is_none());
        buf.extend_from_slice(&frame[10..40]);
        assert!(extract_message(&mut buf).is_none());
        buf.extend_from_slice(&frame[40..]);
        assert!(extract_message(&mut buf).is_some());
    }

    #[test]
    fn extract_two_frames_in_order() {
        let mut buf = encode_message(1, b"one");
        buf.extend_from_slice(&encode_message(2, b"two"));
        assert_eq!(extract_message(&mut buf).unwrap(), (1, b"one".to_vec()));
        assert_eq!(extract_message(&mut buf).unwrap(), (2, b"two".to_vec()));
        assert!(extract_message(&mut buf).is_none());
    }

    #[test]
    fn extract_discards_on_bad_header() {
        let mut buf = vec![0u8; 64];
        assert!(extract_message(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_discards_on_bad_trailer() {
        let mut frame = encode_message(3, b"x");
        let n = frame.len();
        frame[n - 1] = b'!';
        let mut buf = frame;
        assert!(extract_message(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    // -- reply interpretation -----------------------------------------------

    #[test]
    fn interpret_result_value() {
        let reply = interpret(br#"{"result":"Driver#0"}"#).unwrap();
        assert_eq!(reply, UiReply::Value(json!("Driver#0")));
    }

    #[test]
    fn interpret_null_result() {
        let reply = interpret(br#"{"result":null}"#).unwrap();
        assert_eq!(reply, UiReply::Value(serde_json::Value::Null));
        let reply = interpret(br#"{}"#).unwrap();
        assert_eq!(reply, UiReply::Value(serde_json::Value::Null));
    }

    #[test]
    fn interpret_exception_fails() {
        let err = interpret(br#"{"exception":{"message":"no such api"}}"#).unwrap_err();
        match err {
            UiRpcError::Agent(msg) => assert_eq!(msg, "no such api"),
            other => panic!("expected Agent, got {other:?}"),
        }
    }

    #[test]
    fn interpret_null_exception_is_not_an_error() {
        let reply = interpret(br#"{"result":true,"exception":null}"#).unwrap();
        assert_eq!(reply, UiReply::Value(json!(true)));
    }

    #[test]
    fn interpret_binary_passes_through() {
        let png = [0x89u8, 0x50, 0x4E, 0x47, 0x0D, 0x0A];
        let reply = interpret(&png).unwrap();
        assert_eq!(reply, UiReply::Raw(png.to_vec()));
    }

    // -- connection ---------------------------------------------------------

    /// Mock agent: accepts one connection, then answers every frame by
    /// calling `respond(session, payload) -> Option<wire bytes>`.
    async fn mock_agent<F>(mut respond: F) -> u16
    where
        F: FnMut(u32, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some((session, payload)) = extract_message(&mut buf) {
                    if let Some(reply) = respond(session, &payload) {
                        stream.write_all(&reply).await.unwrap();
                    }
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn call_resolves_matching_session() {
        let port = mock_agent(|session, _payload| {
            Some(encode_message(session, br#"{"result":42}"#))
        })
        .await;
        let conn = UiRpcConn::connect(port).await.unwrap();
        let reply = conn
            .call(&json!({"method": "test"}), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(reply, UiReply::Value(json!(42)));
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        // Echo each session's payload length back as the result.
        let port = mock_agent(|session, payload| {
            let body = format!(r#"{{"result":{}}}"#, payload.len());
            Some(encode_message(session, body.as_bytes()))
        })
        .await;
        let conn = Arc::new(UiRpcConn::connect(port).await.unwrap());
        let a = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.call(&json!({"m": "aa"}), Duration::from_secs(3)).await
            })
        };
        let b = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.call(&json!({"m": "bbbb"}), Duration::from_secs(3)).await
            })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, UiReply::Value(json!(10)));
        assert_eq!(b, UiReply::Value(json!(12)));
    }

    #[tokio::test]
    async fn agent_exception_surfaces_as_error() {
        let port = mock_agent(|session, _| {
            Some(encode_message(
                session,
                br#"{"exception":{"message":"driver gone"}}"#,
            ))
        })
        .await;
        let conn = UiRpcConn::connect(port).await.unwrap();
        let err = conn
            .call(&json!({}), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, UiRpcError::Agent(msg) if msg == "driver gone"));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let port = mock_agent(|_, _| None).await; // never replies
        let conn = UiRpcConn::connect(port).await.unwrap();
        let start = tokio::time::Instant::now();
        let err = conn
            .call(&json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, UiRpcError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn session_ids_are_distinct() {
        let port = mock_agent(|session, _| {
            Some(encode_message(session, br#"{"result":null}"#))
        })
        .await;
        let conn = UiRpcConn::connect(port).await.unwrap();
        let (first, _) = conn
            .call_with_session(&json!({}), Duration::from_secs(3))
            .await
            .unwrap();
        let (second, _) = conn
            .call_with_session(&json!({}), Duration::from_secs(3))
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn unclaimed_frames_go_to_stream_handler() {
        // Reply to the call, then push two extra frames on the same session.
        let port = mock_agent(|session, _| {
            let mut wire = encode_message(session, br#"{"result":true}"#);
            wire.extend_from_slice(&encode_message(session, &[0x89, 0x50, 0x4E, 0x47]));
            wire.extend_from_slice(&encode_message(session, &[0x89, 0x50, 0x4E, 0x48]));
            Some(wire)
        })
        .await;
        let conn = UiRpcConn::connect(port).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.set_stream_handler(Some(Box::new(move |session, payload| {
            let _ = tx.send((session, payload.to_vec()));
        })));
        let (session, _) = conn
            .call_with_session(&json!({}), Duration::from_secs(3))
            .await
            .unwrap();
        let (s1, f1) = rx.recv().await.unwrap();
        let (s2, f2) = rx.recv().await.unwrap();
        assert_eq!(s1, session);
        assert_eq!(s2, session);
        assert_eq!(f1, vec![0x89, 0x50, 0x4E, 0x47]);
        assert_eq!(f2, vec![0x89, 0x50, 0x4E, 0x48]);
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Close without replying.
            drop(stream);
        });
        let conn = UiRpcConn::connect(port).await.unwrap();
        let err = conn.call(&json!({}), Duration::ZERO).await.unwrap_err();
        // Depending on timing the write itself may fail instead.
        assert!(matches!(err, UiRpcError::Closed | UiRpcError::Io(_)));
    }
}
