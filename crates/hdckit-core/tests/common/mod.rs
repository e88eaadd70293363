//! In-process mock of the hdc server for integration tests.
//!
//! The mock accepts any number of connections. On each one it sends the
//! banner, consumes the handshake reply (extracting the connect key), reads
//! exactly one command frame, and asks the test-supplied handler what to do.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use hdckit_core::protocol::encode_frame;
use hdckit_core::Options;

pub const BANNER: &[u8] = b"OHOS HDC\x00\x00\x00\x00";

/// What the mock does with one command.
#[allow(dead_code)]
pub enum Action {
    /// Send one reply frame, then close.
    Reply(Vec<u8>),
    /// Send several frames, then close (streaming replies).
    Frames(Vec<Vec<u8>>),
    /// Close without replying (the post-command reset quirk).
    CloseNow,
}

pub type Handler = Box<dyn FnMut(&str, &str) -> Action + Send>;

pub struct MockBridge {
    pub addr: SocketAddr,
}

impl MockBridge {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(Mutex::new(handler));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(serve_connection(stream, handler));
            }
        });
        Self { addr }
    }

    pub fn options(&self) -> Options {
        Options {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..Default::default()
        }
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<Mutex<Handler>>) {
    if stream.write_all(&encode_frame(BANNER)).await.is_err() {
        return;
    }
    let Some(handshake) = read_frame(&mut stream).await else {
        return;
    };
    let key = handshake
        .get(BANNER.len()..)
        .map(|field| {
            String::from_utf8_lossy(field)
                .trim_end_matches('\0')
                .to_string()
        })
        .unwrap_or_default();

    let Some(command) = read_frame(&mut stream).await else {
        return;
    };
    let command = String::from_utf8_lossy(&command).to_string();
    let action = {
        let mut handler = handler.lock().unwrap();
        (*handler)(&key, &command)
    };
    match action {
        Action::Reply(payload) => {
            let _ = stream.write_all(&encode_frame(&payload)).await;
        }
        Action::Frames(frames) => {
            for frame in frames {
                if stream.write_all(&encode_frame(&frame)).await.is_err() {
                    return;
                }
            }
        }
        Action::CloseNow => {}
    }
    // Dropping the stream closes the connection, which is how the real
    // server ends every exchange.
}

async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.ok()?;
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    Some(payload)
}
