//! Device log streaming.

use tracing::debug;

use crate::connection::ConnectionError;
use crate::target::{ShellStream, Target, TargetError};

/// A live hilog stream. Blocks on [`read_all`](HilogStream::read_all)
/// until the device closes the stream.
pub struct HilogStream {
    inner: ShellStream,
}

impl HilogStream {
    /// Read log output until the device closes the stream.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.inner.read_all().await
    }

    /// Close the underlying connection.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Target {
    /// Open a hilog stream. When `clear` is set, the log buffer is emptied
    /// (`hilog -r`) before the stream starts.
    pub async fn open_hilog(&self, clear: bool) -> Result<HilogStream, TargetError> {
        if clear {
            debug!(target = %self.connect_key(), "clearing hilog buffer");
            if let Ok(mut stream) = self.shell("hilog -r").await {
                let _ = stream.read_all().await;
            }
        }
        let inner = self.shell("hilog").await?;
        Ok(HilogStream { inner })
    }
}
