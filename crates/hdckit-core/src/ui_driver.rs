//! High-level driver for the on-device uitest agent.
//!
//! [`UiDriver`] bootstraps the agent on first use and then dispatches
//! method calls over the RPC connection from [`crate::ui_rpc`]:
//!
//! 1. enable the ArkUI test mode parameter (best effort),
//! 2. optionally verify the agent library on the device, pushing the local
//!    SDK copy when it is missing or too old,
//! 3. start the uitest daemon and give it time to come up,
//! 4. forward a local TCP port to the agent's port 8012, reusing an
//!    existing mapping when one is present,
//! 5. connect and issue `Driver.create`; its string result is the handle
//!    every later call passes as `this`.
//!
//! A failed `Driver.create` triggers one recovery round: re-verify the
//! agent, reinstall it if needed, restart the daemon, reconnect, retry.
//! The second failure is final.
//!
//! `start` is idempotent and single-flight: concurrent callers serialize
//! on the driver's internal mutex and all but the first find the
//! connection already up.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::connection::ConnectionError;
use crate::target::{Target, TargetError};
use crate::ui_rpc::{StreamHandler, UiReply, UiRpcConn, UiRpcError};
use crate::util::{cmp_version, extract_version};

/// Device path the agent library is installed to.
const AGENT_PATH: &str = "/data/local/tmp/agent.so";

/// Marker string embedded in the agent library, followed by `@v<version>`.
const AGENT_MARKER: &str = "UITEST_AGENT_LIBRARY";

/// TCP port the uitest daemon listens on, on the device.
const AGENT_PORT: u16 = 8012;

/// Version pushed when no override is configured.
const DEFAULT_SDK_VERSION: &str = "1.1.0";

/// Default reply window for agent calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Time the daemon gets to open its listener after `start-daemon`.
const DAEMON_WARMUP: Duration = Duration::from_secs(3);

/// Attempts for pushing the agent library to the device.
const PUSH_ATTEMPTS: u32 = 3;

/// Delay between push attempts.
const PUSH_BACKOFF: Duration = Duration::from_millis(500);

/// Module every agent call is addressed to.
const RPC_MODULE: &str = "com.ohos.devicetest.hypiumApiHelper";

/// Errors from UI driver operations.
#[derive(Error, Debug)]
pub enum UiError {
    /// A bridge-side operation failed (shell, forward, file push).
    #[error(transparent)]
    Target(#[from] TargetError),

    /// An RPC-level failure: transport, timeout, or agent exception.
    #[error(transparent)]
    Rpc(#[from] UiRpcError),

    /// Local socket work (free-port probe) failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent could not be provisioned or restarted after retries.
    #[error("agent bootstrap failed: {0}")]
    Bootstrap(String),

    /// The agent replied with a shape the operation cannot use.
    #[error("unexpected agent reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Default)]
struct DriverState {
    conn: Option<Arc<UiRpcConn>>,
    driver_name: String,
    port: u16,
}

/// Driver for one device's uitest agent. Obtained from
/// [`Target::ui_driver`]; configure before the first call, then share
/// freely (calls take `&self`).
pub struct UiDriver {
    target: Target,
    sdk_path: Option<PathBuf>,
    sdk_version: String,
    need_ensure_sdk: bool,
    state: tokio::sync::Mutex<DriverState>,
}

impl Target {
    /// Create a UI driver for this device. No I/O happens until
    /// [`UiDriver::start`] or the first call.
    pub fn ui_driver(&self) -> UiDriver {
        UiDriver {
            target: self.clone(),
            sdk_path: None,
            sdk_version: DEFAULT_SDK_VERSION.to_string(),
            need_ensure_sdk: false,
            state: tokio::sync::Mutex::new(DriverState::default()),
        }
    }
}

impl UiDriver {
    /// Override the local SDK library path and required agent version.
    pub fn with_sdk(mut self, path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        self.sdk_path = Some(path.into());
        self.sdk_version = version.into();
        self
    }

    /// Verify (and if needed provision) the on-device agent during start.
    pub fn with_ensure_sdk(mut self, ensure: bool) -> Self {
        self.need_ensure_sdk = ensure;
        self
    }

    /// Bootstrap the agent and open the RPC connection. Idempotent; safe
    /// to call concurrently.
    pub async fn start(&self) -> Result<(), UiError> {
        let mut state = self.state.lock().await;
        if state.conn.is_some() {
            return Ok(());
        }
        self.start_locked(&mut state).await
    }

    /// Close the RPC connection and kill the on-device daemon
    /// (best effort).
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.conn.take() {
            conn.close();
        }
        state.driver_name.clear();
        if let Err(e) = self
            .shell("sh -c 'pidof uitest && kill -9 $(pidof uitest)'")
            .await
        {
            debug!(error = %e, "uitest daemon kill failed");
        }
    }

    async fn start_locked(&self, state: &mut DriverState) -> Result<(), UiError> {
        info!(target = %self.target.connect_key(), "starting UI driver");

        if let Err(e) = self.shell("param set persist.ace.testmode.enabled 1").await {
            warn!(error = %e, "enabling test mode failed");
        }

        if self.need_ensure_sdk {
            self.ensure_sdk().await?;
        }

        if let Err(e) = self.shell("uitest start-daemon singleness").await {
            warn!(error = %e, "start-daemon failed");
        }
        tokio::time::sleep(DAEMON_WARMUP).await;

        let port = self.forward_agent_port().await?;
        debug!(port, "agent tunnel ready");

        let conn = UiRpcConn::connect(port).await?;
        let create = hypium_call("Driver.create", None, json!([]));
        let name = match conn.call(&create, CALL_TIMEOUT).await {
            Ok(reply) => expect_string(reply)?,
            Err(err) => {
                warn!(error = %err, "Driver.create failed, recovering agent");
                conn.close();
                drop(conn);
                self.recover_agent().await?;
                let conn = UiRpcConn::connect(port).await?;
                match conn.call(&create, CALL_TIMEOUT).await {
                    Ok(reply) => {
                        let name = expect_string(reply)?;
                        state.conn = Some(Arc::new(conn));
                        state.driver_name = name;
                        state.port = port;
                        return Ok(());
                    }
                    Err(err) => {
                        conn.close();
                        return Err(UiError::Bootstrap(format!(
                            "Driver.create failed after agent reinstall: {err}"
                        )));
                    }
                }
            }
        };

        state.conn = Some(Arc::new(conn));
        state.driver_name = name;
        state.port = port;
        info!(target = %self.target.connect_key(), "UI driver ready");
        Ok(())
    }

    /// Local port currently tunneled to the agent, once started.
    pub async fn forwarded_port(&self) -> Option<u16> {
        let state = self.state.lock().await;
        state.conn.as_ref().map(|_| state.port)
    }

    /// Start if needed, then hand back the live connection and driver
    /// handle.
    async fn ensure(&self) -> Result<(Arc<UiRpcConn>, String), UiError> {
        let mut state = self.state.lock().await;
        if state.conn.is_none() {
            self.start_locked(&mut state).await?;
        }
        let conn = state.conn.as_ref().cloned().ok_or_else(|| {
            UiError::Bootstrap("driver connection unavailable after start".into())
        })?;
        Ok((conn, state.driver_name.clone()))
    }

    // -----------------------------------------------------------------------
    // Bootstrap plumbing
    // -----------------------------------------------------------------------

    async fn shell(&self, command: &str) -> Result<Vec<u8>, TargetError> {
        self.target.shell_output(command).await
    }

    /// The agent identification line, if the library is on the device.
    async fn cat_agent(&self) -> Result<String, TargetError> {
        let cmd = format!("cat {AGENT_PATH} | grep -a {AGENT_MARKER}");
        let out = self.shell(&cmd).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Whether the on-device agent is present and at least the required
    /// version.
    async fn agent_is_current(&self) -> bool {
        let raw = match self.cat_agent().await {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        if !raw.contains(AGENT_MARKER) {
            return false;
        }
        let current = extract_version(&raw).unwrap_or("");
        cmp_version(current, &self.sdk_version) != Ordering::Less
    }

    /// Push the local agent library, retrying on transient failures.
    async fn push_agent(&self) -> Result<(), UiError> {
        let path = self.local_sdk_path();
        let path = path.to_string_lossy();
        let mut last = String::new();
        for attempt in 1..=PUSH_ATTEMPTS {
            match self.target.send_file(&path, AGENT_PATH).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, error = %err, "agent push failed");
                    last = err.to_string();
                }
            }
            if attempt < PUSH_ATTEMPTS {
                tokio::time::sleep(PUSH_BACKOFF).await;
            }
        }
        Err(UiError::Bootstrap(format!(
            "pushing agent library failed after {PUSH_ATTEMPTS} attempts: {last}"
        )))
    }

    /// Remove a stale agent and install the local copy when the device one
    /// is missing or behind.
    async fn ensure_sdk(&self) -> Result<(), UiError> {
        if self.agent_is_current().await {
            debug!("on-device agent is current");
            return Ok(());
        }
        info!("provisioning on-device agent");
        if let Err(e) = self.shell(&format!("rm {AGENT_PATH}")).await {
            debug!(error = %e, "removing stale agent failed");
        }
        self.push_agent().await
    }

    /// Recovery after a failed `Driver.create`: reinstall the agent when it
    /// is not current, then restart the daemon.
    async fn recover_agent(&self) -> Result<(), UiError> {
        self.ensure_sdk().await?;
        if let Err(e) = self.shell("uitest start-daemon singleness").await {
            warn!(error = %e, "start-daemon failed during recovery");
        }
        tokio::time::sleep(DAEMON_WARMUP).await;
        Ok(())
    }

    /// Local agent library path: explicit override, or the first existing
    /// conventional location.
    fn local_sdk_path(&self) -> PathBuf {
        if let Some(path) = &self.sdk_path {
            return path.clone();
        }
        let file = format!("uitest_agent_v{}.so", self.sdk_version);
        let candidates = [
            Path::new("uitestkit_sdk").join(&file),
            Path::new("..").join("uitestkit_sdk").join(&file),
        ];
        for candidate in &candidates {
            if candidate.exists() {
                return candidate.clone();
            }
        }
        candidates[0].clone()
    }

    /// Local port tunneled to the agent. An existing mapping to the agent
    /// port is reused; otherwise a free port is picked and forwarded.
    async fn forward_agent_port(&self) -> Result<u16, UiError> {
        let remote = format!("tcp:{AGENT_PORT}");
        if let Ok(forwards) = self.target.list_forwards().await {
            for forward in forwards {
                if forward.remote == remote {
                    if let Some(port) = forward
                        .local
                        .strip_prefix("tcp:")
                        .and_then(|p| p.parse().ok())
                    {
                        debug!(port, "reusing existing agent forward");
                        return Ok(port);
                    }
                }
            }
        }
        // Bind-and-release to pick a free local port.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);
        if let Err(err) = self.target.forward(&format!("tcp:{port}"), &remote).await {
            // A residual EOF is tolerated here even when the mapping list
            // could not confirm the forward; the daemon picks the tunnel
            // up once it finishes starting.
            if is_eof(&err) {
                debug!(port, "forward reply ended in EOF, proceeding");
                return Ok(port);
            }
            return Err(err.into());
        }
        Ok(port)
    }

    // -----------------------------------------------------------------------
    // Agent operations
    // -----------------------------------------------------------------------

    /// Screen dimensions as reported by the agent (object with width and
    /// height fields).
    pub async fn get_display_size(&self) -> Result<Value, UiError> {
        let (conn, name) = self.ensure().await?;
        let call = api_call("CtrlCmd", "getDisplaySize", Some(&name), Value::Null);
        match conn.call(&call, CALL_TIMEOUT).await? {
            UiReply::Value(v) if v.is_object() => Ok(v),
            other => Err(UiError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Type text into the focused field at the given coordinates.
    pub async fn input_text(&self, text: &str, x: i32, y: i32) -> Result<(), UiError> {
        let (conn, name) = self.ensure().await?;
        let call = hypium_call(
            "Driver.inputText",
            Some(&name),
            json!([{ "x": x, "y": y }, text]),
        );
        conn.call(&call, CALL_TIMEOUT).await?;
        Ok(())
    }

    /// Dump the UI component tree.
    pub async fn capture_layout(&self) -> Result<Value, UiError> {
        let (conn, name) = self.ensure().await?;
        let call = api_call("Captures", "captureLayout", Some(&name), Value::Null);
        match conn.call(&call, CALL_TIMEOUT).await? {
            UiReply::Value(v) => Ok(v),
            other => Err(UiError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn touch_down(&self, x: i32, y: i32) -> Result<(), UiError> {
        self.gesture("touchDown", x, y).await
    }

    pub async fn touch_move(&self, x: i32, y: i32) -> Result<(), UiError> {
        self.gesture("touchMove", x, y).await
    }

    pub async fn touch_up(&self, x: i32, y: i32) -> Result<(), UiError> {
        self.gesture("touchUp", x, y).await
    }

    async fn gesture(&self, api: &str, x: i32, y: i32) -> Result<(), UiError> {
        let (conn, name) = self.ensure().await?;
        let call = api_call("Gestures", api, Some(&name), json!({ "x": x, "y": y }));
        conn.call(&call, CALL_TIMEOUT).await?;
        Ok(())
    }

    /// Start the screen-capture stream. Frames arrive on the session id of
    /// this call and are delivered to `on_frame` as raw image bytes, in
    /// arrival order. Returns that session id.
    ///
    /// `scale` shrinks frames when it is strictly between 0 and 1; any
    /// other value requests full-size frames.
    pub async fn start_capture_screen<F>(&self, on_frame: F, scale: f64) -> Result<u32, UiError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let (conn, name) = self.ensure().await?;
        let options = if scale > 0.0 && scale < 1.0 {
            json!({ "scale": scale })
        } else {
            json!({})
        };
        let call = api_call(
            "Captures",
            "startCaptureScreen",
            Some(&name),
            json!({ "options": options }),
        );

        // Primary path: the stream is keyed by the session id of this very
        // send, regardless of what the reply body says.
        match conn.call_with_session(&call, CALL_TIMEOUT).await {
            Ok((session, _reply)) => {
                attach_capture_handler(&conn, session, on_frame);
                return Ok(session);
            }
            Err(err) => {
                warn!(error = %err, "capture start lost its reply, retrying");
            }
        }

        // Fallback: some agent builds answer the retry with an explicit
        // session id in the reply body.
        let reply = conn.call(&call, CALL_TIMEOUT).await?;
        let session = match &reply {
            UiReply::Value(v) => session_id_from_value(v),
            UiReply::Raw(bytes) => serde_json::from_slice::<Value>(bytes)
                .ok()
                .as_ref()
                .and_then(session_id_from_value),
        };
        match session {
            Some(session) => {
                attach_capture_handler(&conn, session, on_frame);
                Ok(session)
            }
            None => Err(UiError::UnexpectedReply(format!(
                "startCaptureScreen returned no session id: {reply:?}"
            ))),
        }
    }

    /// Stop the screen-capture stream and clear the frame handler.
    pub async fn stop_capture_screen(&self) -> Result<(), UiError> {
        let (conn, name) = self.ensure().await?;
        let call = api_call("Captures", "stopCaptureScreen", Some(&name), Value::Null);
        let result = conn.call(&call, CALL_TIMEOUT).await;
        conn.set_stream_handler(None);
        result?;
        Ok(())
    }
}

/// Whether a target error bottoms out in a clean end-of-stream.
fn is_eof(err: &TargetError) -> bool {
    matches!(
        err,
        TargetError::Connection(ConnectionError::Io(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof
    )
}

fn attach_capture_handler<F>(conn: &UiRpcConn, session: u32, mut on_frame: F)
where
    F: FnMut(&[u8]) + Send + 'static,
{
    let handler: StreamHandler = Box::new(move |frame_session, payload| {
        if frame_session == session {
            on_frame(payload);
        }
    });
    conn.set_stream_handler(Some(handler));
}

/// Pull a session id out of a reply value: a bare number, a `sessionId`
/// field, or either of those nested under `result`.
fn session_id_from_value(value: &Value) -> Option<u32> {
    fn as_u32(v: &Value) -> Option<u32> {
        v.as_u64().and_then(|n| u32::try_from(n).ok())
    }
    if let Some(n) = as_u32(value) {
        return Some(n);
    }
    let obj = value.as_object()?;
    if let Some(n) = obj.get("sessionId").and_then(as_u32) {
        return Some(n);
    }
    let result = obj.get("result")?;
    if let Some(n) = as_u32(result) {
        return Some(n);
    }
    result.get("sessionId").and_then(as_u32)
}

/// Call shape for `callHypiumApi` methods (driver API surface).
fn hypium_call(api: &str, this: Option<&str>, args: Value) -> Value {
    json!({
        "module": RPC_MODULE,
        "method": "callHypiumApi",
        "params": {
            "api": api,
            "this": this,
            "args": args,
            "message_type": "hypium",
        },
    })
}

/// Call shape for the control surfaces (`CtrlCmd`, `Captures`,
/// `Gestures`).
fn api_call(method: &str, api: &str, this: Option<&str>, args: Value) -> Value {
    json!({
        "module": RPC_MODULE,
        "method": method,
        "params": {
            "api": api,
            "this": this,
            "args": args,
        },
    })
}

fn expect_string(reply: UiReply) -> Result<String, UiError> {
    match reply {
        UiReply::Value(Value::String(s)) => Ok(s),
        other => Err(UiError::UnexpectedReply(format!(
            "expected string driver handle, got {other:?}"
        ))),
    }
}
