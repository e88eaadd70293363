//! Server-global operations and the connection factory.
//!
//! A [`Client`] holds the immutable [`Options`] and hands out one fresh
//! [`Connection`] per operation. It also covers the commands that address
//! the server rather than a device: target listing, the port-mapping
//! listing, and best-effort server shutdown.
//!
//! # Server auto-start
//!
//! The hdc toolchain expects the server daemon to be started on demand.
//! Each operation whose dial fails synchronously runs `<bin> start` (with
//! the configured port exported) and retries the dial exactly once. The
//! attempt is scoped to that operation's connection, so a server that dies
//! later is restarted by whichever operation next trips over it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Options;
use crate::connection::{Connection, ConnectionError};
use crate::hdc_bin::HdcBin;
use crate::protocol::{parse_ports, parse_targets, Forward};
use crate::target::Target;
use crate::tracker::TargetTracker;
use crate::util::read_server_pid;

/// Client for one hdc server. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    opts: Arc<Options>,
}

impl Client {
    pub fn new(opts: Options) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    /// The options this client was built with.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Open a handshaken connection for `connect_key`. A failed dial gets
    /// one start-the-server-and-retry cycle of its own.
    pub(crate) async fn connection(
        &self,
        connect_key: &str,
    ) -> Result<Connection, ConnectionError> {
        match Connection::connect(&self.opts, connect_key).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                debug!(error = %err, "connect failed, starting server");
                if let Err(start_err) = HdcBin::new(self.opts.as_ref().clone()).start_server().await
                {
                    warn!(error = %start_err, "server start failed");
                }
                Connection::connect(&self.opts, connect_key).await
            }
        }
    }

    /// List the connect keys of all attached devices.
    pub async fn list_targets(&self) -> Result<Vec<String>, ConnectionError> {
        let mut conn = self.connection("").await?;
        conn.send(b"list targets").await?;
        let reply = conn.read_value().await?;
        conn.close();
        Ok(parse_targets(&String::from_utf8_lossy(&reply)))
    }

    /// List all forward port mappings known to the server.
    pub async fn list_forwards(&self) -> Result<Vec<Forward>, ConnectionError> {
        self.list_ports(false).await
    }

    /// List all reverse port mappings known to the server.
    pub async fn list_reverses(&self) -> Result<Vec<Forward>, ConnectionError> {
        self.list_ports(true).await
    }

    async fn list_ports(&self, reverse: bool) -> Result<Vec<Forward>, ConnectionError> {
        let mut conn = self.connection("").await?;
        conn.send(b"fport ls").await?;
        let reply = conn.read_value().await?;
        conn.close();
        Ok(parse_ports(&String::from_utf8_lossy(&reply), reverse))
    }

    /// Handle for per-device operations. Pure constructor, no I/O.
    pub fn target(&self, connect_key: impl Into<String>) -> Target {
        Target::new(self.clone(), connect_key.into())
    }

    /// Start tracking device arrivals and departures in the background.
    pub fn track_targets(&self) -> TargetTracker {
        TargetTracker::spawn(self.clone())
    }

    /// Best-effort server shutdown: terminate the process recorded in the
    /// server's pid file. Errors are swallowed.
    pub fn kill(&self) {
        let Some(pid) = read_server_pid() else {
            return;
        };
        debug!(pid, "killing bridge server");
        terminate(pid);
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: plain signal send; the worst a stale pid can do is hit an
    // unrelated process we lack permission to signal, which errors out.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output();
}
