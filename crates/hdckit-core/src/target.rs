//! Per-device operations.
//!
//! A [`Target`] is a handle addressing one device by its connect key. Every
//! operation opens its own connection(s); nothing is cached on the handle.
//!
//! # Readiness probe
//!
//! Some server builds race the first post-handshake shell command against
//! session setup. Before any stateful operation, [`Target::transport`]
//! opens a throwaway connection, runs `shell echo ready`, drains it, closes
//! it, and only then opens the connection the real operation uses. The
//! double connect is a protocol workaround, not an optimization target.
//!
//! # Forward fault tolerance
//!
//! The server sometimes resets the channel right after honoring an `fport`
//! or `rport` command, so a failed reply read is not trusted as a failure:
//! the mapping list is consulted and, if it confirms the intended state,
//! the operation is reported successful.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::client::Client;
use crate::connection::{Connection, ConnectionError};
use crate::hdc_bin::{BinError, HdcBin};
use crate::protocol::{parse_parameters, Forward};

/// Errors from per-device operations.
#[derive(Error, Debug)]
pub enum TargetError {
    /// Channel-level failure: dial, handshake, read, or write.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The server replied without the success sentinel; the raw reply is
    /// the message.
    #[error("bridge rejected command: {0}")]
    Rejected(String),

    /// The native binary reported a failure.
    #[error(transparent)]
    Bin(#[from] BinError),
}

/// Handle for one device, addressed by connect key.
#[derive(Clone)]
pub struct Target {
    client: Client,
    key: String,
}

/// A live shell stream. Owns its connection until dropped or drained.
pub struct ShellStream {
    conn: Connection,
}

impl ShellStream {
    /// Read output until the device closes the stream.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.conn.read_all().await
    }

    /// Close the underlying connection.
    pub fn close(&mut self) {
        self.conn.close();
    }
}

impl Target {
    pub(crate) fn new(client: Client, key: String) -> Self {
        Self { client, key }
    }

    /// The connect key this handle addresses.
    pub fn connect_key(&self) -> &str {
        &self.key
    }

    fn bin(&self) -> HdcBin {
        HdcBin::new(self.client.options().clone())
    }

    /// Open a connection that is safe for stateful commands (see the
    /// module docs for why this connects twice).
    pub(crate) async fn transport(&self) -> Result<Connection, TargetError> {
        debug!(target = %self.key, "transport probe");
        let mut probe = self.client.connection(&self.key).await?;
        probe.send(b"shell echo ready\n").await?;
        // EOF is the normal end of the probe; anything else aborts.
        probe.read_all().await?;
        probe.close();
        let conn = self.client.connection(&self.key).await?;
        debug!(target = %self.key, "transport ready");
        Ok(conn)
    }

    /// Run a shell command, returning a stream of its output.
    pub async fn shell(&self, command: &str) -> Result<ShellStream, TargetError> {
        let mut conn = self.transport().await?;
        let payload = format!("shell {command}");
        if let Err(e) = conn.send(payload.as_bytes()).await {
            conn.close();
            return Err(e.into());
        }
        Ok(ShellStream { conn })
    }

    /// Run a shell command and collect its full output.
    pub async fn shell_output(&self, command: &str) -> Result<Vec<u8>, TargetError> {
        let mut stream = self.shell(command).await?;
        Ok(stream.read_all().await?)
    }

    /// Dump device system parameters.
    pub async fn parameters(&self) -> Result<HashMap<String, String>, TargetError> {
        let out = self.shell_output("param get").await?;
        Ok(parse_parameters(&String::from_utf8_lossy(&out)))
    }

    // -----------------------------------------------------------------------
    // Port mappings
    // -----------------------------------------------------------------------

    /// Install a forward mapping `host local -> device remote`.
    pub async fn forward(&self, local: &str, remote: &str) -> Result<(), TargetError> {
        let command = format!("fport {local} {remote}");
        self.port_command(&command, "OK", PortCheck::ForwardExists { local, remote })
            .await
    }

    /// Remove a forward mapping.
    pub async fn remove_forward(&self, local: &str, remote: &str) -> Result<(), TargetError> {
        let command = format!("fport rm {local} {remote}");
        self.port_command(&command, "success", PortCheck::ForwardGone { local, remote })
            .await
    }

    /// Install a reverse mapping `device remote -> host local`.
    pub async fn reverse(&self, remote: &str, local: &str) -> Result<(), TargetError> {
        let command = format!("rport {remote} {local}");
        self.port_command(&command, "OK", PortCheck::ReverseExists { local, remote })
            .await
    }

    /// Remove a reverse mapping. On the wire this is the forward removal
    /// with the argument order swapped.
    pub async fn remove_reverse(&self, remote: &str, local: &str) -> Result<(), TargetError> {
        self.remove_forward(local, remote).await
    }

    /// Issue a port command, read the reply, and fall back to a list query
    /// when the server drops the channel before replying.
    async fn port_command(
        &self,
        command: &str,
        success: &str,
        check: PortCheck<'_>,
    ) -> Result<(), TargetError> {
        let mut conn = self.transport().await?;
        debug!(target = %self.key, command, "port command");
        conn.send(command.as_bytes()).await?;
        let reply = match conn.read_value().await {
            Ok(reply) => reply,
            Err(err) => {
                conn.close();
                // Reply read failed: the server may have applied the command
                // and reset. The mapping list is authoritative.
                if self.reconcile(&check).await {
                    warn!(target = %self.key, command, error = %err,
                        "reply lost, mapping list confirms success");
                    return Ok(());
                }
                return Err(err.into());
            }
        };
        conn.close();
        let text = String::from_utf8_lossy(&reply);
        if !text.contains(success) {
            return Err(TargetError::Rejected(text.into_owned()));
        }
        Ok(())
    }

    async fn reconcile(&self, check: &PortCheck<'_>) -> bool {
        match check {
            PortCheck::ForwardExists { local, remote } => {
                self.forward_exists(local, remote).await
            }
            PortCheck::ForwardGone { local, remote } => {
                !self.forward_exists(local, remote).await
            }
            PortCheck::ReverseExists { local, remote } => {
                self.reverse_exists(remote, local).await
            }
        }
    }

    async fn forward_exists(&self, local: &str, remote: &str) -> bool {
        match self.list_forwards().await {
            Ok(list) => list.iter().any(|f| f.local == local && f.remote == remote),
            Err(_) => false,
        }
    }

    async fn reverse_exists(&self, remote: &str, local: &str) -> bool {
        match self.list_reverses().await {
            Ok(list) => list.iter().any(|f| f.remote == remote && f.local == local),
            Err(_) => false,
        }
    }

    /// Forward mappings belonging to this device.
    pub async fn list_forwards(&self) -> Result<Vec<Forward>, TargetError> {
        let all = self.client.list_forwards().await?;
        Ok(all.into_iter().filter(|f| f.target == self.key).collect())
    }

    /// Reverse mappings belonging to this device.
    pub async fn list_reverses(&self) -> Result<Vec<Forward>, TargetError> {
        let all = self.client.list_reverses().await?;
        Ok(all.into_iter().filter(|f| f.target == self.key).collect())
    }

    // -----------------------------------------------------------------------
    // Subprocess verbs
    // -----------------------------------------------------------------------

    /// Push a local file to the device.
    pub async fn send_file(&self, local: &str, remote: &str) -> Result<(), TargetError> {
        Ok(self.bin().file_send(&self.key, local, remote).await?)
    }

    /// Pull a device file to the host.
    pub async fn recv_file(&self, remote: &str, local: &str) -> Result<(), TargetError> {
        Ok(self.bin().file_recv(&self.key, remote, local).await?)
    }

    /// Install an application package from a local `.hap`.
    pub async fn install(&self, hap: &str) -> Result<(), TargetError> {
        Ok(self.bin().install(&self.key, hap).await?)
    }

    /// Uninstall an application bundle by name.
    pub async fn uninstall(&self, bundle: &str) -> Result<(), TargetError> {
        Ok(self.bin().uninstall(&self.key, bundle).await?)
    }
}

/// Which mapping-list condition proves a lost reply actually succeeded.
enum PortCheck<'a> {
    ForwardExists { local: &'a str, remote: &'a str },
    ForwardGone { local: &'a str, remote: &'a str },
    ReverseExists { local: &'a str, remote: &'a str },
}
