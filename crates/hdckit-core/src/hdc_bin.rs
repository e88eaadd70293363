//! Subprocess bridge to the native `hdc` binary.
//!
//! File transfer and package install/uninstall are not exposed on the
//! channel socket of the server builds this crate targets, so those verbs
//! shell out to the native binary. The binary is also how the server gets
//! started when nothing is listening yet.
//!
//! Success is detected by exit status plus output sniffing: the tool
//! reports many failures with a zero exit code, so any combined output
//! containing `fail` or `error` (case-insensitive) fails the operation.
//! The captured output becomes the error message.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::{Options, SERVER_PORT_ENV};

/// Errors from invoking the native bridge binary.
#[derive(Error, Debug)]
pub enum BinError {
    /// The binary could not be spawned.
    #[error("failed to run {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    /// The binary exited non-zero or its output reported a failure.
    #[error("{0}")]
    CommandFailed(String),
}

/// Invoker for the native `hdc` binary configured in [`Options`].
pub struct HdcBin {
    opts: Options,
}

impl HdcBin {
    pub fn new(opts: Options) -> Self {
        Self { opts }
    }

    /// Base arguments addressing the configured server and one device:
    /// `-s <host>:<port> -t <key>`.
    fn target_args(&self, connect_key: &str) -> Vec<String> {
        vec![
            "-s".to_string(),
            self.opts.server_addr(),
            "-t".to_string(),
            connect_key.to_string(),
        ]
    }

    /// Run the binary, capture combined stdout/stderr, and apply the
    /// substring success check. `context` prefixes the error message.
    async fn run(&self, args: &[String], context: &str) -> Result<String, BinError> {
        debug!(bin = %self.opts.bin, ?args, "invoking bridge binary");
        let output = Command::new(&self.opts.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BinError::Spawn {
                bin: self.opts.bin.clone(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let trimmed = combined.trim();
        debug!(
            code = output.status.code(),
            output_bytes = combined.len(),
            "bridge binary finished"
        );

        if !output.status.success() {
            return Err(BinError::CommandFailed(format!(
                "{context} failed: {trimmed}"
            )));
        }
        let lower = combined.to_lowercase();
        if lower.contains("fail") || lower.contains("error") {
            return Err(BinError::CommandFailed(format!(
                "{context} failed: {trimmed}"
            )));
        }
        Ok(combined)
    }

    /// `hdc -s ... -t <key> file send <local> <remote>`
    pub async fn file_send(
        &self,
        connect_key: &str,
        local: &str,
        remote: &str,
    ) -> Result<(), BinError> {
        let mut args = self.target_args(connect_key);
        args.extend(["file", "send", local, remote].map(String::from));
        self.run(&args, "send file").await.map(drop)
    }

    /// `hdc -s ... -t <key> file recv <remote> <local>`
    pub async fn file_recv(
        &self,
        connect_key: &str,
        remote: &str,
        local: &str,
    ) -> Result<(), BinError> {
        let mut args = self.target_args(connect_key);
        args.extend(["file", "recv", remote, local].map(String::from));
        self.run(&args, "recv file").await.map(drop)
    }

    /// `hdc -s ... -t <key> install <hap>`
    pub async fn install(&self, connect_key: &str, hap: &str) -> Result<(), BinError> {
        let mut args = self.target_args(connect_key);
        args.extend(["install", hap].map(String::from));
        self.run(&args, "install").await.map(drop)
    }

    /// `hdc -s ... -t <key> uninstall <bundle>`
    ///
    /// Older bridges print `uninstall bundle successfully`; newer ones print
    /// nothing on success, so only the negative sniff applies.
    pub async fn uninstall(&self, connect_key: &str, bundle: &str) -> Result<(), BinError> {
        let mut args = self.target_args(connect_key);
        args.extend(["uninstall", bundle].map(String::from));
        self.run(&args, "uninstall bundle").await.map(drop)
    }

    /// `hdc start`, with the configured port exported so the spawned server
    /// listens where this client will dial.
    pub async fn start_server(&self) -> Result<(), BinError> {
        debug!(bin = %self.opts.bin, port = self.opts.port, "starting bridge server");
        let status = Command::new(&self.opts.bin)
            .arg("start")
            .env(SERVER_PORT_ENV, self.opts.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| BinError::Spawn {
                bin: self.opts.bin.clone(),
                source,
            })?;
        if !status.success() {
            return Err(BinError::CommandFailed(format!(
                "server start exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(opts: Options) -> HdcBin {
        HdcBin::new(opts)
    }

    #[test]
    fn target_args_address_server_and_device() {
        let b = bin(Options {
            host: "127.0.0.1".to_string(),
            port: 8710,
            ..Default::default()
        });
        assert_eq!(
            b.target_args("DEV1"),
            vec!["-s", "127.0.0.1:8710", "-t", "DEV1"]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let b = bin(Options {
            bin: "/nonexistent/hdc-binary".to_string(),
            ..Default::default()
        });
        let result = b.file_send("DEV1", "a.txt", "/data/local/tmp/a.txt").await;
        assert!(matches!(result, Err(BinError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_substring_in_output_fails() {
        // `sh -c` stands in for the bridge binary; it echoes a failure line
        // and exits zero, which must still be treated as an error.
        let b = bin(Options {
            bin: "/bin/sh".to_string(),
            ..Default::default()
        });
        let args: Vec<String> = ["-c", "echo '[Fail] device not found'"]
            .map(String::from)
            .to_vec();
        let result = b.run(&args, "send file").await;
        match result {
            Err(BinError::CommandFailed(msg)) => {
                assert!(msg.contains("send file failed"));
                assert!(msg.contains("device not found"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_output_succeeds() {
        let b = bin(Options {
            bin: "/bin/sh".to_string(),
            ..Default::default()
        });
        let args: Vec<String> = ["-c", "echo 'FileTransfer finish'"].map(String::from).to_vec();
        let out = b.run(&args, "send file").await.unwrap();
        assert!(out.contains("FileTransfer finish"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_fails_even_with_clean_output() {
        let b = bin(Options {
            bin: "/bin/sh".to_string(),
            ..Default::default()
        });
        let args: Vec<String> = ["-c", "echo done; exit 3"].map(String::from).to_vec();
        assert!(matches!(
            b.run(&args, "install").await,
            Err(BinError::CommandFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uninstall_without_positive_phrase_succeeds() {
        // Newer bridges emit nothing on successful uninstall.
        let b = bin(Options {
            bin: "/bin/sh".to_string(),
            ..Default::default()
        });
        let args: Vec<String> = ["-c", "true"].map(String::from).to_vec();
        assert!(b.run(&args, "uninstall bundle").await.is_ok());
    }
}
