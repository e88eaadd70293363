//! Client configuration.
//!
//! [`Options`] describes how to reach the hdc server and which native binary
//! to delegate to for the operations the socket protocol does not expose.
//! Values are fixed at construction; cloning is cheap.
//!
//! # Example
//!
//! ```
//! use hdckit_core::config::Options;
//!
//! let opts = Options {
//!     host: "10.0.0.5".to_string(),
//!     ..Default::default()
//! };
//! assert_eq!(opts.server_addr(), "10.0.0.5:8710");
//! ```

/// Environment variable the hdc toolchain uses to relocate the server port.
pub const SERVER_PORT_ENV: &str = "OHOS_HDC_SERVER_PORT";

/// Default TCP port of the hdc server.
pub const DEFAULT_PORT: u16 = 8710;

/// Connection settings shared by every operation of one client.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hostname or IP address of the hdc server.
    pub host: String,
    /// TCP port of the hdc server.
    pub port: u16,
    /// Path to the native `hdc` binary used for file/install verbs and
    /// server auto-start.
    pub bin: String,
    /// Emit protocol-boundary diagnostics.
    pub debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: port_from_env(),
            bin: "hdc".to_string(),
            debug: false,
        }
    }
}

impl Options {
    /// The `host:port` string used for dialing and for the subprocess
    /// `-s` argument.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolves the default port, honoring [`SERVER_PORT_ENV`] when it holds a
/// parseable value.
fn port_from_env() -> u16 {
    resolve_port(std::env::var(SERVER_PORT_ENV).ok().as_deref())
}

fn resolve_port(raw: Option<&str>) -> u16 {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(DEFAULT_PORT)
}
