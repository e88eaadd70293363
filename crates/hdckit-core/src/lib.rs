//! # hdckit-core
//!
//! Client library for the OpenHarmony `hdc` device bridge.
//!
//! This crate speaks the bridge's length-prefixed channel protocol to
//! enumerate devices, run shells, stream logs, and manage port mappings;
//! shells out to the native binary for the file and package verbs the
//! socket does not expose; and drives the on-device uitest agent over a
//! second, sentinel-framed RPC protocol through a forwarded TCP port.
//!
//! ## Modules
//!
//! - [`config`] - Connection settings and environment defaults
//! - [`protocol`] - Channel frame codec and textual reply parsers
//! - [`connection`] - One TCP connection: handshake, frames, streams
//! - [`client`] - Server-global operations and the connection factory
//! - [`target`] - Per-device operations (shell, port mappings, files)
//! - [`hilog`] - Device log streaming
//! - [`tracker`] - Background polling for device arrivals/departures
//! - [`hdc_bin`] - Subprocess bridge to the native `hdc` binary
//! - [`ui_rpc`] - uitest agent framing and session multiplexing
//! - [`ui_driver`] - Agent bootstrap and UI automation calls
//! - [`util`] - Version compare, image sniffing, pid-file lookup
//!
//! ## Example
//!
//! ```no_run
//! use hdckit_core::{Client, Options};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Options::default());
//! for key in client.list_targets().await? {
//!     let out = client.target(&key).shell_output("echo hello").await?;
//!     println!("{key}: {}", String::from_utf8_lossy(&out));
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod hdc_bin;
pub mod hilog;
pub mod protocol;
pub mod target;
pub mod tracker;
pub mod ui_driver;
pub mod ui_rpc;
pub mod util;

pub use client::Client;
pub use config::Options;
pub use protocol::Forward;
pub use target::Target;
pub use tracker::TargetTracker;
pub use ui_driver::UiDriver;
