//! Command-line client for the OpenHarmony hdc device bridge.
//!
//! # Usage
//!
//! ```bash
//! # List connected devices
//! hdckit list
//!
//! # Watch devices come and go
//! hdckit track
//!
//! # Run a shell command (target optional with a single device)
//! hdckit shell "echo hello"
//! hdckit -t ABC123 shell "echo hello"
//!
//! # Port forwarding
//! hdckit forward add tcp:9000 tcp:8000
//! hdckit forward list
//! hdckit forward remove tcp:9000 tcp:8000
//!
//! # Reverse forwarding
//! hdckit reverse add tcp:8001 tcp:9100
//! hdckit reverse list
//!
//! # Files and packages
//! hdckit file send ./a.txt /data/local/tmp/a.txt
//! hdckit file recv /data/local/tmp/a.txt ./a.txt
//! hdckit install ./app.hap
//! hdckit uninstall com.example.app
//!
//! # Device log (clear first)
//! hdckit hilog --clear
//!
//! # UI automation
//! hdckit ui size
//! hdckit ui capture --out frames --count 5
//! hdckit ui input "hello"
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hdckit_core::connection::ConnectionError;
use hdckit_core::target::TargetError;
use hdckit_core::ui_driver::UiError;
use hdckit_core::util::image_ext;
use hdckit_core::{Client, Options, Target};

/// Command-line client for the OpenHarmony hdc device bridge.
#[derive(Parser)]
#[command(name = "hdckit")]
#[command(about = "Talk to an OpenHarmony hdc server")]
#[command(version)]
struct Cli {
    /// hdc server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// hdc server port (0 uses OHOS_HDC_SERVER_PORT or 8710)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Path to the native hdc binary
    #[arg(long, default_value = "hdc")]
    bin: String,

    /// Device connect key; optional when exactly one device is attached
    #[arg(short, long)]
    target: Option<String>,

    /// Enable protocol-boundary debug logs
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connected devices
    List,

    /// Print device arrivals and departures until interrupted
    Track,

    /// Run a shell command on the device
    Shell {
        /// The command line to run
        command: Vec<String>,
    },

    /// Manage forward port mappings (host -> device)
    Forward {
        #[command(subcommand)]
        action: PortAction,
    },

    /// Manage reverse port mappings (device -> host)
    Reverse {
        #[command(subcommand)]
        action: ReverseAction,
    },

    /// Transfer files
    File {
        #[command(subcommand)]
        action: FileAction,
    },

    /// Install an application package
    Install {
        /// Local .hap path
        hap: String,
    },

    /// Uninstall an application bundle
    Uninstall {
        /// Bundle name
        bundle: String,
    },

    /// Stream the device log
    Hilog {
        /// Clear the log buffer before streaming
        #[arg(long)]
        clear: bool,
    },

    /// UI automation via the uitest agent
    Ui {
        #[command(subcommand)]
        action: UiAction,
    },
}

#[derive(Subcommand)]
enum PortAction {
    /// Add a mapping
    Add { local: String, remote: String },
    /// List mappings
    List,
    /// Remove a mapping
    Remove { local: String, remote: String },
}

#[derive(Subcommand)]
enum ReverseAction {
    /// Add a mapping
    Add { remote: String, local: String },
    /// List mappings
    List,
    /// Remove a mapping
    Remove { remote: String, local: String },
}

#[derive(Subcommand)]
enum FileAction {
    /// Push a local file to the device
    Send { local: String, remote: String },
    /// Pull a device file to the host
    Recv { remote: String, local: String },
}

#[derive(Subcommand)]
enum UiAction {
    /// Print the display size
    Size,
    /// Save screen-capture frames to a directory
    Capture {
        /// Output directory for frames
        #[arg(long, default_value = "frames")]
        out: PathBuf,
        /// Stop after this many frames
        #[arg(long, default_value_t = 10)]
        count: u64,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Frame scale factor (0 < scale < 1 shrinks; anything else is full size)
        #[arg(long, default_value_t = 1.0)]
        scale: f64,
    },
    /// Type text on the device
    Input {
        text: String,
        #[arg(long, default_value_t = 0)]
        x: i32,
        #[arg(long, default_value_t = 0)]
        y: i32,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Ui(#[from] UiError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Usage(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "hdckit_core=debug,info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn client_from(cli: &Cli) -> Client {
    let defaults = Options::default();
    Client::new(Options {
        host: cli.host.clone(),
        port: if cli.port == 0 { defaults.port } else { cli.port },
        bin: cli.bin.clone(),
        debug: cli.debug,
    })
}

/// Resolve the target: the explicit flag, or the only attached device.
async fn resolve_target(client: &Client, cli: &Cli) -> Result<Target, CliError> {
    if let Some(key) = &cli.target {
        return Ok(client.target(key.clone()));
    }
    let targets = client.list_targets().await?;
    match targets.as_slice() {
        [only] => Ok(client.target(only.clone())),
        [] => Err(CliError::Usage("no devices attached".into())),
        _ => Err(CliError::Usage(
            "multiple devices attached; pick one with --target".into(),
        )),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let client = client_from(&cli);

    match &cli.command {
        Command::List => {
            for key in client.list_targets().await? {
                println!("{key}");
            }
        }

        Command::Track => {
            let mut tracker = client.track_targets();
            loop {
                tokio::select! {
                    Some(key) = tracker.added.recv() => println!("add: {key}"),
                    Some(key) = tracker.removed.recv() => println!("remove: {key}"),
                    Some(err) = tracker.errors.recv() => eprintln!("error: {err}"),
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            tracker.stop().await;
        }

        Command::Shell { command } => {
            if command.is_empty() {
                return Err(CliError::Usage("shell needs a command".into()));
            }
            let target = resolve_target(&client, &cli).await?;
            let out = target.shell_output(&command.join(" ")).await?;
            print_bytes(&out);
        }

        Command::Forward { action } => {
            let target = resolve_target(&client, &cli).await?;
            match action {
                PortAction::Add { local, remote } => {
                    target.forward(local, remote).await?;
                    println!("{local} -> {remote}");
                }
                PortAction::List => {
                    for f in target.list_forwards().await? {
                        println!("{} {} {}", f.target, f.local, f.remote);
                    }
                }
                PortAction::Remove { local, remote } => {
                    target.remove_forward(local, remote).await?;
                    println!("removed {local} -> {remote}");
                }
            }
        }

        Command::Reverse { action } => {
            let target = resolve_target(&client, &cli).await?;
            match action {
                ReverseAction::Add { remote, local } => {
                    target.reverse(remote, local).await?;
                    println!("{remote} <- {local}");
                }
                ReverseAction::List => {
                    for f in target.list_reverses().await? {
                        println!("{} {} {}", f.target, f.local, f.remote);
                    }
                }
                ReverseAction::Remove { remote, local } => {
                    target.remove_reverse(remote, local).await?;
                    println!("removed {remote} <- {local}");
                }
            }
        }

        Command::File { action } => {
            let target = resolve_target(&client, &cli).await?;
            match action {
                FileAction::Send { local, remote } => {
                    target.send_file(local, remote).await?;
                    println!("sent {local} -> {remote}");
                }
                FileAction::Recv { remote, local } => {
                    target.recv_file(remote, local).await?;
                    println!("received {remote} -> {local}");
                }
            }
        }

        Command::Install { hap } => {
            let target = resolve_target(&client, &cli).await?;
            target.install(hap).await?;
            println!("installed {hap}");
        }

        Command::Uninstall { bundle } => {
            let target = resolve_target(&client, &cli).await?;
            target.uninstall(bundle).await?;
            println!("uninstalled {bundle}");
        }

        Command::Hilog { clear } => {
            let target = resolve_target(&client, &cli).await?;
            let mut stream = target.open_hilog(*clear).await?;
            tokio::select! {
                out = stream.read_all() => print_bytes(&out?),
                _ = tokio::signal::ctrl_c() => {}
            }
            stream.close();
        }

        Command::Ui { action } => {
            let target = resolve_target(&client, &cli).await?;
            let driver = target.ui_driver();
            driver.start().await?;
            let result = run_ui(&driver, action).await;
            driver.stop().await;
            result?;
        }
    }

    Ok(())
}

async fn run_ui(driver: &hdckit_core::UiDriver, action: &UiAction) -> Result<(), CliError> {
    match action {
        UiAction::Size => {
            let size = driver.get_display_size().await?;
            println!("{size}");
        }

        UiAction::Capture {
            out,
            count,
            timeout,
            scale,
        } => {
            std::fs::create_dir_all(out)?;
            let saved = Arc::new(AtomicU64::new(0));
            let dir = out.clone();
            let max = *count;
            let counter = Arc::clone(&saved);
            driver
                .start_capture_screen(
                    move |frame| {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if n > max {
                            return;
                        }
                        let name = format!("frame_{n:03}.{}", image_ext(frame));
                        if std::fs::write(dir.join(&name), frame).is_ok() {
                            eprintln!("saved {name} ({} bytes)", frame.len());
                        }
                    },
                    *scale,
                )
                .await?;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(*timeout);
            loop {
                if saved.load(Ordering::SeqCst) >= max {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            driver.stop_capture_screen().await?;
        }

        UiAction::Input { text, x, y } => {
            driver.input_text(text, *x, *y).await?;
        }
    }
    Ok(())
}

fn print_bytes(bytes: &[u8]) {
    use std::io::Write;
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(bytes);
    let _ = stdout.flush();
}
