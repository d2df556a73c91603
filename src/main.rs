//! qemu-bridge - drive a headless QEMU guest from a line-oriented console
//!
//! qemu-bridge boots a kernel + initrd under QEMU with the serial console on
//! stdio, strips color and clear-screen codes from what the guest prints, and
//! forwards each line typed by the user to the guest.
//!
//! # Quick Start
//!
//! ```text
//! qemu-bridge                              # Use ~/.qemu-bridge/config.toml
//! qemu-bridge -k vmlinuz -i initrd.img     # Override the images
//! qemu-bridge -m 512 -a quiet              # 512 MB, extra kernel argument
//! ```
//!
//! # Input
//!
//! | Input | Sent to the guest |
//! |-------|-------------------|
//! | any text | the text followed by a newline |
//! | text containing `CtrlC` | a single 0x03 byte |
//! | empty line | nothing |

mod config;
mod core;
mod ui;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::process::LaunchCommand;
use crate::core::session::{Session, SessionEnd};
use crate::ui::ConsolePresenter;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the guest gets to exit on its own before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// Config file (default: ~/.qemu-bridge/config.toml)
    config_path: Option<PathBuf>,
    binary: Option<PathBuf>,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    memory_mb: Option<u32>,
    /// Extra kernel arguments, added to the ones from the config file
    append: Vec<String>,
    /// Write the effective configuration and exit
    write_config: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(binary) = &self.binary {
            config.emulator.binary_path = binary.clone();
        }
        if let Some(kernel) = &self.kernel {
            config.emulator.kernel_path = kernel.clone();
        }
        if let Some(initrd) = &self.initrd {
            config.emulator.initrd_path = initrd.clone();
        }
        if let Some(memory) = self.memory_mb {
            config.emulator.memory_mb = memory;
        }
        config.emulator.extra_kernel_args.extend(self.append.iter().cloned());
    }
}

#[derive(Debug)]
enum Parsed {
    Run(Args),
    Help,
    Version,
}

fn print_help() {
    eprintln!("qemu-bridge {} - Drive a headless QEMU guest from a console", VERSION);
    eprintln!();
    eprintln!("Usage: qemu-bridge [OPTIONS]");
    eprintln!();
    eprintln!("Emulator options:");
    eprintln!("  -b, --binary <PATH>   QEMU binary (default: qemu-system-x86_64)");
    eprintln!("  -k, --kernel <PATH>   Kernel image");
    eprintln!("  -i, --initrd <PATH>   Initrd image");
    eprintln!("  -m, --memory <MB>     Guest memory in MB");
    eprintln!("  -a, --append <ARG>    Extra kernel argument (repeatable)");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -c, --config <PATH>   Config file (default: ~/.qemu-bridge/config.toml)");
    eprintln!("      --write-config    Save the effective configuration and exit");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Input:");
    eprintln!("  A line containing CtrlC sends an interrupt (0x03) to the guest.");
    eprintln!("  Empty lines are not forwarded.");
    eprintln!();
    eprintln!("Log file: ~/.qemu-bridge/qemu-bridge.log (RUST_LOG overrides the level)");
}

fn parse_args<I>(args: I) -> Result<Parsed, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
        args.next().ok_or_else(|| format!("Missing value for {}", flag))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Parsed::Help),
            "-v" | "--version" => return Ok(Parsed::Version),
            "-c" | "--config" => parsed.config_path = Some(value(&mut args, &arg)?.into()),
            "-b" | "--binary" => parsed.binary = Some(value(&mut args, &arg)?.into()),
            "-k" | "--kernel" => parsed.kernel = Some(value(&mut args, &arg)?.into()),
            "-i" | "--initrd" => parsed.initrd = Some(value(&mut args, &arg)?.into()),
            "-m" | "--memory" => {
                let raw = value(&mut args, &arg)?;
                let mb = raw
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid memory size: {}", raw))?;
                parsed.memory_mb = Some(mb);
            }
            "-a" | "--append" => parsed.append.push(value(&mut args, &arg)?),
            "--write-config" => parsed.write_config = true,
            other => return Err(format!("Unknown argument: {}. Use -h for help.", other)),
        }
    }

    Ok(Parsed::Run(parsed))
}

/// Initialize logging to file
fn init_logging(config: &Config) {
    let log_path = config.log.file_path();

    // Create log directory if needed
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    let file = match log_file {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {}", log_path.display(), e);
            return;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Load the config file, falling back to defaults if it is unreadable
fn load_config(path: Option<&PathBuf>) -> (Config, Option<String>) {
    let Some(path) = path.cloned().or_else(Config::default_path) else {
        return (Config::default(), None);
    };

    match Config::load_from(&path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    }
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args(env::args().skip(1)) {
        Ok(Parsed::Run(args)) => args,
        Ok(Parsed::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Parsed::Version) => {
            eprintln!("qemu-bridge {}", VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let (mut config, config_error) = load_config(args.config_path.as_ref());
    args.apply(&mut config);

    init_logging(&config);
    info!("qemu-bridge {} starting...", VERSION);
    if let Some(e) = config_error {
        warn!("{}; using defaults", e);
        eprintln!("Warning: {}; using defaults", e);
    }

    if args.write_config {
        let path = args
            .config_path
            .clone()
            .or_else(Config::default_path)
            .context("Could not determine config path")?;
        config.save_to(&path)?;
        eprintln!("Wrote {}", path.display());
        return Ok(());
    }

    run(&config)
}

fn run(config: &Config) -> anyhow::Result<()> {
    let command = LaunchCommand::emulator(&config.emulator);
    info!("Command: {:?} {:?}", command.program, command.args);

    let mut session = match Session::start(config) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start emulator: {}", e);
            return Err(e).context("Failed to start emulator");
        }
    };
    info!("Emulator running (pid {})", session.pid());

    let mut console = ConsolePresenter::stdio().with_prompt("qemu> ");
    let end = session.run(&mut console)?;
    info!("Session ended: {:?}", end);

    if end == SessionEnd::InputClosed {
        match session.shutdown(SHUTDOWN_GRACE) {
            Ok(code) => info!("Emulator stopped (exit code {:?})", code),
            Err(e) => warn!("Emulator shutdown failed: {}", e),
        }
    }

    check_session_end(end)
}

/// An emulator that dies on its own with a failing status fails the bridge too
fn check_session_end(end: SessionEnd) -> anyhow::Result<()> {
    match end {
        SessionEnd::InputClosed | SessionEnd::ProcessExited(Some(0)) => Ok(()),
        SessionEnd::ProcessExited(Some(code)) => {
            error!("Emulator exited with code {}", code);
            anyhow::bail!("Emulator exited with code {}", code)
        }
        SessionEnd::ProcessExited(None) => {
            error!("Emulator terminated by a signal");
            anyhow::bail!("Emulator terminated by a signal")
        }
    }
}
