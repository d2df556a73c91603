//! Configuration for qemu-bridge.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.qemu-bridge/config.toml`
//! - The emulator command line built from that configuration
//! - Bridge behavior knobs (interrupt marker, buffer cap, stderr policy)
//!
//! # Configuration File
//!
//! ```toml
//! [emulator]
//! binary_path = "/usr/bin/qemu-system-x86_64"
//! kernel_path = "bootable/boot/vmlinuz-1"
//! initrd_path = "initrd-1.0.img"
//! memory_mb = 2048
//! extra_kernel_args = ["quiet"]
//!
//! [bridge]
//! interrupt_marker = "CtrlC"
//! reader_idle_ms = 10
//! max_buffered_chunks = 10000
//! stderr = "log"          # log, merge, discard
//! startup_check_ms = 500
//!
//! [log]
//! level = "info"
//! file = "/tmp/qemu-bridge.log"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ui::dispatcher::DEFAULT_INTERRUPT_MARKER;

/// Directory under the home directory holding config and log files
const APP_DIR: &str = ".qemu-bridge";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Emulator launch settings
    pub emulator: EmulatorConfig,
    /// Bridge behavior
    pub bridge: BridgeConfig,
    /// Logging
    pub log: LogConfig,
}

/// Emulator launch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub binary_path: PathBuf,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub memory_mb: u32,
    /// Appended to the kernel command line after `console=ttyS0`
    pub extra_kernel_args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("qemu-system-x86_64"),
            kernel_path: PathBuf::from("bootable/boot/vmlinuz-1"),
            initrd_path: PathBuf::from("initrd-1.0.img"),
            memory_mb: 2048,
            extra_kernel_args: Vec::new(),
        }
    }
}

impl EmulatorConfig {
    /// Kernel command line passed with `-append`
    pub fn kernel_cmdline(&self) -> String {
        std::iter::once("console=ttyS0")
            .chain(self.extra_kernel_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Full argument vector after the binary
    pub fn args(&self) -> Vec<String> {
        vec![
            "-kernel".to_string(),
            self.kernel_path.display().to_string(),
            "-initrd".to_string(),
            self.initrd_path.display().to_string(),
            "-m".to_string(),
            self.memory_mb.to_string(),
            "-nographic".to_string(),
            "-append".to_string(),
            self.kernel_cmdline(),
        ]
    }

    /// Image files that must exist before launch
    pub fn required_images(&self) -> [&Path; 2] {
        [&self.kernel_path, &self.initrd_path]
    }
}

/// What to do with the subprocess error stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Drain into the log file
    #[default]
    Log,
    /// Drain into the output buffer alongside stdout
    Merge,
    /// Redirect to the null device
    Discard,
}

/// Bridge behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Substring that turns an input line into an interrupt
    pub interrupt_marker: String,
    /// Idle delay per reader iteration, in milliseconds
    pub reader_idle_ms: u64,
    /// Cap on buffered output chunks (unset = unbounded)
    pub max_buffered_chunks: Option<usize>,
    pub stderr: StderrMode,
    /// A failing exit within this many milliseconds of launch is a launch error
    pub startup_check_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interrupt_marker: DEFAULT_INTERRUPT_MARKER.to_string(),
            reader_idle_ms: 10,
            max_buffered_chunks: None,
            stderr: StderrMode::default(),
            startup_check_ms: 500,
        }
    }
}

impl BridgeConfig {
    pub fn reader_idle(&self) -> Duration {
        Duration::from_millis(self.reader_idle_ms)
    }

    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_check_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Log file (defaults to `~/.qemu-bridge/qemu-bridge.log`)
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    /// Resolved log file path
    pub fn file_path(&self) -> PathBuf {
        self.file
            .clone()
            .or_else(|| app_dir().map(|d| d.join("qemu-bridge.log")))
            .unwrap_or_else(|| PathBuf::from("qemu-bridge.log"))
    }
}

impl Config {
    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, content).map_err(write_err)
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        app_dir().map(|d| d.join("config.toml"))
    }
}

/// `~/.qemu-bridge`
fn app_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(APP_DIR))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
