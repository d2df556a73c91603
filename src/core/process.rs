//! Emulator process supervisor
//!
//! Owns the child process and its input stream. Starting the supervisor
//! launches the child with piped stdio and hands the output streams to the
//! reader threads (see [`super::reader`]).

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::buffer::OutputBuffer;
use super::reader::{self, StderrTail};
use crate::config::{EmulatorConfig, StderrMode};

/// ETX, what a terminal sends for Ctrl+C
pub const INTERRUPT_BYTE: u8 = 0x03;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Image file not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Process exited immediately with {status}{}", stderr_suffix(.stderr))]
    ExitedImmediately { status: ExitStatus, stderr: String },

    #[error("Process is not running")]
    NotRunning,

    #[error("Process has exited with code: {0:?}")]
    ProcessExited(Option<i32>),

    #[error("Failed to write to process: {0}")]
    Write(#[source] io::Error),

    #[error("Process I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// Program and arguments to launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Files that must exist before spawning
    pub required_files: Vec<PathBuf>,
}

impl LaunchCommand {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            required_files: Vec::new(),
        }
    }

    /// Build the emulator command line from configuration
    pub fn emulator(config: &EmulatorConfig) -> Self {
        let mut command = Self::new(config.binary_path.clone(), config.args());
        command.required_files = config
            .required_images()
            .iter()
            .map(|p| p.to_path_buf())
            .collect();
        command
    }

    fn display_program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn check_files(&self) -> Result<()> {
        match self.required_files.iter().find(|p| !p.exists()) {
            Some(missing) => Err(ProcessError::ImageNotFound(missing.clone())),
            None => Ok(()),
        }
    }
}

/// How the reader side is wired up
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub idle: Duration,
    pub stderr: StderrMode,
    /// A failing exit within this window after spawn is a launch error
    pub startup_window: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(10),
            stderr: StderrMode::Log,
            startup_window: Duration::from_millis(500),
        }
    }
}

/// Supervised child process
pub struct Supervisor {
    child: Child,
    stdin: Option<ChildStdin>,
    /// Cleared by the stdout reader at end of stream
    running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Launch `command` and start the reader thread feeding `buffer`
    pub fn start(
        command: &LaunchCommand,
        buffer: Arc<OutputBuffer>,
        options: ReaderOptions,
    ) -> Result<Self> {
        command.check_files()?;

        let stderr = match options.stderr {
            StderrMode::Discard => Stdio::null(),
            StderrMode::Log | StderrMode::Merge => Stdio::piped(),
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env("QEMU_BRIDGE", "1")
            .env("QEMU_BRIDGE_VERSION", env!("CARGO_PKG_VERSION"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: command.display_program(),
                source,
            })?;

        info!("Started {} (pid {})", command.display_program(), child.id());

        let stdin = child.stdin.take();
        let running = Arc::new(AtomicBool::new(true));

        // The reader owns stdout from here on; handing it over is the
        // readiness signal, there is nothing to poll for.
        let reader_thread = child.stdout.take().map(|stdout| {
            reader::spawn_output_reader(stdout, buffer.clone(), options.idle, running.clone())
        });

        let tail = StderrTail::default();
        let stderr_thread = child.stderr.take().map(|stderr| match options.stderr {
            StderrMode::Merge => reader::spawn_stderr_merger(stderr, buffer.clone(), tail.clone()),
            _ => reader::spawn_stderr_logger(stderr, tail.clone()),
        });

        let mut supervisor = Self {
            child,
            stdin,
            running,
            reader_thread,
            stderr_thread,
        };

        // A missing shared library, a bad flag or too little host memory
        // kills the emulator within moments of the spawn
        if let Some(status) = supervisor.wait_startup(options.startup_window)? {
            supervisor.settle_stderr(Duration::from_millis(200));
            let stderr = tail.text();
            warn!("{} exited during startup with {}", command.display_program(), status);
            return Err(ProcessError::ExitedImmediately { status, stderr });
        }

        Ok(supervisor)
    }

    /// Watch the child for `window`; returns the status if it failed
    fn wait_startup(&mut self, window: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + window;
        loop {
            match self.child.try_wait()? {
                Some(status) if status.success() => return Ok(None),
                Some(status) => return Ok(Some(status)),
                None if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                None => return Ok(None),
            }
        }
    }

    /// Give the stderr reader up to `timeout` to reach end of stream
    fn settle_stderr(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        if let Some(handle) = &self.stderr_thread {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Process identifier
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Output stream still open (false once the reader saw end of stream)
    pub fn is_wired(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll for the exit code for up to `timeout`.
    ///
    /// The output pipe closes slightly before the exit status is available.
    pub fn reap(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                _ => return None,
            }
        }
    }

    /// Write `text` plus a newline and flush
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_raw(&line)
    }

    /// Write a single raw byte (no newline) and flush
    pub fn send_signal_byte(&mut self, byte: u8) -> Result<()> {
        self.write_raw(&[byte])
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            return Err(ProcessError::ProcessExited(status.code()));
        }

        let stdin = self.stdin.as_mut().ok_or(ProcessError::NotRunning)?;
        let result = stdin.write_all(data).and_then(|_| stdin.flush());

        match result {
            Ok(()) => {
                debug!("Wrote {} bytes to pid {}", data.len(), self.child.id());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // The child closed stdin or is on its way out
                let code = self.child.try_wait().ok().flatten().and_then(|s| s.code());
                Err(ProcessError::ProcessExited(code))
            }
            Err(e) => Err(ProcessError::Write(e)),
        }
    }

    /// Close the input stream so the child sees end of file
    pub fn close_input(&mut self) {
        self.stdin = None;
    }

    /// Close input, give the child `grace` to exit, then kill it.
    ///
    /// Waits for the reader threads so all output is buffered on return.
    pub fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>> {
        self.close_input();

        if self.reap(grace).is_none() && self.is_running() {
            info!("Pid {} still running after {:?}, killing", self.child.id(), grace);
            self.child.kill()?;
        }
        let status = self.child.wait()?;

        self.join_readers();
        Ok(status.code())
    }

    fn join_readers(&mut self) {
        for handle in [self.reader_thread.take(), self.stderr_thread.take()]
            .into_iter()
            .flatten()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.close_input();

        if self.is_running() {
            info!("Stopping pid {}", self.child.id());
            if let Err(e) = self.child.kill() {
                warn!("Failed to kill pid {}: {}", self.child.id(), e);
            }
        }
        let _ = self.child.wait();

        // Detached; they exit at end of stream
        self.reader_thread.take();
        self.stderr_thread.take();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const GRACE: Duration = Duration::from_secs(5);

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand::new("sh", ["-c", script])
    }

    fn fast() -> ReaderOptions {
        ReaderOptions {
            idle: Duration::from_millis(1),
            stderr: StderrMode::Log,
            startup_window: Duration::from_millis(50),
        }
    }

    fn pid_alive(pid: u32) -> bool {
        Command::new("sh")
            .args(["-c", &format!("kill -0 {} 2>/dev/null", pid)])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn wait_for_output(buffer: &OutputBuffer, expected_chunks: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut chunks = Vec::new();
        while chunks.len() < expected_chunks && Instant::now() < deadline {
            chunks.extend(buffer.drain().chunks);
            thread::sleep(Duration::from_millis(5));
        }
        chunks
    }

    #[test]
    fn test_missing_image_is_launch_error() {
        let dir = tempdir().unwrap();
        let config = EmulatorConfig {
            binary_path: PathBuf::from("sh"),
            kernel_path: dir.path().join("vmlinuz"),
            initrd_path: dir.path().join("initrd.img"),
            ..Default::default()
        };

        let err = Supervisor::start(
            &LaunchCommand::emulator(&config),
            Arc::new(OutputBuffer::new()),
            fast(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProcessError::ImageNotFound(ref p) if p.ends_with("vmlinuz")));
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let command = LaunchCommand::new("/nonexistent/qemu-system-x86_64", ["-nographic"]);
        let err = Supervisor::start(&command, Arc::new(OutputBuffer::new()), fast())
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_early_failure_is_launch_error() {
        let options = ReaderOptions {
            startup_window: GRACE,
            ..fast()
        };
        let err = Supervisor::start(
            &sh("echo 'qemu: cannot set up guest memory' >&2; exit 1"),
            Arc::new(OutputBuffer::new()),
            options,
        )
        .err()
        .unwrap();

        match err {
            ProcessError::ExitedImmediately { status, ref stderr } => {
                assert_eq!(status.code(), Some(1));
                assert_eq!(stderr, "qemu: cannot set up guest memory");
            }
            ref other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("cannot set up guest memory"));
    }

    #[test]
    fn test_failure_after_startup_window_is_not_launch_error() {
        let mut supervisor =
            Supervisor::start(&sh("sleep 0.3; exit 1"), Arc::new(OutputBuffer::new()), fast())
                .unwrap();
        assert_eq!(supervisor.reap(GRACE), Some(1));
    }

    #[test]
    fn test_quick_clean_exit_is_not_launch_error() {
        let options = ReaderOptions {
            startup_window: GRACE,
            ..fast()
        };
        let mut supervisor =
            Supervisor::start(&sh("exit 0"), Arc::new(OutputBuffer::new()), options).unwrap();
        assert_eq!(supervisor.reap(GRACE), Some(0));
    }

    #[test]
    fn test_bridge_environment_is_set() {
        let buffer = Arc::new(OutputBuffer::new());
        let mut supervisor = Supervisor::start(
            &sh(r#"echo "$QEMU_BRIDGE $QEMU_BRIDGE_VERSION""#),
            buffer.clone(),
            fast(),
        )
        .unwrap();
        supervisor.shutdown(GRACE).unwrap();

        assert_eq!(
            buffer.drain().chunks,
            vec![format!("1 {}\n", env!("CARGO_PKG_VERSION"))]
        );
    }

    #[test]
    fn test_shutdown_kills_process_ignoring_eof() {
        let mut supervisor = Supervisor::start(
            &sh("trap '' HUP; exec sleep 30"),
            Arc::new(OutputBuffer::new()),
            fast(),
        )
        .unwrap();

        let started = Instant::now();
        let code = supervisor.shutdown(Duration::from_millis(100)).unwrap();

        assert!(started.elapsed() < GRACE, "shutdown took {:?}", started.elapsed());
        assert_eq!(code, None);
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_drop_kills_process() {
        let supervisor =
            Supervisor::start(&sh("exec sleep 30"), Arc::new(OutputBuffer::new()), fast()).unwrap();
        let pid = supervisor.pid();
        assert!(pid_alive(pid));

        drop(supervisor);
        assert!(!pid_alive(pid));
    }

    #[test]
    fn test_startup_output_is_sanitized() {
        let buffer = Arc::new(OutputBuffer::new());
        let mut supervisor = Supervisor::start(
            &sh(r"printf '\033[32mREADY\033[0m\n'; cat >/dev/null"),
            buffer.clone(),
            fast(),
        )
        .unwrap();

        assert_eq!(wait_for_output(&buffer, 1), vec!["READY\n"]);
        assert!(supervisor.is_running());

        supervisor.shutdown(GRACE).unwrap();
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_write_line_appends_newline() {
        let dir = tempdir().unwrap();
        let capture = dir.path().join("stdin.bin");
        let script = format!("cat > '{}'", capture.display());

        let mut supervisor =
            Supervisor::start(&sh(&script), Arc::new(OutputBuffer::new()), fast()).unwrap();
        supervisor.write_line("ls").unwrap();
        supervisor.shutdown(GRACE).unwrap();

        assert_eq!(fs::read(&capture).unwrap(), b"ls\n");
    }

    #[test]
    fn test_signal_byte_is_written_raw() {
        let dir = tempdir().unwrap();
        let capture = dir.path().join("stdin.bin");
        let script = format!("cat > '{}'", capture.display());

        let mut supervisor =
            Supervisor::start(&sh(&script), Arc::new(OutputBuffer::new()), fast()).unwrap();
        supervisor.send_signal_byte(INTERRUPT_BYTE).unwrap();
        supervisor.shutdown(GRACE).unwrap();

        assert_eq!(fs::read(&capture).unwrap(), vec![0x03]);
    }

    #[test]
    fn test_write_after_exit_is_reported() {
        let mut supervisor =
            Supervisor::start(&sh("read line; exit 3"), Arc::new(OutputBuffer::new()), fast())
                .unwrap();
        supervisor.write_line("bye").unwrap();

        assert_eq!(supervisor.reap(GRACE), Some(3));
        assert!(!supervisor.is_running());

        let err = supervisor.write_line("hello?").unwrap_err();
        assert!(matches!(err, ProcessError::ProcessExited(Some(3))));
    }

    #[test]
    fn test_reader_marks_unwired_at_eof() {
        let buffer = Arc::new(OutputBuffer::new());
        let mut supervisor = Supervisor::start(&sh("echo bye"), buffer.clone(), fast()).unwrap();
        supervisor.shutdown(GRACE).unwrap();

        assert!(!supervisor.is_wired());
        assert_eq!(buffer.drain().chunks, vec!["bye\n"]);
    }

    #[test]
    fn test_stderr_merge_and_discard() {
        let script = r"printf '\033[31moops\033[0m\n' >&2";

        let buffer = Arc::new(OutputBuffer::new());
        let options = ReaderOptions {
            stderr: StderrMode::Merge,
            ..fast()
        };
        let mut supervisor = Supervisor::start(&sh(script), buffer.clone(), options).unwrap();
        supervisor.shutdown(GRACE).unwrap();
        assert_eq!(buffer.drain().chunks, vec!["oops\n"]);

        let buffer = Arc::new(OutputBuffer::new());
        let options = ReaderOptions {
            stderr: StderrMode::Discard,
            ..fast()
        };
        let mut supervisor = Supervisor::start(&sh(script), buffer.clone(), options).unwrap();
        supervisor.shutdown(GRACE).unwrap();
        assert!(buffer.is_empty());
    }
}
