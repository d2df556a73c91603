//! Session management
//!
//! Ties the supervised emulator, the output buffer and the input dispatcher
//! together and runs the session loop against a [`Presenter`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use super::buffer::OutputBuffer;
use super::process::{LaunchCommand, ProcessError, ReaderOptions, Supervisor};
use crate::config::{BridgeConfig, Config};
use crate::ui::{Dispatched, InputDispatcher, Presenter};

/// Why the session loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The presenter has no more input
    InputClosed,
    /// The emulator went away
    ProcessExited(Option<i32>),
}

/// A bridged emulator session
pub struct Session {
    buffer: Arc<OutputBuffer>,
    supervisor: Supervisor,
    dispatcher: InputDispatcher,
}

impl Session {
    /// Launch the emulator described by `config`
    pub fn start(config: &Config) -> Result<Self, ProcessError> {
        Self::start_command(&LaunchCommand::emulator(&config.emulator), &config.bridge)
    }

    /// Launch an arbitrary command with the given bridge settings
    pub fn start_command(command: &LaunchCommand, bridge: &BridgeConfig) -> Result<Self, ProcessError> {
        let buffer = Arc::new(OutputBuffer::with_capacity_limit(bridge.max_buffered_chunks));
        let options = ReaderOptions {
            idle: bridge.reader_idle(),
            stderr: bridge.stderr,
            startup_window: bridge.startup_window(),
        };
        let supervisor = Supervisor::start(command, buffer.clone(), options)?;

        Ok(Self {
            buffer,
            supervisor,
            dispatcher: InputDispatcher::new(bridge.interrupt_marker.clone()),
        })
    }

    pub fn pid(&self) -> u32 {
        self.supervisor.pid()
    }

    /// Send one line of user input to the emulator
    pub fn dispatch(&mut self, text: &str) -> Result<Dispatched, ProcessError> {
        self.dispatcher.dispatch(text, &mut self.supervisor)
    }

    /// Move buffered output to the presenter.
    ///
    /// Returns true if anything was emitted.
    pub fn flush<P: Presenter + ?Sized>(&self, presenter: &mut P) -> std::io::Result<bool> {
        let drained = self.buffer.drain();
        if drained.is_empty() {
            return Ok(false);
        }

        if drained.dropped > 0 {
            presenter.emit(&format!("[{} lines dropped]\n", drained.dropped))?;
        }
        presenter.emit(&drained.text())?;
        presenter.scroll_to_bottom()?;
        Ok(true)
    }

    /// Run until input ends or the emulator exits
    pub fn run<P: Presenter + ?Sized>(&mut self, presenter: &mut P) -> anyhow::Result<SessionEnd> {
        loop {
            // Sampled before the flush: the reader clears it only after its last append
            let wired = self.supervisor.is_wired();
            self.flush(presenter).context("Failed to display output")?;

            if !wired {
                let code = self.supervisor.reap(Duration::from_secs(1));
                info!("Emulator output closed (exit code {:?})", code);
                return Ok(SessionEnd::ProcessExited(code));
            }

            let Some(line) = presenter.read_next_input().context("Failed to read input")? else {
                info!("Input closed");
                return Ok(SessionEnd::InputClosed);
            };

            if line.is_empty() {
                continue;
            }

            match self.dispatch(&line) {
                Ok(_) => presenter.scroll_to_bottom()?,
                Err(ProcessError::ProcessExited(code)) => {
                    warn!("Input dropped, emulator exited with code {:?}", code);
                    self.flush(presenter)?;
                    presenter.emit(&format!("[emulator exited with code {:?}]\n", code))?;
                    presenter.scroll_to_bottom()?;
                    return Ok(SessionEnd::ProcessExited(code));
                }
                Err(e) => return Err(e).context("Failed to forward input"),
            }
        }
    }

    /// Stop the emulator, killing it if it outlives `grace`
    pub fn shutdown(mut self, grace: Duration) -> Result<Option<i32>, ProcessError> {
        self.supervisor.shutdown(grace)
    }
}
