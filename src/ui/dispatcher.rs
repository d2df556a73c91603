//! Input dispatch
//!
//! Converts a line of user input into bytes for the emulator: an interrupt
//! byte when the line carries the interrupt marker, otherwise the line itself
//! followed by a newline.

use tracing::debug;

use crate::core::process::{ProcessError, Supervisor, INTERRUPT_BYTE};

/// Default marker that requests an interrupt
pub const DEFAULT_INTERRUPT_MARKER: &str = "CtrlC";

/// Where dispatched input goes
pub trait InputSink {
    fn write_line(&mut self, text: &str) -> Result<(), ProcessError>;
    fn send_signal_byte(&mut self, byte: u8) -> Result<(), ProcessError>;
}

impl InputSink for Supervisor {
    fn write_line(&mut self, text: &str) -> Result<(), ProcessError> {
        Supervisor::write_line(self, text)
    }

    fn send_signal_byte(&mut self, byte: u8) -> Result<(), ProcessError> {
        Supervisor::send_signal_byte(self, byte)
    }
}

/// What a line of input was turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Forwarded as a command line
    Line,
    /// Replaced by the interrupt byte
    Interrupt,
    /// Empty input, nothing written
    Nothing,
}

/// Classifies user input and forwards it
#[derive(Debug, Clone)]
pub struct InputDispatcher {
    interrupt_marker: String,
}

impl Default for InputDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_INTERRUPT_MARKER)
    }
}

impl InputDispatcher {
    pub fn new(interrupt_marker: impl Into<String>) -> Self {
        Self {
            interrupt_marker: interrupt_marker.into(),
        }
    }

    /// Classify `text` without writing anything
    pub fn classify(&self, text: &str) -> Dispatched {
        if text.is_empty() {
            Dispatched::Nothing
        } else if !self.interrupt_marker.is_empty() && text.contains(&self.interrupt_marker) {
            Dispatched::Interrupt
        } else {
            Dispatched::Line
        }
    }

    /// Forward `text` to `sink`
    pub fn dispatch<S: InputSink + ?Sized>(
        &self,
        text: &str,
        sink: &mut S,
    ) -> Result<Dispatched, ProcessError> {
        let kind = self.classify(text);
        match kind {
            Dispatched::Nothing => {}
            Dispatched::Interrupt => {
                debug!("Interrupt requested");
                sink.send_signal_byte(INTERRUPT_BYTE)?;
            }
            Dispatched::Line => {
                debug!("Forwarding {} byte line", text.len());
                sink.write_line(text)?;
            }
        }
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the bytes a real process would have received
    #[derive(Default)]
    struct RecordingSink {
        bytes: Vec<u8>,
        writes: usize,
        exited: bool,
    }

    impl InputSink for RecordingSink {
        fn write_line(&mut self, text: &str) -> Result<(), ProcessError> {
            if self.exited {
                return Err(ProcessError::ProcessExited(Some(0)));
            }
            self.bytes.extend_from_slice(text.as_bytes());
            self.bytes.push(b'\n');
            self.writes += 1;
            Ok(())
        }

        fn send_signal_byte(&mut self, byte: u8) -> Result<(), ProcessError> {
            if self.exited {
                return Err(ProcessError::ProcessExited(Some(0)));
            }
            self.bytes.push(byte);
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_plain_line_gets_newline() {
        let mut sink = RecordingSink::default();
        let result = InputDispatcher::default().dispatch("ls", &mut sink).unwrap();

        assert_eq!(result, Dispatched::Line);
        assert_eq!(sink.bytes, b"ls\n");
        assert_eq!(sink.writes, 1);
    }

    #[test]
    fn test_marker_sends_single_interrupt_byte() {
        let dispatcher = InputDispatcher::default();
        for text in ["CtrlC", "abortCtrlC", "CtrlC now please"] {
            let mut sink = RecordingSink::default();
            assert_eq!(dispatcher.dispatch(text, &mut sink).unwrap(), Dispatched::Interrupt);
            assert_eq!(sink.bytes, vec![0x03], "input {:?}", text);
        }
    }

    #[test]
    fn test_marker_is_case_sensitive() {
        let mut sink = RecordingSink::default();
        let result = InputDispatcher::default().dispatch("ctrlc", &mut sink).unwrap();

        assert_eq!(result, Dispatched::Line);
        assert_eq!(sink.bytes, b"ctrlc\n");
    }

    #[test]
    fn test_empty_input_writes_nothing() {
        let mut sink = RecordingSink::default();
        let result = InputDispatcher::default().dispatch("", &mut sink).unwrap();

        assert_eq!(result, Dispatched::Nothing);
        assert!(sink.bytes.is_empty());
        assert_eq!(sink.writes, 0);
    }

    #[test]
    fn test_whitespace_is_forwarded() {
        let mut sink = RecordingSink::default();
        InputDispatcher::default().dispatch("  ", &mut sink).unwrap();
        assert_eq!(sink.bytes, b"  \n");
    }

    #[test]
    fn test_custom_marker() {
        let dispatcher = InputDispatcher::new("^C");
        assert_eq!(dispatcher.classify("sleep 100 ^C"), Dispatched::Interrupt);
        assert_eq!(dispatcher.classify("CtrlC"), Dispatched::Line);
    }

    #[test]
    fn test_empty_marker_never_interrupts() {
        let dispatcher = InputDispatcher::new("");
        assert_eq!(dispatcher.classify("anything"), Dispatched::Line);
    }

    #[test]
    fn test_sink_error_propagates() {
        let mut sink = RecordingSink {
            exited: true,
            ..Default::default()
        };
        let err = InputDispatcher::default().dispatch("ls", &mut sink).unwrap_err();
        assert!(matches!(err, ProcessError::ProcessExited(_)));
    }
}
