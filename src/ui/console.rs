//! Terminal console presenter
//!
//! Prints drained emulator output to stdout and reads input lines from
//! stdin, with a colored prompt drawn via crossterm.

use std::io::{self, BufRead, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};

use super::Presenter;

/// Presenter bound to the process's own terminal
pub struct ConsolePresenter<R: BufRead, W: Write> {
    input: R,
    output: W,
    prompt: String,
    /// Last emitted text ended mid-line
    mid_line: bool,
}

impl ConsolePresenter<io::StdinLock<'static>, io::Stdout> {
    /// Console on the real stdin/stdout
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsolePresenter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            prompt: "> ".to_string(),
            mid_line: false,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    fn draw_prompt(&mut self) -> io::Result<()> {
        queue!(
            self.output,
            SetForegroundColor(Color::Cyan),
            SetAttribute(Attribute::Bold),
            Print(&self.prompt),
            SetAttribute(Attribute::Reset),
            ResetColor
        )?;
        self.output.flush()
    }
}

impl<R: BufRead, W: Write> Presenter for ConsolePresenter<R, W> {
    fn emit(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        queue!(self.output, Print(text))?;
        self.mid_line = !text.ends_with('\n');
        Ok(())
    }

    fn scroll_to_bottom(&mut self) -> io::Result<()> {
        // A line-mode console is always at the bottom; just start clean
        if self.mid_line {
            queue!(self.output, Print("\r\n"))?;
            self.mid_line = false;
        }
        queue!(self.output, MoveToColumn(0))?;
        self.output.flush()
    }

    fn read_next_input(&mut self) -> io::Result<Option<String>> {
        self.draw_prompt()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}
