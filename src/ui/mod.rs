//! User-facing side of the bridge.
//!
//! - **dispatcher**: Turns a line of user input into bytes for the emulator
//! - **console**: Terminal presenter used by the binary
//!
//! The session loop only talks to a [`Presenter`]; a web front end or a test
//! harness plugs in the same way the console does.

pub mod dispatcher;
pub mod console;

use std::io;

pub use dispatcher::{Dispatched, InputDispatcher};
pub use console::ConsolePresenter;

/// Presentation surface driven by the session loop
pub trait Presenter {
    /// Display accumulated output
    fn emit(&mut self, text: &str) -> io::Result<()>;

    /// Rendering hint after every flush and every forwarded input
    fn scroll_to_bottom(&mut self) -> io::Result<()>;

    /// Block for the next submitted line; `None` when input has ended
    fn read_next_input(&mut self) -> io::Result<Option<String>>;
}
