//! Core bridge components.
//!
//! - **process**: Emulator launch, liveness and the input stream
//! - **reader**: Background threads draining the output streams
//! - **filter**: Escape sequence stripping
//! - **buffer**: Shared output queue between reader and session loop
//! - **session**: High-level session combining all of the above
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── Supervisor (child process + stdin)
//! │   ├── stdout reader ──► filter ──► OutputBuffer
//! │   └── stderr drain (log / merge / discard)
//! ├── OutputBuffer ──► Presenter::emit
//! └── InputDispatcher ◄── Presenter::read_next_input
//! ```

pub mod buffer;
pub mod filter;
pub mod process;
pub mod reader;
pub mod session;
