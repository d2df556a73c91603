//! Escape sequence filter
//!
//! Strips a fixed set of ANSI sequences from subprocess output. This is an
//! allow-list, not a parser: anything not listed in [`STRIPPED_SEQUENCES`]
//! passes through untouched.

/// Sequences removed from every output line, applied in this order.
pub const STRIPPED_SEQUENCES: [&str; 12] = [
    "\x1b[32m",   // green
    "\x1b[0m",    // reset
    "\x1b[31m",   // red
    "\x1b[34m",   // blue
    "\x1b[36m",   // cyan
    "\x1b[33m",   // yellow
    "\x1b[35m",   // magenta
    "\x1b[37m",   // white
    "\x1b[2J",    // clear screen
    "\x1b[1;1H",  // cursor home
    "\x1b[1;34m", // bold blue
    "\x1b[1;32m", // bold green
];

/// Remove every listed escape sequence from `chunk`.
///
/// Passes repeat until nothing changes, so a sequence that only forms after
/// an inner one is removed (`"\x1b[3\x1b[0m2m"`) is stripped as well.
pub fn strip_escapes(chunk: &str) -> String {
    let mut out = chunk.to_string();
    while out.contains('\x1b') {
        let before = out.len();
        for seq in STRIPPED_SEQUENCES {
            if out.contains(seq) {
                out = out.replace(seq, "");
            }
        }
        if out.len() == before {
            break;
        }
    }
    out
}
