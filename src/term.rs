/// Defines ANSI escape codes for convenience.
// See also
// https://en.wikipedia.org/wiki/ANSI_escape_code#Escape_sequences
// Just need to use `\u{1b}` rather than `\033` for the ESC

/// Cease all formatting
pub const END: &str = "\u{1b}[0m";

/// Bold text
pub const BOLD: &str = "\u{1b}[1m";

/// Non-standard: a CPL followed by EIL.
/// Preface println with this to simply overwrite the previous line
pub const TTYJUMP: &str = "\u{1b}[F\u{1b}[2K";
