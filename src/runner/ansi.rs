//! Terminal control-sequence stripping and overprint cooking.
//!
//! Raw PTY output is full of ANSI/VT100 escape sequences and carriage-return
//! or backspace overprints (progress bars, pager erasure). Cleaning happens in
//! two passes:
//!
//! 1. [`ControlSequenceFilter`]: a streaming byte-level state machine that
//!    drops CSI, OSC, DCS/PM/APC and single-byte escapes together with stray
//!    control bytes. It can be fed arbitrary chunks; a sequence split across
//!    chunks is still removed.
//! 2. [`cook`]: interprets the filtered text like a dumb terminal. Backspace
//!    deletes the previously emitted character and carriage return moves the
//!    cursor back to column 0 so following characters overwrite the line.
//!
//! [`clean`] runs both passes and is idempotent.

/// Escape (0x1B).
const ESC: u8 = 0x1B;
/// Bell (0x07), terminates OSC.
const BEL: u8 = 0x07;
/// Backspace (0x08), kept for cooking.
const BS: u8 = 0x08;
/// Delete (0x7F).
const DEL: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Normal,
    Esc,
    Csi,
    Osc,
    DcsLike,
}

/// Streaming ANSI/VT100 stripper.
///
/// Keeps `\n`, `\r`, `\t`, backspace, printable ASCII and every byte `>= 0x80`
/// so multi-byte UTF-8 text survives untouched.
#[derive(Debug, Clone)]
pub struct ControlSequenceFilter {
    state: FilterState,
    // Saw ESC inside an OSC/DCS string; a following `\` is the String Terminator.
    pending_st: bool,
}

impl Default for ControlSequenceFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSequenceFilter {
    pub fn new() -> Self {
        Self {
            state: FilterState::Normal,
            pending_st: false,
        }
    }

    /// Filter one chunk, appending kept bytes to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &b in input {
            if let Some(kept) = self.step(b) {
                out.push(kept);
            }
        }
    }

    /// Filter one chunk into a fresh buffer.
    pub fn filter(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        self.feed(input, &mut out);
        out
    }

    fn step(&mut self, b: u8) -> Option<u8> {
        match self.state {
            FilterState::Normal => {
                if b == ESC {
                    self.state = FilterState::Esc;
                    None
                } else if is_kept(b) {
                    Some(b)
                } else {
                    None
                }
            }
            FilterState::Esc => {
                self.state = match b {
                    b'[' => FilterState::Csi,
                    b']' => FilterState::Osc,
                    b'P' | b'^' | b'_' => FilterState::DcsLike,
                    // single-byte escape final
                    _ => FilterState::Normal,
                };
                self.pending_st = false;
                None
            }
            FilterState::Csi => {
                if (0x40..=0x7E).contains(&b) {
                    self.state = FilterState::Normal;
                }
                None
            }
            FilterState::Osc | FilterState::DcsLike => {
                if self.state == FilterState::Osc && b == BEL {
                    self.state = FilterState::Normal;
                    self.pending_st = false;
                } else if b == ESC {
                    self.pending_st = true;
                } else if self.pending_st {
                    self.pending_st = false;
                    if b == b'\\' {
                        self.state = FilterState::Normal;
                    }
                }
                None
            }
        }
    }
}

fn is_kept(b: u8) -> bool {
    matches!(b, b'\n' | b'\r' | b'\t' | BS) || ((0x20..0x80).contains(&b) && b != DEL) || b >= 0x80
}

/// Apply dumb-terminal semantics to filtered text.
///
/// Lines are built in a rolling buffer with a cursor: `\r` moves the cursor to
/// column 0, `\b` deletes the character before the cursor, `\n` flushes the
/// line. Any remaining partial line is flushed at the end.
pub fn cook(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut line: Vec<char> = Vec::new();
    let mut col = 0usize;

    for c in text.chars() {
        match c {
            '\n' => {
                out.extend(line.drain(..));
                out.push('\n');
                col = 0;
            }
            '\r' => col = 0,
            '\u{8}' => {
                if col > 0 {
                    col -= 1;
                    line.remove(col);
                }
            }
            _ => {
                if col < line.len() {
                    line[col] = c;
                } else {
                    line.push(c);
                }
                col += 1;
            }
        }
    }
    out.extend(line);
    out
}

/// Strip control sequences from a complete byte slice and cook the result.
pub fn clean_bytes(raw: &[u8]) -> String {
    let filtered = ControlSequenceFilter::new().filter(raw);
    cook(&String::from_utf8_lossy(&filtered))
}

/// Strip control sequences from text and cook the result.
///
/// `clean(&clean(x)) == clean(x)` for every input.
pub fn clean(raw: &str) -> String {
    clean_bytes(raw.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod filter {
        use super::*;

        fn strip(input: &[u8]) -> String {
            String::from_utf8(ControlSequenceFilter::new().filter(input)).unwrap()
        }

        #[test]
        fn test_csi_color_removed() {
            assert_eq!(strip(b"\x1b[1;32mgreen\x1b[0m"), "green");
        }

        #[test]
        fn test_dec_private_mode_removed() {
            assert_eq!(strip(b"\x1b[?25lhidden\x1b[?25h"), "hidden");
        }

        #[test]
        fn test_osc_terminated_by_bel() {
            assert_eq!(strip(b"\x1b]0;title\x07text"), "text");
        }

        #[test]
        fn test_osc_terminated_by_st() {
            assert_eq!(strip(b"\x1b]2;win title\x1b\\after"), "after");
        }

        #[test]
        fn test_osc_esc_not_followed_by_backslash_stays_in_string() {
            assert_eq!(strip(b"\x1b]0;a\x1bxb\x07done"), "done");
        }

        #[test]
        fn test_dcs_pm_apc_removed() {
            assert_eq!(strip(b"\x1bPq#0;1\x1b\\x"), "x");
            assert_eq!(strip(b"\x1b^private\x1b\\y"), "y");
            assert_eq!(strip(b"\x1b_app\x1b\\z"), "z");
        }

        #[test]
        fn test_dcs_ignores_bel() {
            assert_eq!(strip(b"\x1bPa\x07b\x1b\\c"), "c");
        }

        #[test]
        fn test_single_byte_escape_removed() {
            assert_eq!(strip(b"\x1bcreset\x1b7saved"), "resetsaved");
        }

        #[test]
        fn test_controls_dropped_but_whitespace_kept() {
            assert_eq!(strip(b"a\x00b\x07c\td\r\ne\x7f"), "abc\td\r\ne");
        }

        #[test]
        fn test_backspace_kept_for_cooking() {
            assert_eq!(strip(b"ab\x08c"), "ab\u{8}c");
        }

        #[test]
        fn test_utf8_preserved() {
            assert_eq!(strip("\x1b[31mгруппа ✓\x1b[0m".as_bytes()), "группа ✓");
        }

        #[test]
        fn test_sequence_split_across_chunks() {
            let mut filter = ControlSequenceFilter::new();
            let mut out = Vec::new();
            filter.feed(b"one\x1b[3", &mut out);
            filter.feed(b"1mtwo\x1b", &mut out);
            filter.feed(b"]0;t\x1b", &mut out);
            filter.feed(b"\\three", &mut out);
            assert_eq!(String::from_utf8(out).unwrap(), "onetwothree");
        }
    }

    mod cooking {
        use super::*;

        #[test]
        fn test_carriage_return_overwrites_from_column_zero() {
            assert_eq!(cook("PROG 10%\rPROG 100%\n"), "PROG 100%\n");
            assert_eq!(cook("abcdef\rXY\n"), "XYcdef\n");
        }

        #[test]
        fn test_crlf_keeps_line() {
            assert_eq!(cook("line one\r\nline two\r\n"), "line one\nline two\n");
        }

        #[test]
        fn test_backspace_deletes_previous() {
            assert_eq!(cook("Hello\u{8}!"), "Hell!");
            assert_eq!(cook("\u{8}\u{8}x"), "x");
        }

        #[test]
        fn test_pager_erasure() {
            let raw = format!(
                "row 1\n --More-- {}{}{}row 2\n",
                "\u{8}".repeat(10),
                " ".repeat(10),
                "\u{8}".repeat(10)
            );
            assert_eq!(cook(&raw), "row 1\nrow 2\n");
        }

        #[test]
        fn test_trailing_partial_line_flushed() {
            assert_eq!(cook("a\nrouter# "), "a\nrouter# ");
        }
    }

    mod clean {
        use super::*;

        #[test]
        fn test_reference_example() {
            let raw = "\x1b[32mOK\x1b[0m \rPROG 10%\rPROG 100%\nHello\x08!\n";
            assert_eq!(clean(raw), "PROG 100%\nHell!\n");
        }

        #[test]
        fn test_idempotent() {
            let samples = [
                "\x1b[32mOK\x1b[0m \rPROG 10%\rPROG 100%\nHello\x08!\n",
                "user@host:~$ ls\r\nfile\tother\r\nuser@host:~$ ",
                "\x1b]0;t\x07a\rb\x08\x08c\n\n\n",
                "plain text without controls",
                "",
                "\r\r\x08\x1b",
                "unicode ✓ \x1b[1mbold\x1b[0m\r\n",
            ];
            for sample in samples {
                let once = clean(sample);
                assert_eq!(clean(&once), once, "not idempotent for {:?}", sample);
            }
        }
    }
}
