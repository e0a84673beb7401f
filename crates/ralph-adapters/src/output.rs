//! Output line assembly for raw PTY byte streams.
//!
//! Agent CLIs redraw spinners with carriage returns and paint everything in
//! ANSI color. For event delivery we keep each line's raw content (color
//! codes included) and use control characters only to decide where lines
//! end; for completion-marker and failure-pattern scanning we keep an
//! ANSI-stripped shadow transcript, bounded to a tail.

use std::collections::VecDeque;

/// Default bound on the stripped transcript kept for classification.
const DEFAULT_TRANSCRIPT_BYTES: usize = 256 * 1024;

/// Splits raw PTY bytes into lines and accumulates a stripped transcript.
///
/// Both `\n` and a bare `\r` (not part of `\r\n`) complete a line, so
/// progress redraws surface as discrete output events instead of one
/// ever-growing line.
pub struct LineAssembler {
    partial: Vec<u8>,
    last_was_cr: bool,
    transcript: VecDeque<u8>,
    transcript_cap: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::with_transcript_cap(DEFAULT_TRANSCRIPT_BYTES)
    }

    /// Bound the stripped transcript to `cap` bytes (oldest dropped).
    pub fn with_transcript_cap(cap: usize) -> Self {
        Self {
            partial: Vec::new(),
            last_was_cr: false,
            transcript: VecDeque::new(),
            transcript_cap: cap,
        }
    }

    /// Feed raw bytes and return newly completed raw lines.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();

        for &byte in data {
            match byte {
                b'\n' => {
                    // \r\n: the \r already flushed the line, swallow the \n.
                    if !std::mem::take(&mut self.last_was_cr) || !self.partial.is_empty() {
                        completed.push(self.take_line());
                    }
                    self.last_was_cr = false;
                }
                b'\r' => {
                    completed.push(self.take_line());
                    self.last_was_cr = true;
                }
                _ => {
                    self.last_was_cr = false;
                    self.partial.push(byte);
                }
            }
        }

        completed.retain(|l| !l.is_empty());
        completed
    }

    /// Flush the partial line, if any (child exited without a trailing newline).
    pub fn flush_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    /// The stripped transcript accumulated so far (bounded tail).
    pub fn transcript(&self) -> String {
        let bytes: Vec<u8> = self.transcript.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.partial);
        let stripped = strip_ansi(&raw);
        for b in stripped.as_bytes() {
            self.transcript.push_back(*b);
        }
        self.transcript.push_back(b'\n');
        while self.transcript.len() > self.transcript_cap {
            self.transcript.pop_front();
        }
        String::from_utf8_lossy(&raw).into_owned()
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip ANSI escape sequences from a byte slice, returning clean UTF-8 text.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... ST`), simple two-byte
/// escapes, and the bare 8-bit CSI. Non-UTF-8 bytes become the replacement
/// character.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            0x1B => {
                i += 1;
                if i >= input.len() {
                    break;
                }
                match input[i] {
                    b'[' => {
                        i += 1;
                        while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
                            i += 1;
                        }
                        if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
                            i += 1;
                        }
                    }
                    b']' => {
                        i += 1;
                        while i < input.len() {
                            if input[i] == 0x07 {
                                i += 1;
                                break;
                            }
                            if input[i] == 0x1B && i + 1 < input.len() && input[i + 1] == b'\\' {
                                i += 2;
                                break;
                            }
                            i += 1;
                        }
                    }
                    0x20..=0x7E => {
                        i += 1;
                    }
                    _ => {}
                }
            }
            // Bare CSI
            0x9B => {
                i += 1;
                while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
                    i += 1;
                }
                if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_newline() {
        let mut asm = LineAssembler::new();
        let lines = asm.feed(b"one\ntwo\nthr");
        assert_eq!(lines, vec!["one", "two"]);
        let lines = asm.feed(b"ee\n");
        assert_eq!(lines, vec!["three"]);
    }

    #[test]
    fn carriage_return_completes_a_line() {
        let mut asm = LineAssembler::new();
        let lines = asm.feed(b"spinner 1\rspinner 2\r\ndone\n");
        assert_eq!(lines, vec!["spinner 1", "spinner 2", "done"]);
    }

    #[test]
    fn raw_line_keeps_color_codes() {
        let mut asm = LineAssembler::new();
        let lines = asm.feed(b"\x1b[32mgreen\x1b[0m\n");
        assert_eq!(lines, vec!["\x1b[32mgreen\x1b[0m"]);
        // ...but the transcript is stripped.
        assert_eq!(asm.transcript(), "green\n");
    }

    #[test]
    fn flush_partial_returns_trailing_fragment() {
        let mut asm = LineAssembler::new();
        asm.feed(b"no newline here");
        assert_eq!(asm.flush_partial().as_deref(), Some("no newline here"));
        assert_eq!(asm.flush_partial(), None);
    }

    #[test]
    fn transcript_is_bounded() {
        let mut asm = LineAssembler::with_transcript_cap(16);
        asm.feed(b"aaaaaaaaaa\nbbbbbbbbbb\n");
        let transcript = asm.transcript();
        assert!(transcript.len() <= 16);
        assert!(transcript.contains("bbbb"));
    }

    #[test]
    fn strip_ansi_removes_csi_and_osc() {
        assert_eq!(strip_ansi(b"\x1b[1;31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi(b"\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi(b"plain"), "plain");
    }
}
