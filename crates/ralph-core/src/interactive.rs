//! InteractiveController: manual-drive gating.
//!
//! Completion detection is heuristic (agent exit or idle signal). When an
//! operator drives the agent from an attached terminal every human turn
//! looks like an iteration ending, so interactive mode both diverts
//! keystrokes into the PTY and suppresses completion detection until the
//! operator hands control back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ralph_adapters::PtySession;
use tracing::debug;

/// ASCII escape; asks the agent UI to return to its top-level prompt.
pub const ESCAPE_BYTE: u8 = 0x1b;

/// Result of a [`InteractiveController::forward_input`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResult {
    Forwarded,
    /// Soft refusal; carries the reason.
    Ignored(&'static str),
}

/// Guards `interactive_mode`; `completion_suppressed` is derived from it.
#[derive(Default)]
pub struct InteractiveController {
    interactive: AtomicBool,
    pty: Mutex<Option<Arc<PtySession>>>,
}

impl InteractiveController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the controller at the current iteration's PTY. Called by the
    /// loop runner on every spawn; cleared between iterations.
    pub fn attach_pty(&self, pty: Option<Arc<PtySession>>) {
        *self.pty.lock().expect("pty lock") = pty;
    }

    /// Transition the flag, returning the effective mode.
    ///
    /// On false->true the escape byte is sent first so the agent UI returns
    /// to its prompt before the operator starts typing.
    pub fn set_mode(&self, enabled: bool) -> bool {
        let was = self.interactive.swap(enabled, Ordering::SeqCst);
        if enabled && !was {
            if let Some(pty) = self.pty.lock().expect("pty lock").as_ref() {
                let _ = pty.write_all(&[ESCAPE_BYTE]);
            }
            debug!("interactive mode enabled");
        } else if !enabled && was {
            debug!("interactive mode disabled, completion detection resumed");
        }
        enabled
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::SeqCst)
    }

    /// Completion signals are ignored while the operator is driving.
    pub fn should_suppress_completion(&self) -> bool {
        self.is_interactive()
    }

    /// Write raw bytes into the agent PTY, only in interactive mode.
    pub fn forward_input(&self, bytes: &[u8]) -> ForwardResult {
        if !self.is_interactive() {
            return ForwardResult::Ignored("not in interactive mode");
        }
        let guard = self.pty.lock().expect("pty lock");
        match guard.as_ref() {
            Some(pty) => match pty.write_all(bytes) {
                Ok(()) => ForwardResult::Forwarded,
                Err(_) => ForwardResult::Ignored("pty write failed"),
            },
            None => ForwardResult::Ignored("no agent running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_mode_is_autonomous() {
        let ctl = InteractiveController::new();
        assert!(!ctl.is_interactive());
        assert!(!ctl.should_suppress_completion());
    }

    #[test]
    fn forward_refused_outside_interactive_mode() {
        let ctl = InteractiveController::new();
        assert_eq!(
            ctl.forward_input(b"ls\n"),
            ForwardResult::Ignored("not in interactive mode")
        );
    }

    #[test]
    fn set_mode_latches_and_suppresses() {
        let ctl = InteractiveController::new();
        assert!(ctl.set_mode(true));
        assert!(ctl.should_suppress_completion());
        assert!(!ctl.set_mode(false));
        assert!(!ctl.should_suppress_completion());
    }

    #[test]
    fn enable_sends_escape_byte_and_forwards_keys() {
        // cat echoes back whatever arrives on its PTY.
        let pty = Arc::new(
            PtySession::spawn("/bin/cat", &[], &PathBuf::from("/tmp"), &[]).unwrap(),
        );
        let ctl = InteractiveController::new();
        ctl.attach_pty(Some(Arc::clone(&pty)));

        ctl.set_mode(true);
        assert_eq!(ctl.forward_input(b"hi\n"), ForwardResult::Forwarded);

        std::thread::sleep(std::time::Duration::from_millis(150));
        let mut buf = [0u8; 256];
        let mut seen = Vec::new();
        while let Ok(n) = pty.read(&mut buf) {
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        // The escape byte precedes the forwarded keystrokes.
        let pos_esc = seen.iter().position(|b| *b == ESCAPE_BYTE);
        let text = String::from_utf8_lossy(&seen);
        assert!(pos_esc.is_some(), "escape byte reached the pty: {seen:?}");
        assert!(text.contains("hi"));

        pty.write_all(&[0x04]).ok();
        pty.wait().ok();
    }

    #[test]
    fn forward_without_pty_is_soft_refusal() {
        let ctl = InteractiveController::new();
        ctl.set_mode(true);
        assert_eq!(
            ctl.forward_input(b"x"),
            ForwardResult::Ignored("no agent running")
        );
    }
}
