//! Claude backend: one CLI invocation per iteration.
//!
//! A stream-parsing backend. The `claude` CLI is spawned under a PTY with the
//! iteration prompt as its positional argument; completion is the child's
//! exit. The final payload (the transcript tail) is what the loop runner
//! scans for the completion promise.

use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use which::which;

use crate::backend::{
    AdapterResult, AgentBackend, IterationEnd, IterationHandle, SpawnConfig,
};
use crate::output::LineAssembler;
use crate::pty::PtySession;

pub struct ClaudeBackend;

impl ClaudeBackend {
    pub fn new() -> Self {
        Self
    }

    fn build_args(config: &SpawnConfig) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if config.yolo {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        // Prompt goes last as a positional argument.
        args.push(config.prompt.clone());
        args
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn is_available(&self) -> bool {
        which("claude").is_ok()
    }

    async fn spawn_iteration(&self, config: SpawnConfig) -> AdapterResult<IterationHandle> {
        let args = Self::build_args(&config);

        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("FORCE_COLOR".to_string(), "1".to_string()),
        ];
        env.extend(config.env.clone());

        let pty = Arc::new(PtySession::spawn(
            "claude",
            &args,
            &config.working_dir,
            &env,
        )?);
        let pid = pty.pid();
        debug!(pid, "claude iteration spawned");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        // The PTY master is a blocking fd; a dedicated reader thread streams
        // lines out and resolves completion when the child exits.
        let reader_pty = Arc::clone(&pty);
        thread::spawn(move || {
            let end = read_until_exit(&reader_pty, &line_tx);
            let _ = done_tx.send(end);
        });

        Ok(IterationHandle {
            pty,
            pid,
            lines: line_rx,
            done: done_rx,
            server_port: None,
            session_id: None,
        })
    }
}

/// Pump the PTY until the child exits; returns the iteration end.
///
/// Shared with the opencode backend's reader (which ignores the returned
/// exit for its own completion logic).
pub(crate) fn read_until_exit(
    pty: &PtySession,
    line_tx: &mpsc::UnboundedSender<String>,
) -> IterationEnd {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 8192];

    loop {
        let readable = pty.poll_readable(100).unwrap_or(false);
        if readable {
            match pty.read(&mut buf) {
                Ok(0) => {
                    if !pty.is_alive() {
                        break;
                    }
                }
                Ok(n) => {
                    for line in assembler.feed(&buf[..n]) {
                        let _ = line_tx.send(line);
                    }
                }
                Err(_) => break,
            }
        } else if !pty.is_alive() {
            // One more read pass to drain anything buffered after exit.
            while let Ok(n) = pty.read(&mut buf) {
                if n == 0 {
                    break;
                }
                for line in assembler.feed(&buf[..n]) {
                    let _ = line_tx.send(line);
                }
            }
            break;
        }
    }

    if let Some(rest) = assembler.flush_partial() {
        let _ = line_tx.send(rest);
    }

    let exit_code = pty.wait().unwrap_or(-1);
    IterationEnd {
        exit_code,
        transcript: assembler.transcript(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_include_yolo_and_model() {
        let mut config = SpawnConfig::new("do the thing", "/tmp");
        config.yolo = true;
        config.model = Some("opus".to_string());
        let args = ClaudeBackend::build_args(&config);
        assert_eq!(args[0], "--dangerously-skip-permissions");
        assert_eq!(args[1], "--model");
        assert_eq!(args[2], "opus");
        assert_eq!(args.last().map(String::as_str), Some("do the thing"));
    }

    #[test]
    fn prompt_is_sole_arg_by_default() {
        let config = SpawnConfig::new("just a prompt", "/tmp");
        let args = ClaudeBackend::build_args(&config);
        assert_eq!(args, vec!["just a prompt".to_string()]);
    }

    #[tokio::test]
    async fn stub_iteration_completes_on_exit() {
        // Drive the reader loop with /bin/echo standing in for the agent CLI:
        // same PTY path, same completion-on-exit strategy.
        let pty = Arc::new(
            PtySession::spawn(
                "/bin/echo",
                &["Typecheck passes".to_string()],
                &std::path::PathBuf::from("/tmp"),
                &[],
            )
            .unwrap(),
        );
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let reader_pty = Arc::clone(&pty);
        let end =
            tokio::task::spawn_blocking(move || read_until_exit(&reader_pty, &line_tx))
                .await
                .unwrap();

        assert_eq!(end.exit_code, 0);
        assert!(end.transcript.contains("Typecheck passes"));
        let line = line_rx.recv().await.expect("one output line");
        assert!(line.contains("Typecheck passes"));
    }
}
