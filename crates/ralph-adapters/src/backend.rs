//! The agent backend contract.
//!
//! A backend knows how to run one iteration of an external coding agent as a
//! child process under a PTY, how to tell when that iteration has finished
//! (process exit for stream backends, idle signal file for server backends),
//! and how to classify a failed iteration for failover.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::pty::PtySession;

/// Literal the agent emits in its final payload to declare the whole PRD
/// finished. Tunable through [`SpawnConfig::completion_promise`].
pub const COMPLETION_PROMISE: &str = "<promise>COMPLETE</promise>";

/// Errors from backend operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("pty error: {0}")]
    Pty(String),
    #[error("backend '{0}' is not installed")]
    NotInstalled(String),
    #[error("agent server error: {0}")]
    Server(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Per-iteration spawn configuration handed to a backend.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// The fully assembled prompt text for this iteration.
    pub prompt: String,
    /// Working directory for the agent (the repository root).
    pub working_dir: PathBuf,
    /// Extra environment for the child, on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Whether an operator may take manual control of the terminal.
    pub interactive: bool,
    /// Model override passed through to the agent CLI.
    pub model: Option<String>,
    /// Skip the agent's own permission prompts.
    pub yolo: bool,
    /// Signal file path for server-with-signal backends; exported to the
    /// child as `RALPH_SIGNAL_FILE`.
    pub signal_file: Option<PathBuf>,
    /// Completion promise literal scanned for in the final payload.
    pub completion_promise: String,
}

impl SpawnConfig {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            interactive: false,
            model: None,
            yolo: false,
            signal_file: None,
            completion_promise: COMPLETION_PROMISE.to_string(),
        }
    }
}

/// How a finished iteration ended, before outcome classification.
#[derive(Debug, Clone)]
pub struct IterationEnd {
    /// Child exit code; 0 for server backends that went idle while the
    /// server keeps running. Negative values are `-signum`.
    pub exit_code: i32,
    /// ANSI-stripped transcript tail, used for classification and
    /// completion-promise inspection.
    pub transcript: String,
}

/// A live iteration: the PTY, the output line stream, and the completion
/// future.
pub struct IterationHandle {
    /// The PTY master, shared with the interactive controller for keystroke
    /// forwarding.
    pub pty: Arc<PtySession>,
    /// Child PID of the agent process (or its server).
    pub pid: u32,
    /// Raw output lines as they complete. Closed when the reader drains.
    pub lines: mpsc::UnboundedReceiver<String>,
    /// Resolves exactly once, when the backend's completion strategy fires.
    pub done: oneshot::Receiver<IterationEnd>,
    /// Listening port, for backends that run a network server.
    pub server_port: Option<u16>,
    /// Server-side session id, for backends that create one.
    pub session_id: Option<String>,
}

/// Classified result of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AuthError,
    RateLimit,
    ContextLimit,
    UnknownError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthError => "auth_error",
            Outcome::RateLimit => "rate_limit",
            Outcome::ContextLimit => "context_limit",
            Outcome::UnknownError => "unknown_error",
        }
    }
}

/// Curated, per-backend pattern sets for classifying agent failures and for
/// vetoing the completion promise in an error payload.
///
/// Patterns are matched case-insensitively against the stripped transcript.
/// Entries are plain substrings unless prefixed with `re:`, in which case the
/// remainder is compiled as a regex.
#[derive(Debug, Clone)]
pub struct FailurePatterns {
    pub auth: Vec<String>,
    pub rate_limit: Vec<String>,
    pub context_limit: Vec<String>,
    /// Markers that make a completion promise untrustworthy.
    pub error_markers: Vec<String>,
}

impl Default for FailurePatterns {
    fn default() -> Self {
        Self {
            auth: vec![
                "invalid api key".into(),
                "unauthorized".into(),
                "auth failed".into(),
                "authentication_error".into(),
                "401".into(),
            ],
            rate_limit: vec![
                "rate limit".into(),
                "rate_limit".into(),
                "quota exceeded".into(),
                "429".into(),
            ],
            context_limit: vec![
                "context window".into(),
                "context length".into(),
                "token limit".into(),
                "prompt too long".into(),
                "prompt is too long".into(),
            ],
            error_markers: vec![
                r#"re:"is_error"\s*:\s*true"#.into(),
                "error_during_execution".into(),
                r#"re:"subtype"\s*:\s*"error""#.into(),
            ],
        }
    }
}

impl FailurePatterns {
    /// Classify an iteration end into an [`Outcome`].
    ///
    /// A clean exit is `Success`; a failed exit is matched against the auth,
    /// rate-limit, and context-limit sets in that order, falling back to
    /// `UnknownError`.
    pub fn classify(&self, end: &IterationEnd) -> Outcome {
        if end.exit_code == 0 {
            return Outcome::Success;
        }
        if matches_any(&self.auth, &end.transcript) {
            Outcome::AuthError
        } else if matches_any(&self.rate_limit, &end.transcript) {
            Outcome::RateLimit
        } else if matches_any(&self.context_limit, &end.transcript) {
            Outcome::ContextLimit
        } else {
            Outcome::UnknownError
        }
    }

    /// Whether the final payload carries an error marker that should veto a
    /// completion promise.
    pub fn has_error_markers(&self, payload: &str) -> bool {
        matches_any(&self.error_markers, payload)
    }
}

fn matches_any(patterns: &[String], text: &str) -> bool {
    let lowered = text.to_lowercase();
    patterns.iter().any(|p| {
        if let Some(expr) = p.strip_prefix("re:") {
            RegexBuilder::new(expr)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        } else {
            lowered.contains(&p.to_lowercase())
        }
    })
}

/// Uniform contract over concrete coding-agent CLIs.
///
/// One child process is spawned per iteration, attached to a PTY. Raw bytes
/// sent into the PTY (keystroke forwarding) are passed through uninterpreted;
/// a single `\x1b` is reserved to ask the agent UI to return to its top level
/// and must be tolerated.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Short machine name, e.g. `"claude"`.
    fn name(&self) -> &'static str;

    /// Human-facing name, e.g. `"Claude Code"`.
    fn display_name(&self) -> &'static str;

    /// Cheap availability check: executable on PATH, prerequisites met.
    fn is_available(&self) -> bool;

    /// The failure pattern set used to classify this backend's output.
    fn failure_patterns(&self) -> FailurePatterns {
        FailurePatterns::default()
    }

    /// Launch one iteration. Returns a handle carrying the PTY, the output
    /// line stream, and the completion future.
    async fn spawn_iteration(&self, config: SpawnConfig) -> AdapterResult<IterationHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end(exit_code: i32, transcript: &str) -> IterationEnd {
        IterationEnd {
            exit_code,
            transcript: transcript.to_string(),
        }
    }

    #[test]
    fn clean_exit_is_success() {
        let patterns = FailurePatterns::default();
        assert_eq!(patterns.classify(&end(0, "whatever")), Outcome::Success);
    }

    #[test]
    fn auth_errors_match_case_insensitively() {
        let patterns = FailurePatterns::default();
        assert_eq!(
            patterns.classify(&end(1, "Error: Invalid API Key provided")),
            Outcome::AuthError
        );
        assert_eq!(
            patterns.classify(&end(1, "request failed: 401 Unauthorized")),
            Outcome::AuthError
        );
    }

    #[test]
    fn rate_and_context_limits_classify() {
        let patterns = FailurePatterns::default();
        assert_eq!(
            patterns.classify(&end(1, "HTTP 429: Rate limit exceeded")),
            Outcome::RateLimit
        );
        assert_eq!(
            patterns.classify(&end(1, "your prompt is too long for the context window")),
            Outcome::ContextLimit
        );
    }

    #[test]
    fn unknown_failure_falls_through() {
        let patterns = FailurePatterns::default();
        assert_eq!(
            patterns.classify(&end(1, "segmentation fault")),
            Outcome::UnknownError
        );
    }

    #[test]
    fn error_markers_veto_completion() {
        let patterns = FailurePatterns::default();
        assert!(patterns.has_error_markers(r#"{"is_error": true, "result": "..."}"#));
        assert!(patterns.has_error_markers("error_during_execution"));
        assert!(patterns.has_error_markers(r#"{"subtype": "error"}"#));
        assert!(!patterns.has_error_markers("all good <promise>COMPLETE</promise>"));
    }
}
