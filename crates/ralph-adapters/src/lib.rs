//! # ralph-adapters
//!
//! Agent backend adapters for the Ralph loop runner.
//!
//! This crate provides implementations for the supported AI agent backends:
//! - Claude (stream-parsing: one CLI invocation per iteration, completion on exit)
//! - OpenCode (server-with-signal: `opencode serve` plus an idle signal file)
//!
//! Each adapter implements the common [`AgentBackend`] contract: spawn one
//! child process per iteration under a pseudo-terminal and report how the
//! iteration ended.
//!
//! ## Auto-Detection
//!
//! The `detect` module handles detecting which backends are installed and
//! building the failover order used by the loop runner.

mod backend;
mod claude;
mod detect;
mod opencode;
mod output;
mod pty;

pub use backend::{
    AdapterError, AdapterResult, AgentBackend, FailurePatterns, IterationEnd, IterationHandle,
    Outcome, SpawnConfig, COMPLETION_PROMISE,
};
pub use claude::ClaudeBackend;
pub use detect::{backend_by_name, detect_backends, is_backend_available, DEFAULT_PRIORITY};
pub use opencode::OpenCodeBackend;
pub use output::{strip_ansi, LineAssembler};
pub use pty::PtySession;
