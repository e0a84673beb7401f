//! # ralph-core
//!
//! Core orchestration for the Ralph loop runner.
//!
//! This crate provides:
//! - The iteration state machine that drives a PRD to completion
//! - The PRD document model and progress-log maintenance
//! - The durable session registry
//! - The per-loop JSON-RPC control/observation server
//! - Interactive-mode gating for manual terminal takeover

mod error;
mod git;
mod interactive;
mod paths;
mod prd;
mod progress;
mod prompt;
mod registry;
mod rpc;
mod runner;
mod state;

pub use error::{RalphError, RalphResult};
pub use git::Git;
pub use interactive::{ForwardResult, InteractiveController, ESCAPE_BYTE};
pub use paths::RalphPaths;
pub use prd::{AcceptanceCriterion, DecisionConfig, Phase, Prd, PrdDoc, SpawnRules, UserStory};
pub use progress::{ProgressLog, DEFAULT_ROTATION_THRESHOLD};
pub use prompt::{build_iteration_prompt, resolve_template, BUILTIN_TEMPLATE};
pub use registry::{
    pid_alive, SessionFilter, SessionRecord, SessionRegistry, SessionStatus,
};
pub use rpc::{
    RpcServer, AGENT_ERROR, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
pub use runner::{
    task_name_from_dir, LoopConfig, LoopRunner, TerminationReason, DEFAULT_ITERATIONS,
};
pub use state::{Controls, Event, SessionState, SharedState, StatePatch, MAX_OUTPUT_BUFFER};
