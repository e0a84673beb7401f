//! In-memory session state, shared between the loop runner and the RPC
//! server.
//!
//! The runner is the single mutator; RPC handlers read snapshots. Every
//! mutation is announced to subscribers as a `state_change` event carrying
//! only the changed fields, and every agent output line as an `output`
//! event. `recent_output` is a bounded FIFO and is never persisted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Bound on the recent-output tail. Oldest lines are dropped first.
pub const MAX_OUTPUT_BUFFER: usize = 200;

/// Snapshot of a loop's live state, as returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub task_name: String,
    pub task_dir: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_story: String,
    pub agent: String,
    pub status: String,
    pub interactive_mode: bool,
    pub started_at: String,
    pub updated_at: String,
    pub recent_output: Vec<String>,
}

/// Partial update; only set fields are applied and announced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_story: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive_mode: Option<bool>,
}

impl StatePatch {
    pub fn status(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Default::default()
        }
    }
}

/// An event published to RPC subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    /// `"output"` or `"state_change"`.
    pub event_type: &'static str,
    pub timestamp: String,
    pub data: Value,
}

impl Event {
    fn now(event_type: &'static str, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Local::now().to_rfc3339(),
            data,
        }
    }
}

struct StateInner {
    task_name: String,
    task_dir: String,
    iteration: u32,
    max_iterations: u32,
    current_story: String,
    agent: String,
    status: String,
    interactive_mode: bool,
    started_at: String,
    updated_at: String,
    recent_output: VecDeque<String>,
    output_cap: usize,
}

/// Shared handle: single-mutator state plus the event fan-out channel.
pub struct SharedState {
    inner: Mutex<StateInner>,
    events: broadcast::Sender<Event>,
}

impl SharedState {
    pub fn new(task_name: &str, task_dir: &str, agent: &str, max_iterations: u32) -> Self {
        Self::with_output_cap(task_name, task_dir, agent, max_iterations, MAX_OUTPUT_BUFFER)
    }

    pub fn with_output_cap(
        task_name: &str,
        task_dir: &str,
        agent: &str,
        max_iterations: u32,
        output_cap: usize,
    ) -> Self {
        let now = Local::now().to_rfc3339();
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(StateInner {
                task_name: task_name.to_string(),
                task_dir: task_dir.to_string(),
                iteration: 0,
                max_iterations,
                current_story: String::new(),
                agent: agent.to_string(),
                status: "running".to_string(),
                interactive_mode: false,
                started_at: now.clone(),
                updated_at: now,
                recent_output: VecDeque::with_capacity(output_cap),
                output_cap,
            }),
            events,
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Full snapshot, including the recent-output tail.
    pub fn snapshot(&self) -> SessionState {
        let inner = self.inner.lock().expect("state lock");
        SessionState {
            task_name: inner.task_name.clone(),
            task_dir: inner.task_dir.clone(),
            iteration: inner.iteration,
            max_iterations: inner.max_iterations,
            current_story: inner.current_story.clone(),
            agent: inner.agent.clone(),
            status: inner.status.clone(),
            interactive_mode: inner.interactive_mode,
            started_at: inner.started_at.clone(),
            updated_at: inner.updated_at.clone(),
            recent_output: inner.recent_output.iter().cloned().collect(),
        }
    }

    /// Apply a patch; fields that actually changed are announced as one
    /// `state_change` event.
    pub fn update(&self, patch: StatePatch) {
        let mut changed = serde_json::Map::new();
        {
            let mut inner = self.inner.lock().expect("state lock");
            if let Some(v) = patch.iteration
                && inner.iteration != v
            {
                inner.iteration = v;
                changed.insert("iteration".into(), json!(v));
            }
            if let Some(v) = patch.current_story
                && inner.current_story != v
            {
                changed.insert("current_story".into(), json!(v));
                inner.current_story = v;
            }
            if let Some(v) = patch.agent
                && inner.agent != v
            {
                changed.insert("agent".into(), json!(v));
                inner.agent = v;
            }
            if let Some(v) = patch.status
                && inner.status != v
            {
                changed.insert("status".into(), json!(v));
                inner.status = v;
            }
            if let Some(v) = patch.interactive_mode
                && inner.interactive_mode != v
            {
                inner.interactive_mode = v;
                changed.insert("interactive_mode".into(), json!(v));
            }
            if !changed.is_empty() {
                inner.updated_at = Local::now().to_rfc3339();
            }
        }
        if !changed.is_empty() {
            let _ = self
                .events
                .send(Event::now("state_change", Value::Object(changed)));
        }
    }

    /// Append an output line to the bounded tail and announce it.
    pub fn push_output(&self, line: String) {
        {
            let mut inner = self.inner.lock().expect("state lock");
            if inner.recent_output.len() >= inner.output_cap {
                inner.recent_output.pop_front();
            }
            inner.recent_output.push_back(line.clone());
        }
        let _ = self
            .events
            .send(Event::now("output", json!({ "line": line })));
    }

    pub fn status(&self) -> String {
        self.inner.lock().expect("state lock").status.clone()
    }

    pub fn interactive_mode(&self) -> bool {
        self.inner.lock().expect("state lock").interactive_mode
    }
}

/// Control flags set by RPC commands (and by signal handlers), read by the
/// loop runner at its safe boundaries.
#[derive(Default)]
pub struct Controls {
    stop: AtomicBool,
    checkpoint: AtomicBool,
    injected_prompt: Mutex<Option<String>>,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_checkpoint(&self) {
        self.checkpoint.store(true, Ordering::SeqCst);
    }

    pub fn checkpoint_requested(&self) -> bool {
        self.checkpoint.load(Ordering::SeqCst)
    }

    /// Queue a prompt to prepend to the next iteration.
    pub fn inject_prompt(&self, prompt: &str) {
        let mut slot = self.injected_prompt.lock().expect("inject lock");
        *slot = Some(prompt.trim().to_string());
    }

    /// Consume the pending injected prompt, if any.
    pub fn take_injected(&self) -> Option<String> {
        self.injected_prompt.lock().expect("inject lock").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SharedState {
        SharedState::new("demo", "tasks/demo", "claude", 10)
    }

    #[test]
    fn update_emits_only_changed_fields() {
        let s = state();
        let mut rx = s.subscribe();

        s.update(StatePatch {
            iteration: Some(1),
            status: Some("running".into()), // unchanged
            ..Default::default()
        });

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.event_type, "state_change");
        let obj = ev.data.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["iteration"], json!(1));
    }

    #[test]
    fn noop_update_emits_nothing() {
        let s = state();
        let mut rx = s.subscribe();
        s.update(StatePatch::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn output_ring_evicts_oldest_at_capacity() {
        let s = SharedState::with_output_cap("t", "d", "claude", 10, 200);
        for i in 0..200 {
            s.push_output(format!("line {i}"));
        }
        assert_eq!(s.snapshot().recent_output.len(), 200);

        s.push_output("one more".into());
        let snap = s.snapshot();
        assert_eq!(snap.recent_output.len(), 200);
        assert_eq!(snap.recent_output.first().unwrap(), "line 1");
        assert_eq!(snap.recent_output.last().unwrap(), "one more");
    }

    #[test]
    fn output_event_carries_the_line() {
        let s = state();
        let mut rx = s.subscribe();
        s.push_output("\x1b[32mok\x1b[0m".into());
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.event_type, "output");
        // Raw line, color codes included.
        assert_eq!(ev.data["line"], json!("\x1b[32mok\x1b[0m"));
    }

    #[test]
    fn controls_round_trip() {
        let c = Controls::new();
        assert!(!c.stop_requested());
        c.request_stop();
        assert!(c.stop_requested());

        c.inject_prompt("  focus on tests  ");
        assert_eq!(c.take_injected().as_deref(), Some("focus on tests"));
        assert!(c.take_injected().is_none());
    }

    #[test]
    fn snapshot_reflects_update_ordering() {
        // state_change for a mutation happens-before any snapshot that
        // reflects it: update() publishes after releasing the lock, so a
        // snapshot taken after recv sees the new value.
        let s = state();
        let mut rx = s.subscribe();
        s.update(StatePatch::status("completed"));
        let _ = rx.try_recv().unwrap();
        assert_eq!(s.snapshot().status, "completed");
    }
}
