//! OpenCode backend: `opencode serve` plus an idle signal file.
//!
//! A server-with-signal backend. Each iteration spawns a long-running
//! `opencode serve` under the PTY, waits for its health endpoint, creates a
//! session, and dispatches the prompt to it. Completion fires when either
//! the agent runtime writes `{event: "idle", ...}` to the signal file
//! (communicated via `RALPH_SIGNAL_FILE`) or the server process exits --
//! whichever arrives first.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use which::which;

use crate::backend::{
    AdapterError, AdapterResult, AgentBackend, IterationEnd, IterationHandle, SpawnConfig,
};
use crate::claude::read_until_exit;
use crate::pty::PtySession;

/// Port range probed for `opencode serve`.
const PORT_START: u16 = 4096;
const PORT_END: u16 = 5096;

/// Seconds to wait for the server to become healthy.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_millis(500);

/// Signal-file poll cadence.
const SIGNAL_POLL: Duration = Duration::from_millis(500);

pub struct OpenCodeBackend;

impl OpenCodeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpenCodeBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// The idle notification the agent runtime writes atomically
/// (write-to-temp-then-rename) to the signal file.
#[derive(Debug, Deserialize)]
struct IdleSignal {
    event: String,
    #[serde(default, rename = "timestamp")]
    _timestamp: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[async_trait]
impl AgentBackend for OpenCodeBackend {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn display_name(&self) -> &'static str {
        "OpenCode"
    }

    fn is_available(&self) -> bool {
        which("opencode").is_ok()
    }

    async fn spawn_iteration(&self, config: SpawnConfig) -> AdapterResult<IterationHandle> {
        let signal_file = config.signal_file.clone().ok_or_else(|| {
            AdapterError::Server("opencode backend requires a signal file path".into())
        })?;
        // A leftover signal from a previous iteration must not satisfy this one.
        let _ = std::fs::remove_file(&signal_file);

        let port = allocate_port()
            .ok_or_else(|| AdapterError::Server("no free port in 4096-5096".into()))?;

        let mut args = vec![
            "serve".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--hostname".to_string(),
            "127.0.0.1".to_string(),
        ];
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            (
                "RALPH_SIGNAL_FILE".to_string(),
                signal_file.display().to_string(),
            ),
        ];
        if config.yolo {
            env.push(("OPENCODE_PERMISSION".to_string(), "allow".to_string()));
        }
        env.extend(config.env.clone());

        let pty = Arc::new(PtySession::spawn(
            "opencode",
            &args,
            &config.working_dir,
            &env,
        )?);
        let pid = pty.pid();
        let spawned_at = SystemTime::now();
        debug!(pid, port, "opencode serve spawned");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel::<IterationEnd>();

        // Stream server output while it lives; the exit channel doubles as
        // the "child died" completion arm.
        let reader_pty = Arc::clone(&pty);
        thread::spawn(move || {
            let end = read_until_exit(&reader_pty, &line_tx);
            let _ = exit_tx.send(end);
        });

        let base_url = format!("http://127.0.0.1:{port}");
        let client = reqwest::Client::new();

        if let Err(e) = wait_for_health(&client, &base_url, &pty).await {
            let _ = pty.terminate();
            return Err(e);
        }

        let session_id = create_session(&client, &base_url, &config.working_dir).await?;
        debug!(%session_id, "opencode session created");

        // Fire the prompt at the session. The message endpoint blocks until
        // the turn finishes; completion detection runs on the signal file, so
        // the dispatch result only matters for logging.
        {
            let client = client.clone();
            let url = format!(
                "{base_url}/session/{session_id}/message?directory={}",
                config.working_dir.display()
            );
            let mut body = json!({
                "parts": [{"type": "text", "text": config.prompt}],
            });
            if let Some(model) = &config.model {
                body["model"] = json!(model);
            }
            tokio::spawn(async move {
                match client
                    .post(&url)
                    .json(&body)
                    .timeout(Duration::from_secs(24 * 60 * 60))
                    .send()
                    .await
                {
                    Ok(resp) if !resp.status().is_success() => {
                        warn!(status = %resp.status(), "opencode message dispatch failed");
                    }
                    Err(e) => warn!("opencode message dispatch error: {e}"),
                    _ => {}
                }
            });
        }

        // Race the idle signal against server exit; first one wins.
        let (done_tx, done_rx) = oneshot::channel();
        let watch_session = session_id.clone();
        tokio::spawn(watch_completion(
            signal_file,
            watch_session,
            spawned_at,
            exit_rx,
            done_tx,
        ));

        Ok(IterationHandle {
            pty,
            pid,
            lines: line_rx,
            done: done_rx,
            server_port: Some(port),
            session_id: Some(session_id),
        })
    }
}

/// Find a bindable localhost port in the probe range.
fn allocate_port() -> Option<u16> {
    (PORT_START..PORT_END).find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
}

async fn wait_for_health(
    client: &reqwest::Client,
    base_url: &str,
    pty: &PtySession,
) -> AdapterResult<()> {
    let url = format!("{base_url}/global/health");
    let deadline = tokio::time::Instant::now() + HEALTH_TIMEOUT;

    loop {
        if !pty.is_alive() {
            return Err(AdapterError::Server(
                "opencode serve died during startup".into(),
            ));
        }
        let healthy = matches!(
            client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await,
            Ok(resp) if resp.status().is_success()
        );
        if healthy {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AdapterError::Server(format!(
                "health check timeout: {base_url} not responding"
            )));
        }
        tokio::time::sleep(HEALTH_INTERVAL).await;
    }
}

async fn create_session(
    client: &reqwest::Client,
    base_url: &str,
    working_dir: &Path,
) -> AdapterResult<String> {
    #[derive(Deserialize)]
    struct SessionResponse {
        id: String,
    }

    let url = format!("{base_url}/session?directory={}", working_dir.display());
    let resp = client
        .post(&url)
        .json(&json!({}))
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| AdapterError::Server(format!("create session: {e}")))?;

    if !resp.status().is_success() {
        return Err(AdapterError::Server(format!(
            "create session failed: HTTP {}",
            resp.status()
        )));
    }

    let session: SessionResponse = resp
        .json()
        .await
        .map_err(|e| AdapterError::Server(format!("parse session response: {e}")))?;
    Ok(session.id)
}

/// Resolve the iteration the moment the idle signal lands or the server dies.
async fn watch_completion(
    signal_file: PathBuf,
    session_id: String,
    spawned_at: SystemTime,
    mut exit_rx: oneshot::Receiver<IterationEnd>,
    done_tx: oneshot::Sender<IterationEnd>,
) {
    let mut ticker = tokio::time::interval(SIGNAL_POLL);
    loop {
        tokio::select! {
            end = &mut exit_rx => {
                let end = end.unwrap_or(IterationEnd {
                    exit_code: -1,
                    transcript: String::new(),
                });
                let _ = done_tx.send(end);
                return;
            }
            _ = ticker.tick() => {
                if signal_is_fresh(&signal_file, &session_id, spawned_at) {
                    let _ = done_tx.send(IterationEnd {
                        exit_code: 0,
                        transcript: String::new(),
                    });
                    return;
                }
            }
        }
    }
}

/// Whether the signal file holds a fresh idle event for this iteration.
fn signal_is_fresh(path: &Path, session_id: &str, spawned_at: SystemTime) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    // Stale file from a previous run: the mtime predates this spawn.
    if let Ok(mtime) = meta.modified()
        && mtime < spawned_at
    {
        return false;
    }
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(signal) = serde_json::from_str::<IdleSignal>(&content) else {
        return false;
    };
    if signal.event != "idle" {
        return false;
    }
    // The runtime stamps the session it finished; accept a missing id for
    // runtimes that don't include one.
    match &signal.session_id {
        Some(id) => id == session_id,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn allocate_port_finds_a_port() {
        let port = allocate_port().expect("a free port in range");
        assert!((PORT_START..PORT_END).contains(&port));
    }

    #[test]
    fn fresh_idle_signal_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.signal");
        let spawned_at = SystemTime::now() - Duration::from_secs(1);

        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"event": "idle", "timestamp": "2026-01-01T00:00:00Z", "session_id": "ses-1"}}"#
        )
        .unwrap();

        assert!(signal_is_fresh(&path, "ses-1", spawned_at));
        assert!(!signal_is_fresh(&path, "ses-2", spawned_at));
    }

    #[test]
    fn stale_or_missing_signal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.signal");
        assert!(!signal_is_fresh(&path, "ses-1", SystemTime::now()));

        std::fs::write(&path, r#"{"event": "idle"}"#).unwrap();
        // Spawned "later" than the file was written.
        let future = SystemTime::now() + Duration::from_secs(60);
        assert!(!signal_is_fresh(&path, "ses-1", future));
    }

    #[test]
    fn non_idle_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.signal");
        std::fs::write(&path, r#"{"event": "busy", "session_id": "ses-1"}"#).unwrap();
        assert!(!signal_is_fresh(
            &path,
            "ses-1",
            SystemTime::now() - Duration::from_secs(1)
        ));
    }
}
