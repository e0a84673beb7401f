//! Per-loop JSON-RPC 2.0 server over a Unix domain socket.
//!
//! NDJSON framing: each frame is exactly one JSON value terminated by `\n`.
//! A single connection multiplexes requests, their in-order responses, and
//! `event` notifications for the types the connection subscribed to.
//! Subscription state is per-connection and forgotten on disconnect.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{RalphError, RalphResult};
use crate::interactive::{ForwardResult, InteractiveController};
use crate::state::{Controls, Event, SharedState, StatePatch};

// JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Backend-specific errors (e.g. "agent not installed") with structured data.
pub const AGENT_ERROR: i64 = -32000;

const VALID_EVENTS: &[&str] = &["output", "state_change", "*"];

struct RpcFault {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcFault {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// The per-loop control-and-observation endpoint.
pub struct RpcServer {
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RpcServer {
    /// Bind the loop's socket and start accepting connections.
    ///
    /// The socket file gets owner-only permissions; a stale file from a
    /// previous run is removed first.
    pub async fn bind(
        socket_path: &Path,
        state: Arc<SharedState>,
        controls: Arc<Controls>,
        interactive: Arc<InteractiveController>,
    ) -> RalphResult<Self> {
        match std::fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RalphError::Rpc(format!("remove stale socket: {e}"))),
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| RalphError::Rpc(format!("bind {}: {e}", socket_path.display())))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| RalphError::Rpc(format!("chmod socket: {e}")))?;

        info!(path = %socket_path.display(), "rpc server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            accept_state,
            controls,
            interactive,
            shutdown_rx,
        ));

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            shutdown: shutdown_tx,
            accept_task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, let connections flush queued events, remove the socket.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    state: Arc<SharedState>,
    controls: Arc<Controls>,
    interactive: Arc<InteractiveController>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let conn = Connection {
                            state: Arc::clone(&state),
                            controls: Arc::clone(&controls),
                            interactive: Arc::clone(&interactive),
                            subscriptions: HashSet::new(),
                        };
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn.run(stream, conn_shutdown).await {
                                debug!("rpc connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("rpc accept error: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("rpc accept loop shutting down");
                    break;
                }
            }
        }
    }
}

struct Connection {
    state: Arc<SharedState>,
    controls: Arc<Controls>,
    interactive: Arc<InteractiveController>,
    subscriptions: HashSet<String>,
}

impl Connection {
    async fn run(
        mut self,
        stream: UnixStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut events = self.state.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(response) = self.process_request(line) {
                        write_frame(&mut writer, &response).await?;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if self.is_subscribed(event.event_type) {
                                write_frame(&mut writer, &notification(&event)).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped = n, "rpc subscriber lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Flush any already-queued events (the terminal
                        // state_change among them) before closing.
                        while let Ok(event) = events.try_recv() {
                            if self.is_subscribed(event.event_type) {
                                write_frame(&mut writer, &notification(&event)).await?;
                            }
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscriptions.contains(event_type) || self.subscriptions.contains("*")
    }

    /// Parse and dispatch one frame; `None` means no response (notification).
    fn process_request(&mut self, raw: &str) -> Option<Value> {
        let request: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Some(error_response(Value::Null, PARSE_ERROR, "Parse error", None)),
        };

        let Some(obj) = request.as_object() else {
            return Some(error_response(
                Value::Null,
                INVALID_REQUEST,
                "Invalid request",
                None,
            ));
        };

        let id = obj.get("id").cloned();
        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(error_response(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "Invalid JSON-RPC version",
                None,
            ));
        }
        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            return Some(error_response(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "Missing method",
                None,
            ));
        };
        let params = obj.get("params").cloned().unwrap_or_else(|| json!({}));

        let is_notification = id.is_none();
        let result = self.dispatch(method, &params);

        if is_notification {
            return None;
        }
        let id = id.unwrap_or(Value::Null);
        Some(match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(fault) => error_response(id, fault.code, &fault.message, fault.data),
        })
    }

    fn dispatch(&mut self, method: &str, params: &Value) -> Result<Value, RpcFault> {
        match method {
            "get_status" => Ok(serde_json::to_value(self.state.snapshot())
                .map_err(|e| RpcFault::new(INTERNAL_ERROR, e.to_string()))?),
            "stop" => {
                self.controls.request_stop();
                Ok(json!({"status": "stop_requested"}))
            }
            "checkpoint" => {
                self.controls.request_checkpoint();
                Ok(json!({"status": "checkpoint_requested"}))
            }
            "inject_prompt" => {
                let prompt = params
                    .get("prompt")
                    .and_then(Value::as_str)
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        RpcFault::new(INVALID_PARAMS, "Missing or empty 'prompt' parameter")
                    })?;
                self.controls.inject_prompt(prompt);
                Ok(json!({"status": "prompt_injected", "prompt": prompt.trim()}))
            }
            "set_interactive_mode" => {
                let enabled = params.get("enabled").and_then(Value::as_bool).ok_or_else(|| {
                    RpcFault::new(
                        INVALID_PARAMS,
                        "Missing or invalid 'enabled' parameter (must be bool)",
                    )
                })?;
                let effective = self.interactive.set_mode(enabled);
                self.state.update(StatePatch {
                    interactive_mode: Some(effective),
                    ..Default::default()
                });
                Ok(json!({"interactive_mode": effective}))
            }
            "write_pty" => {
                let data = params
                    .get("data")
                    .and_then(Value::as_str)
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| {
                        RpcFault::new(INVALID_PARAMS, "Missing or empty 'data' parameter")
                    })?;
                match self.interactive.forward_input(data.as_bytes()) {
                    ForwardResult::Forwarded => Ok(json!({"status": "forwarded"})),
                    ForwardResult::Ignored(reason) => {
                        Ok(json!({"status": "ignored", "reason": reason}))
                    }
                }
            }
            "subscribe" => {
                let events = parse_event_list(params)?;
                for event in events {
                    self.subscriptions.insert(event);
                }
                Ok(json!({"subscribed": sorted(&self.subscriptions)}))
            }
            "unsubscribe" => {
                let events = parse_event_list(params)?;
                for event in events {
                    self.subscriptions.remove(&event);
                }
                Ok(json!({"subscribed": sorted(&self.subscriptions)}))
            }
            other => Err(RpcFault::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }
}

fn parse_event_list(params: &Value) -> Result<Vec<String>, RpcFault> {
    let list = params
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcFault::new(INVALID_PARAMS, "'events' must be a list"))?;

    let mut events = Vec::new();
    for entry in list {
        let name = entry.as_str().unwrap_or("");
        if !VALID_EVENTS.contains(&name) {
            return Err(RpcFault::new(
                INVALID_PARAMS,
                format!(
                    "Invalid event type: '{name}'. Valid: {}",
                    VALID_EVENTS.join(", ")
                ),
            ));
        }
        events.push(name.to_string());
    }
    Ok(events)
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}

fn notification(event: &Event) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "event",
        "params": {
            "type": event.event_type,
            "timestamp": event.timestamp,
            "data": event.data,
        }
    })
}

fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({"jsonrpc": "2.0", "id": id, "error": error})
}

async fn write_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    value: &Value,
) -> std::io::Result<()> {
    let mut frame = serde_json::to_string(value).unwrap_or_default();
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<SharedState>,
        controls: Arc<Controls>,
        server: RpcServer,
    }

    async fn start_server() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("loop.sock");
        let state = Arc::new(SharedState::new("demo", "tasks/demo", "claude", 10));
        let controls = Arc::new(Controls::new());
        let interactive = Arc::new(InteractiveController::new());
        let server = RpcServer::bind(
            &socket,
            Arc::clone(&state),
            Arc::clone(&controls),
            interactive,
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            state,
            controls,
            server,
        }
    }

    async fn connect(server: &RpcServer) -> (tokio::net::unix::OwnedWriteHalf, tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) {
        let stream = UnixStream::connect(server.socket_path()).await.unwrap();
        let (reader, writer) = stream.into_split();
        (writer, BufReader::new(reader).lines())
    }

    async fn call(
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        frame: &str,
    ) -> Value {
        writer.write_all(frame.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn get_status_returns_snapshot() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "get_status"}"#,
        )
        .await;
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["task_name"], "demo");
        assert_eq!(resp["result"]["status"], "running");
        assert_eq!(resp["result"]["recent_output"], json!([]));

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn stop_and_checkpoint_set_flags() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let resp = call(&mut w, &mut r, r#"{"jsonrpc": "2.0", "id": 1, "method": "stop"}"#).await;
        assert_eq!(resp["result"]["status"], "stop_requested");
        assert!(fx.controls.stop_requested());

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 2, "method": "checkpoint"}"#,
        )
        .await;
        assert_eq!(resp["result"]["status"], "checkpoint_requested");
        assert!(fx.controls.checkpoint_requested());

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn inject_prompt_validates_and_queues() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "inject_prompt", "params": {"prompt": "use sqlite"}}"#,
        )
        .await;
        assert_eq!(resp["result"]["status"], "prompt_injected");
        assert_eq!(fx.controls.take_injected().as_deref(), Some("use sqlite"));

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 2, "method": "inject_prompt", "params": {"prompt": "  "}}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], INVALID_PARAMS);

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_round_trip() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "subscribe", "params": {"events": ["output"]}}"#,
        )
        .await;
        assert_eq!(resp["result"]["subscribed"], json!(["output"]));

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 2, "method": "unsubscribe", "params": {"events": ["output"]}}"#,
        )
        .await;
        // Back to the pre-subscribe set.
        assert_eq!(resp["result"]["subscribed"], json!([]));

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 3, "method": "subscribe", "params": {"events": ["bogus"]}}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], INVALID_PARAMS);

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn subscribed_connection_receives_output_events() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "subscribe", "params": {"events": ["*"]}}"#,
        )
        .await;

        fx.state.push_output("agent says hi".to_string());

        let line = r.next_line().await.unwrap().unwrap();
        let note: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(note["method"], "event");
        assert_eq!(note["params"]["type"], "output");
        assert_eq!(note["params"]["data"]["line"], "agent says hi");

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribed_types_are_not_delivered() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "subscribe", "params": {"events": ["state_change"]}}"#,
        )
        .await;

        fx.state.push_output("not for this client".to_string());
        fx.state.update(StatePatch::status("completed"));

        // The first frame to arrive must be the state_change, not the output.
        let line = r.next_line().await.unwrap().unwrap();
        let note: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(note["params"]["type"], "state_change");
        assert_eq!(note["params"]["data"]["status"], "completed");

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn protocol_errors_keep_the_connection_open() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let resp = call(&mut w, &mut r, "this is not json").await;
        assert_eq!(resp["error"]["code"], PARSE_ERROR);
        assert_eq!(resp["id"], Value::Null);

        let resp = call(&mut w, &mut r, r#"{"jsonrpc": "2.0", "id": 5, "method": "nope"}"#).await;
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);

        let resp = call(&mut w, &mut r, r#"{"jsonrpc": "1.0", "id": 6, "method": "stop"}"#).await;
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);

        // Connection still serves requests after all three errors.
        let resp = call(&mut w, &mut r, r#"{"jsonrpc": "2.0", "id": 7, "method": "get_status"}"#).await;
        assert_eq!(resp["id"], 7);

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn responses_arrive_in_request_order() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let batch = concat!(
            r#"{"jsonrpc": "2.0", "id": 1, "method": "get_status"}"#,
            "\n",
            r#"{"jsonrpc": "2.0", "id": 2, "method": "get_status"}"#,
            "\n",
            r#"{"jsonrpc": "2.0", "id": 3, "method": "get_status"}"#,
            "\n"
        );
        w.write_all(batch.as_bytes()).await.unwrap();

        for expected in 1..=3 {
            let line = r.next_line().await.unwrap().unwrap();
            let resp: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(resp["id"], expected);
        }

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn write_pty_refused_outside_interactive_mode() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "write_pty", "params": {"data": "ls\n"}}"#,
        )
        .await;
        assert_eq!(resp["result"]["status"], "ignored");
        assert_eq!(resp["result"]["reason"], "not in interactive mode");

        fx.server.shutdown().await;
    }

    #[tokio::test]
    async fn set_interactive_mode_emits_state_change() {
        let fx = start_server().await;
        let (mut w, mut r) = connect(&fx.server).await;

        call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "subscribe", "params": {"events": ["state_change"]}}"#,
        )
        .await;
        let resp = call(
            &mut w,
            &mut r,
            r#"{"jsonrpc": "2.0", "id": 2, "method": "set_interactive_mode", "params": {"enabled": true}}"#,
        )
        .await;
        assert_eq!(resp["result"]["interactive_mode"], true);

        let line = r.next_line().await.unwrap().unwrap();
        let note: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(note["params"]["data"]["interactive_mode"], true);

        fx.server.shutdown().await;
    }
}
