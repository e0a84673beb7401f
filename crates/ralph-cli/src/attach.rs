//! Attach client: connect to a running loop's RPC socket and watch or drive
//! it.
//!
//! Keys: `Ctrl+]` detaches, `Ctrl+E` toggles interactive mode. While
//! interactive, every other key is forwarded into the agent's PTY via
//! `write_pty`; completion detection is suppressed server-side for the
//! duration.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::event::{Event as TermEvent, KeyCode, KeyEvent, KeyModifiers};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Connect and run the attach session. Returns the process exit code.
pub async fn attach(socket_path: &Path, task_name: &str) -> Result<i32> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    send(&mut writer, 1, "get_status", json!({})).await?;
    send(&mut writer, 2, "subscribe", json!({"events": ["*"]})).await?;

    // Blocking key reader on its own thread; raw mode lasts until detach.
    crossterm::terminal::enable_raw_mode().context("enable raw mode")?;
    let (key_tx, mut key_rx) = mpsc::unbounded_channel::<KeyEvent>();
    std::thread::spawn(move || {
        while let Ok(event) = crossterm::event::read() {
            if let TermEvent::Key(key) = event {
                if key_tx.send(key).is_err() {
                    break;
                }
            }
        }
    });

    let result = run_session(&mut lines, &mut writer, &mut key_rx, task_name).await;
    let _ = crossterm::terminal::disable_raw_mode();
    println!();
    result
}

async fn run_session(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    keys: &mut mpsc::UnboundedReceiver<KeyEvent>,
    task_name: &str,
) -> Result<i32> {
    let mut next_id: u64 = 3;
    let mut interactive = false;

    print_line(&format!("Attached to '{task_name}'. Ctrl+] detaches, Ctrl+E toggles interactive mode."));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    print_line("Server closed the connection.");
                    return Ok(0);
                };
                let Ok(frame) = serde_json::from_str::<Value>(&line) else { continue };
                handle_frame(&frame, &mut interactive, task_name);
                if frame["method"] == "event"
                    && frame["params"]["type"] == "state_change"
                    && let Some(status) = frame["params"]["data"]["status"].as_str()
                    && status != "running"
                {
                    print_line(&format!("Loop '{task_name}' is now {status}. Detaching."));
                    return Ok(0);
                }
            }
            key = keys.recv() => {
                let Some(key) = key else { return Ok(0) };
                match classify_key(&key) {
                    KeyAction::Detach => {
                        print_line("Detached.");
                        return Ok(0);
                    }
                    KeyAction::ToggleInteractive => {
                        let enable = !interactive;
                        send(writer, next_id, "set_interactive_mode",
                             json!({"enabled": enable})).await?;
                        next_id += 1;
                    }
                    KeyAction::Forward(bytes) if interactive => {
                        send(writer, next_id, "write_pty",
                             json!({"data": String::from_utf8_lossy(&bytes)})).await?;
                        next_id += 1;
                    }
                    KeyAction::Forward(_) | KeyAction::None => {}
                }
            }
        }
    }
}

fn handle_frame(frame: &Value, interactive: &mut bool, task_name: &str) {
    if frame["method"] == "event" {
        let params = &frame["params"];
        match params["type"].as_str() {
            Some("output") => {
                if let Some(line) = params["data"]["line"].as_str() {
                    print_line(line);
                }
            }
            Some("state_change") => {
                let data = &params["data"];
                if let Some(mode) = data["interactive_mode"].as_bool() {
                    *interactive = mode;
                    let label = if mode { "interactive" } else { "autonomous" };
                    print_line(&format!("-- {label} mode --"));
                }
                if let Some(iteration) = data["iteration"].as_u64() {
                    print_line(&format!("-- iteration {iteration} --"));
                }
            }
            _ => {}
        }
        return;
    }

    // The get_status response: print a short summary and the output tail.
    if frame["id"] == 1
        && let Some(result) = frame.get("result")
    {
        print_line(&format!(
            "{task_name}: {} | iteration {}/{} | agent {} | story {}",
            result["status"].as_str().unwrap_or("?"),
            result["iteration"].as_u64().unwrap_or(0),
            result["max_iterations"].as_u64().unwrap_or(0),
            result["agent"].as_str().unwrap_or("?"),
            result["current_story"].as_str().unwrap_or("-"),
        ));
        if let Some(tail) = result["recent_output"].as_array() {
            for line in tail.iter().rev().take(15).rev() {
                if let Some(line) = line.as_str() {
                    print_line(line);
                }
            }
        }
    }
}

enum KeyAction {
    Detach,
    ToggleInteractive,
    Forward(Vec<u8>),
    None,
}

/// Map a key event to its action or raw terminal bytes.
fn classify_key(key: &KeyEvent) -> KeyAction {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Char(']') if ctrl => KeyAction::Detach,
        KeyCode::Char('e') if ctrl => KeyAction::ToggleInteractive,
        KeyCode::Char(c) if ctrl => {
            // Ctrl+A..Ctrl+Z map to 0x01..0x1a.
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() {
                KeyAction::Forward(vec![(c as u8) - b'a' + 1])
            } else {
                KeyAction::None
            }
        }
        KeyCode::Char(c) => KeyAction::Forward(c.to_string().into_bytes()),
        KeyCode::Enter => KeyAction::Forward(vec![b'\r']),
        KeyCode::Backspace => KeyAction::Forward(vec![0x7f]),
        KeyCode::Tab => KeyAction::Forward(vec![b'\t']),
        KeyCode::Esc => KeyAction::Forward(vec![0x1b]),
        KeyCode::Up => KeyAction::Forward(b"\x1b[A".to_vec()),
        KeyCode::Down => KeyAction::Forward(b"\x1b[B".to_vec()),
        KeyCode::Right => KeyAction::Forward(b"\x1b[C".to_vec()),
        KeyCode::Left => KeyAction::Forward(b"\x1b[D".to_vec()),
        _ => KeyAction::None,
    }
}

async fn send(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    id: u64,
    method: &str,
    params: Value,
) -> Result<()> {
    let mut frame = serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    }))?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    Ok(())
}

/// Raw mode needs an explicit carriage return.
fn print_line(line: &str) {
    let mut out = std::io::stdout();
    let _ = write!(out, "{line}\r\n");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn control_bracket_detaches() {
        assert!(matches!(
            classify_key(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)),
            KeyAction::Detach
        ));
    }

    #[test]
    fn control_e_toggles() {
        assert!(matches!(
            classify_key(&key(KeyCode::Char('e'), KeyModifiers::CONTROL)),
            KeyAction::ToggleInteractive
        ));
    }

    #[test]
    fn plain_chars_forward_utf8() {
        match classify_key(&key(KeyCode::Char('l'), KeyModifiers::NONE)) {
            KeyAction::Forward(bytes) => assert_eq!(bytes, b"l"),
            _ => panic!("expected forward"),
        }
    }

    #[test]
    fn control_c_maps_to_etx() {
        match classify_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)) {
            KeyAction::Forward(bytes) => assert_eq!(bytes, vec![0x03]),
            _ => panic!("expected forward"),
        }
    }

    #[test]
    fn arrows_emit_csi_sequences() {
        match classify_key(&key(KeyCode::Up, KeyModifiers::NONE)) {
            KeyAction::Forward(bytes) => assert_eq!(bytes, b"\x1b[A"),
            _ => panic!("expected forward"),
        }
    }
}
