//! Test fixture worker speaking the control-channel protocol directly over its
//! own stdio. Not part of the public API surface — driven only by
//! `tests/integration_worker_lifecycle.rs` via `CARGO_BIN_EXE_echo_worker`.
//!
//! Handles `__handshake__` and an `echo` method; replies to heartbeat pings.
//! Set `ECHO_WORKER_CRASH_AFTER_MS` to exit(7) unprompted after a delay, to
//! exercise the restart-on-crash path without a real misbehaving worker.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use worker_ipc::protocol::{create_error_response, create_notification, create_response, reserved, ErrorObject, Parsed};

#[tokio::main]
async fn main() {
    if let Ok(raw) = std::env::var("ECHO_WORKER_CRASH_AFTER_MS") {
        if let Ok(ms) = raw.parse::<u64>() {
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                std::process::exit(7);
            });
        }
    }

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        match worker_ipc::protocol::parse(value) {
            Parsed::Request(envelope) => {
                let id = envelope.id.unwrap();
                let method = envelope.method.unwrap_or_default();
                let response = match method.as_str() {
                    reserved::HANDSHAKE => create_response(id, json!({"name": "echo-worker", "capabilities": []})),
                    "echo" => create_response(id, envelope.params.unwrap_or(Value::Null)),
                    _ => create_error_response(
                        id,
                        ErrorObject {
                            code: -32601,
                            message: format!("no such method: {method}"),
                            data: None,
                        },
                    ),
                };
                write_envelope(&mut stdout, &response).await;
            }
            Parsed::Notification(envelope) => {
                if envelope.method.as_deref() == Some(reserved::HEARTBEAT_PING) {
                    let seq = envelope
                        .params
                        .as_ref()
                        .and_then(|p| p.get("seq"))
                        .cloned()
                        .unwrap_or(json!(0));
                    let pong = create_notification(reserved::HEARTBEAT_PONG, Some(json!({"seq": seq})));
                    write_envelope(&mut stdout, &pong).await;
                }
            }
            _ => {}
        }
    }
}

async fn write_envelope(stdout: &mut tokio::io::Stdout, envelope: &worker_ipc::protocol::Envelope) {
    if let Ok(mut bytes) = serde_json::to_vec(envelope) {
        bytes.push(b'\n');
        let _ = stdout.write_all(&bytes).await;
        let _ = stdout.flush().await;
    }
}
