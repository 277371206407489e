//! Wire Protocol Types
//!
//! One JSON object per newline-terminated line, in both directions.
//! Requests carry an `id` and an `action` tag; the server answers each
//! request with exactly one `type:"response"` frame echoing the id, and
//! pushes `type:"event"` frames (no id) to subscribed connections.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A client request: correlation id plus the action and its arguments,
/// flattened into the same JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub action: Action,
}

/// Every operation the daemon serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    Start {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
    },
    Stop {
        terminal: String,
        #[serde(default)]
        force: bool,
    },
    Stdin {
        terminal: String,
        data: String,
        #[serde(default)]
        is_key: bool,
    },
    Stdout {
        terminal: String,
        mode: OutputMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes: Option<usize>,
    },
    Subscribe {
        terminal: String,
    },
    Unsubscribe {
        terminal: String,
    },
    Resize {
        terminal: String,
        cols: u16,
        rows: u16,
    },
    List,
    TermSize,
    KillServer,
}

/// Action names the dispatcher recognizes, used to distinguish
/// `UnknownAction` from a shape mismatch (`BadRequest`).
pub const KNOWN_ACTIONS: &[&str] = &[
    "start",
    "stop",
    "stdin",
    "stdout",
    "subscribe",
    "unsubscribe",
    "resize",
    "list",
    "term-size",
    "kill-server",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// The rendered screen snapshot.
    Screen,
    /// The raw buffered byte stream, lossily decoded.
    Stream,
}

/// Error taxonomy shared across the wire. Client-only conditions
/// (timeout, disconnect) live in `client::ClientError`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownAction,
    BadRequest,
    InvalidKey,
    UnknownTerminal,
    Exited,
    SpawnError,
    WriteError,
    ReadError,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

/// Frames sent from the server to a client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Event {
        terminal: String,
        kind: EventKind,
        data: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A chunk of terminal output, in PTY read order.
    Output,
    /// The terminal's child exited; `data` is the exit code.
    Exit,
}

impl ServerMessage {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        ServerMessage::Response {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Response {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn event(terminal: impl Into<String>, kind: EventKind, data: impl Into<String>) -> Self {
        ServerMessage::Event {
            terminal: terminal.into(),
            kind,
            data: data.into(),
        }
    }
}

/// One row of a `list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEntry {
    pub id: String,
    pub command: String,
    pub running: bool,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Result of `term-size`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_start_parses_wire_shape() {
        let req: Request = serde_json::from_str(
            r#"{"id":"1","action":"start","command":"bash","cols":120,"rows":40}"#,
        )
        .unwrap();
        assert_eq!(req.id, "1");
        match req.action {
            Action::Start {
                command,
                cols,
                rows,
                cwd,
                env,
            } => {
                assert_eq!(command, "bash");
                assert_eq!(cols, Some(120));
                assert_eq!(rows, Some(40));
                assert!(cwd.is_none());
                assert!(env.is_none());
            }
            other => panic!("wrong action: {:?}", other),
        }
    }

    #[test]
    fn request_stdin_key_parses() {
        let req: Request = serde_json::from_str(
            r#"{"id":"3","action":"stdin","terminal":"term-1","data":"Up","is_key":true}"#,
        )
        .unwrap();
        match req.action {
            Action::Stdin {
                terminal,
                data,
                is_key,
            } => {
                assert_eq!(terminal, "term-1");
                assert_eq!(data, "Up");
                assert!(is_key);
            }
            other => panic!("wrong action: {:?}", other),
        }
    }

    #[test]
    fn request_stdin_is_key_defaults_false() {
        let req: Request = serde_json::from_str(
            r#"{"id":"2","action":"stdin","terminal":"term-1","data":"ls\r"}"#,
        )
        .unwrap();
        match req.action {
            Action::Stdin { is_key, .. } => assert!(!is_key),
            other => panic!("wrong action: {:?}", other),
        }
    }

    #[test]
    fn request_stdout_modes() {
        let screen: Request = serde_json::from_str(
            r#"{"id":"4","action":"stdout","terminal":"term-1","mode":"screen"}"#,
        )
        .unwrap();
        match screen.action {
            Action::Stdout { mode, lines, bytes, .. } => {
                assert_eq!(mode, OutputMode::Screen);
                assert!(lines.is_none());
                assert!(bytes.is_none());
            }
            other => panic!("wrong action: {:?}", other),
        }

        let stream: Request = serde_json::from_str(
            r#"{"id":"5","action":"stdout","terminal":"term-1","mode":"stream","lines":200}"#,
        )
        .unwrap();
        match stream.action {
            Action::Stdout { mode, lines, .. } => {
                assert_eq!(mode, OutputMode::Stream);
                assert_eq!(lines, Some(200));
            }
            other => panic!("wrong action: {:?}", other),
        }
    }

    #[test]
    fn kebab_case_action_tags() {
        let req: Request =
            serde_json::from_str(r#"{"id":"9","action":"term-size"}"#).unwrap();
        assert!(matches!(req.action, Action::TermSize));

        let req: Request =
            serde_json::from_str(r#"{"id":"10","action":"kill-server"}"#).unwrap();
        assert!(matches!(req.action, Action::KillServer));
    }

    #[test]
    fn known_actions_matches_serde_tags() {
        for action in KNOWN_ACTIONS {
            let value = match *action {
                "start" => json!({"id":"x","action":action,"command":"true"}),
                "stop" | "subscribe" | "unsubscribe" => {
                    json!({"id":"x","action":action,"terminal":"t"})
                }
                "stdin" => json!({"id":"x","action":action,"terminal":"t","data":"d"}),
                "stdout" => {
                    json!({"id":"x","action":action,"terminal":"t","mode":"screen"})
                }
                "resize" => {
                    json!({"id":"x","action":action,"terminal":"t","cols":80,"rows":24})
                }
                _ => json!({"id":"x","action":action}),
            };
            let parsed: Result<Request, _> = serde_json::from_value(value);
            assert!(parsed.is_ok(), "action {:?} should parse", action);
        }
    }

    #[test]
    fn response_ok_serializes() {
        let msg = ServerMessage::ok("4", json!("screen text"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], "4");
        assert_eq!(value["ok"], true);
        assert_eq!(value["result"], "screen text");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn response_err_serializes() {
        let msg = ServerMessage::err("2", ErrorCode::UnknownTerminal, "no such terminal");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "UnknownTerminal");
        assert_eq!(value["error"]["message"], "no such terminal");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn event_has_no_id() {
        let msg = ServerMessage::event("term-1", EventKind::Output, "hello\n");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["terminal"], "term-1");
        assert_eq!(value["kind"], "output");
        assert_eq!(value["data"], "hello\n");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn frames_discriminate_on_type() {
        let resp: ServerMessage =
            serde_json::from_str(r#"{"type":"response","id":"1","ok":true,"result":null}"#)
                .unwrap();
        assert!(matches!(resp, ServerMessage::Response { .. }));

        let event: ServerMessage = serde_json::from_str(
            r#"{"type":"event","terminal":"term-1","kind":"exit","data":"0"}"#,
        )
        .unwrap();
        match event {
            ServerMessage::Event { kind, data, .. } => {
                assert_eq!(kind, EventKind::Exit);
                assert_eq!(data, "0");
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn error_codes_serialize_pascal_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::UnknownAction).unwrap(),
            "UnknownAction"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::InvalidKey).unwrap(),
            "InvalidKey"
        );
    }

    #[test]
    fn terminal_entry_omits_absent_fields() {
        let entry = TerminalEntry {
            id: "term-1".to_string(),
            command: "bash".to_string(),
            running: true,
            cols: 80,
            rows: 24,
            pid: Some(1234),
            exit_code: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["pid"], 1234);
        assert!(value.get("exit_code").is_none());
    }
}
