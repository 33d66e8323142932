//! Shared web state and the WebSocket message vocabulary.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::warn;

use crate::control::{CommandQueue, CommandReply, Published, StatePublisher};
use crate::engine::Command;
use crate::macros::MacroId;

/// Shared state for the web server.
pub struct WebState {
    pub publisher: Arc<StatePublisher>,
    pub commands: Arc<CommandQueue>,
    /// Serialized state messages, fanned out to every socket.
    pub updates: broadcast::Sender<String>,
}

/// A parsed inbound WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(Command),
    RequestState,
}

pub fn state_message(kind: &str, published: &Published) -> String {
    json!({
        "type": kind,
        "state": published.state,
        "macros": published.macros,
        "link": published.link,
    })
    .to_string()
}

pub fn result_message(cmd: &str, reply: &CommandReply) -> String {
    match reply {
        Ok(_) => json!({ "type": "command_result", "cmd": cmd, "ok": true }),
        Err(e) => json!({ "type": "command_result", "cmd": cmd, "ok": false, "error": e }),
    }
    .to_string()
}

fn macro_id(v: &Value) -> Result<MacroId, String> {
    v.as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .map(MacroId)
        .ok_or_else(|| format!("invalid macro id: {v}"))
}

fn slot(v: &Value) -> Result<usize, String> {
    v.as_u64()
        .map(|s| s as usize)
        .ok_or_else(|| format!("invalid slot: {v}"))
}

fn pair<'a>(cmd: &str, data: &'a Value) -> Result<(&'a Value, &'a Value), String> {
    match data.as_array().map(Vec::as_slice) {
        Some([a, b, ..]) => Ok((a, b)),
        _ => Err(format!("{cmd} expects [a, b] data")),
    }
}

/// Parse `{"cmd": "...", "data": ...}`.
pub fn parse_message(val: &Value) -> Result<Inbound, String> {
    let cmd = val
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or("missing \"cmd\"")?;
    let data = val.get("data").unwrap_or(&Value::Null);

    let command = match cmd {
        "REQUEST_STATE" => return Ok(Inbound::RequestState),
        "TOGGLE_MACRO_MODE" => Command::ToggleMacroMode,
        "TOGGLE_RECORDING" => Command::ToggleRecording,
        "PREV_SLOT" => Command::PrevSlot,
        "NEXT_SLOT" => Command::NextSlot,
        "PLAY_MACRO" => Command::PlayMacro,
        "STOP_PLAYBACK" => Command::StopPlayback,
        "CYCLE_SPEED" => Command::CycleSpeed,
        "SELECT_SLOT" => Command::SelectSlot(slot(data)?),
        "DELETE_MACRO" => Command::DeleteMacro(macro_id(data)?),
        "RENAME_MACRO" => {
            let (id, name) = pair(cmd, data)?;
            let name = name.as_str().ok_or("macro name must be a string")?;
            if name.trim().is_empty() {
                return Err("macro name is empty".into());
            }
            Command::RenameMacro(macro_id(id)?, name.to_string())
        }
        "BIND_SLOT" => {
            let (s, id) = pair(cmd, data)?;
            Command::BindSlot {
                slot: slot(s)?,
                id: macro_id(id)?,
            }
        }
        "SET_PLAYBACK_SPEED" => {
            let speed = data.as_f64().ok_or("speed must be a number")?;
            Command::SetPlaybackSpeed(speed as f32)
        }
        _ => {
            warn!("[WEB] Unknown command: {cmd}");
            return Err(format!("unknown command: {cmd}"));
        }
    };
    Ok(Inbound::Command(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Inbound, String> {
        parse_message(&serde_json::from_str(s).unwrap())
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(
            parse(r#"{"cmd":"TOGGLE_MACRO_MODE"}"#),
            Ok(Inbound::Command(Command::ToggleMacroMode))
        );
        assert_eq!(
            parse(r#"{"cmd":"STOP_PLAYBACK","data":null}"#),
            Ok(Inbound::Command(Command::StopPlayback))
        );
        assert_eq!(parse(r#"{"cmd":"REQUEST_STATE"}"#), Ok(Inbound::RequestState));
    }

    #[test]
    fn test_commands_with_data() {
        assert_eq!(
            parse(r#"{"cmd":"SELECT_SLOT","data":3}"#),
            Ok(Inbound::Command(Command::SelectSlot(3)))
        );
        assert_eq!(
            parse(r#"{"cmd":"RENAME_MACRO","data":[4,"jump loop"]}"#),
            Ok(Inbound::Command(Command::RenameMacro(MacroId(4), "jump loop".into())))
        );
        assert_eq!(
            parse(r#"{"cmd":"BIND_SLOT","data":[1,9]}"#),
            Ok(Inbound::Command(Command::BindSlot {
                slot: 1,
                id: MacroId(9)
            }))
        );
        assert_eq!(
            parse(r#"{"cmd":"SET_PLAYBACK_SPEED","data":0.5}"#),
            Ok(Inbound::Command(Command::SetPlaybackSpeed(0.5)))
        );
    }

    #[test]
    fn test_bad_messages() {
        assert!(parse(r#"{"data":1}"#).is_err());
        assert!(parse(r#"{"cmd":"LAUNCH_ROCKETS"}"#).is_err());
        assert!(parse(r#"{"cmd":"SELECT_SLOT","data":"two"}"#).is_err());
        assert!(parse(r#"{"cmd":"DELETE_MACRO","data":-1}"#).is_err());
        assert!(parse(r#"{"cmd":"RENAME_MACRO","data":[1]}"#).is_err());
        assert!(parse(r#"{"cmd":"RENAME_MACRO","data":[1,"  "]}"#).is_err());
    }

    #[test]
    fn test_result_message() {
        let ok: Value = serde_json::from_str(&result_message("PLAY_MACRO", &Ok(None))).unwrap();
        assert_eq!(ok["type"], "command_result");
        assert_eq!(ok["ok"], true);
        let err: Value =
            serde_json::from_str(&result_message("PLAY_MACRO", &Err("slot 0 is empty".into()))).unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "slot 0 is empty");
    }
}
