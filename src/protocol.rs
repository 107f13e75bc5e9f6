//! Wire shapes for the control socket. Requests are `{id?, task, data?}`;
//! every reply is an envelope `{id, timestamp, lastmsg, status, data,
//! completed}`. `completed: false` marks a reply that will be followed by
//! more messages under the same id (the long-running `play`).

use daqplay_engine::job::LoopMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_PORT: u16 = 21749;

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    pub task: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ReplyEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The task name this reply (or follow-up message) belongs to.
    pub lastmsg: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// False while more messages with the same id are coming.
    pub completed: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ReplyEnvelope {
    pub fn success(id: Option<Value>, task: &str, data: Option<Value>, completed: bool) -> Self {
        Self {
            id,
            timestamp: now_ms(),
            lastmsg: task.to_string(),
            status: "success",
            data,
            completed,
        }
    }

    pub fn error(id: Option<Value>, task: &str, reason: &str, message: String) -> Self {
        Self {
            id,
            timestamp: now_ms(),
            lastmsg: task.to_string(),
            status: "error",
            data: Some(serde_json::json!({ "reason": reason, "message": message })),
            completed: true,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"status\":\"error\",\"data\":{{\"reason\":\"internal\",\"message\":\"{}\"}},\"completed\":true}}",
                e
            )
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoadAudioData {
    pub file_path: String,
    pub device_name: String,
    pub ao_channels: Vec<String>,
    #[serde(default)]
    pub do_channels: Option<Vec<String>>,
    #[serde(default)]
    pub ai_channels: Vec<String>,
    #[serde(default)]
    pub volume: Option<u8>,
    #[serde(default)]
    pub samples_per_frame: Option<usize>,
    #[serde(default)]
    pub flip_lr_stereo: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlayData {
    #[serde(default)]
    pub start_position: Option<f64>,
    #[serde(default)]
    pub volume: Option<u8>,
    #[serde(default, rename = "loop")]
    pub loop_mode: Option<LoopMode>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseData {
    #[serde(default)]
    pub stop: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct VolumeData {
    pub volume: u8,
}

#[derive(Debug, Default, Deserialize)]
pub struct SeekData {
    /// Seconds from the start; takes precedence over `position`.
    #[serde(default)]
    pub time: Option<f64>,
    /// Absolute sample index.
    #[serde(default)]
    pub position: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlipData {
    #[serde(default)]
    pub flip_lr_stereo: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DevicesData {
    #[serde(default)]
    pub refresh: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_and_without_id() {
        let request: RequestEnvelope =
            serde_json::from_str(r#"{"id": 7, "task": "status"}"#).unwrap();
        assert_eq!(request.task, "status");
        assert_eq!(request.id, Some(serde_json::json!(7)));

        let request: RequestEnvelope = serde_json::from_str(r#"{"task": "pid"}"#).unwrap();
        assert!(request.id.is_none());
        assert!(request.data.is_none());
    }

    #[test]
    fn reply_envelope_round_trips() {
        let reply = ReplyEnvelope::success(
            Some(serde_json::json!("a1")),
            "play",
            Some(serde_json::json!({"ok": true})),
            false,
        );
        let value: Value = serde_json::from_str(&reply.to_json()).unwrap();
        assert_eq!(value["id"], "a1");
        assert_eq!(value["lastmsg"], "play");
        assert_eq!(value["status"], "success");
        assert_eq!(value["completed"], false);
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn error_reply_carries_reason() {
        let reply = ReplyEnvelope::error(None, "bogus", "unknown_task", "no handler".to_string());
        let value: Value = serde_json::from_str(&reply.to_json()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["data"]["reason"], "unknown_task");
        assert_eq!(value["completed"], true);
    }

    #[test]
    fn seek_data_accepts_time_or_position() {
        let seek: SeekData = serde_json::from_str(r#"{"time": 45.5}"#).unwrap();
        assert_eq!(seek.time, Some(45.5));
        let seek: SeekData = serde_json::from_str(r#"{"position": 12345}"#).unwrap();
        assert_eq!(seek.position, Some(12345));
    }

    #[test]
    fn play_data_maps_loop_keyword() {
        let play: PlayData = serde_json::from_str(r#"{"loop": "one"}"#).unwrap();
        assert_eq!(play.loop_mode, Some(LoopMode::One));
    }
}
