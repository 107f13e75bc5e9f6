use serde::{Deserialize, Serialize};

/// Canonical playback state. Mutated only by the engine task, which
/// serializes every state-changing control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    Loaded,
    Playing,
    Paused,
    Seeking,
    Completed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Idle => "idle",
            TransportState::Loaded => "loaded",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
            TransportState::Seeking => "seeking",
            TransportState::Completed => "completed",
        }
    }

    /// States from which `play` may start or restart generation.
    pub fn can_play(&self) -> bool {
        matches!(
            self,
            TransportState::Loaded
                | TransportState::Paused
                | TransportState::Completed
                | TransportState::Playing
        )
    }

    pub fn can_seek(&self) -> bool {
        matches!(
            self,
            TransportState::Playing
                | TransportState::Paused
                | TransportState::Loaded
                | TransportState::Completed
        )
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, TransportState::Idle)
    }
}

/// Transport context: the state plus the sticky error surfaced in the next
/// status reply after a non-fatal failure (underflow escalation).
#[derive(Debug, Default)]
pub struct Transport {
    state: Option<TransportState>,
    pub error: Option<String>,
}

impl Transport {
    pub fn state(&self) -> TransportState {
        self.state.unwrap_or(TransportState::Idle)
    }

    pub fn set(&mut self, next: TransportState) {
        if next == TransportState::Playing {
            self.error = None;
        }
        self.state = Some(next);
    }

    pub fn reset(&mut self) {
        self.state = Some(TransportState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_cannot_play_or_seek() {
        assert!(!TransportState::Idle.can_play());
        assert!(!TransportState::Idle.can_seek());
        assert!(!TransportState::Idle.is_active());
    }

    #[test]
    fn completed_replays_from_start() {
        assert!(TransportState::Completed.can_play());
        assert!(TransportState::Completed.can_seek());
    }

    #[test]
    fn playing_clears_sticky_error() {
        let mut transport = Transport::default();
        transport.set(TransportState::Paused);
        transport.error = Some("underflow".to_string());
        transport.set(TransportState::Playing);
        assert!(transport.error.is_none());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&TransportState::Playing).unwrap();
        assert_eq!(json, "\"playing\"");
    }
}
