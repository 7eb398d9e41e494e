// intercom-signaling-service/src/call/state.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Requesting,
    Ringing,
    Connected,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Requesting => "requesting",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Still waiting for the callee to pick up.
    pub fn is_pending(&self) -> bool {
        matches!(self, CallState::Requesting | CallState::Ringing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub room_id: String,
    pub state: CallState,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub end_reason: Option<String>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        caller_id: String,
        callee_id: String,
        room_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            callee_id,
            room_id,
            state: CallState::Requesting,
            start_time: now,
            end_time: None,
            last_activity: now,
            end_reason: None,
        }
    }

    /// Whole seconds between start and end; zero while still active.
    pub fn duration_seconds(&self) -> i64 {
        self.end_time
            .map(|end| (end - self.start_time).num_seconds().max(0))
            .unwrap_or(0)
    }
}
