// intercom-signaling-service/src/signaling/messages.rs

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::rtc::Credential;

/// `calls/request/{deviceID}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub target_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// `users/{userID}/calls/incoming`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub call_id: String,
    pub caller_id: String,
    pub room_id: String,
    pub credential: Credential,
    pub timestamp: i64,
}

/// Sent on both control topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub call_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    pub timestamp: i64,
}

/// Inbound on `devices/{id}/calls/action` and `users/{id}/calls/action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub call_id: String,
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// `devices/{deviceID}/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// `system/{messageType}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    pub message_type: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerAction {
    Cancelled,
    Hangup,
}

impl CallerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerAction::Cancelled => "cancelled",
            CallerAction::Hangup => "hangup",
        }
    }
}

impl FromStr for CallerAction {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancelled" => Ok(CallerAction::Cancelled),
            "hangup" => Ok(CallerAction::Hangup),
            other => Err(SignalingError::UnsupportedAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeAction {
    Rejected,
    Answered,
    Hangup,
    Timeout,
}

impl CalleeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalleeAction::Rejected => "rejected",
            CalleeAction::Answered => "answered",
            CalleeAction::Hangup => "hangup",
            CalleeAction::Timeout => "timeout",
        }
    }

    /// Everything except `answered` closes the call.
    pub fn ends_call(&self) -> bool {
        !matches!(self, CalleeAction::Answered)
    }
}

impl FromStr for CalleeAction {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rejected" => Ok(CalleeAction::Rejected),
            "answered" => Ok(CalleeAction::Answered),
            "hangup" => Ok(CalleeAction::Hangup),
            "timeout" => Ok(CalleeAction::Timeout),
            other => Err(SignalingError::UnsupportedAction(other.to_string())),
        }
    }
}
