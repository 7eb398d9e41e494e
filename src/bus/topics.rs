// intercom-signaling-service/src/bus/topics.rs

pub const CALL_REQUEST_FILTER: &str = "calls/request/+";
pub const DEVICE_ACTION_FILTER: &str = "devices/+/calls/action";
pub const USER_ACTION_FILTER: &str = "users/+/calls/action";
pub const DEVICE_STATUS_FILTER: &str = "devices/+/status";

pub fn call_request(caller_device_id: &str) -> String {
    format!("calls/request/{}", caller_device_id)
}

pub fn incoming_call(user_id: &str) -> String {
    format!("users/{}/calls/incoming", user_id)
}

pub fn caller_control(device_id: &str) -> String {
    format!("devices/{}/calls/control", device_id)
}

pub fn callee_control(user_id: &str) -> String {
    format!("users/{}/calls/control", user_id)
}

pub fn device_status(device_id: &str) -> String {
    format!("devices/{}/status", device_id)
}

pub fn system(message_type: &str) -> String {
    format!("system/{}", message_type)
}

pub fn device_action(device_id: &str) -> String {
    format!("devices/{}/calls/action", device_id)
}

pub fn user_action(user_id: &str) -> String {
    format!("users/{}/calls/action", user_id)
}

/// Participant ids become topic levels, so they must not carry separators
/// or wildcards of either the topic or the AMQP routing-key syntax.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '@'))
}

/// `+` matches exactly one level, `#` matches the rest (including nothing).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Inbound topics the orchestrator listens on, with the sender's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    CallRequest { device_id: &'a str },
    DeviceAction { device_id: &'a str },
    UserAction { user_id: &'a str },
    DeviceStatus { device_id: &'a str },
}

impl<'a> InboundTopic<'a> {
    pub fn parse(topic: &'a str) -> Option<Self> {
        let parts: Vec<&'a str> = topic.split('/').collect();
        match parts.as_slice() {
            ["calls", "request", id] => Some(Self::CallRequest { device_id: *id }),
            ["devices", id, "calls", "action"] => Some(Self::DeviceAction { device_id: *id }),
            ["users", id, "calls", "action"] => Some(Self::UserAction { user_id: *id }),
            ["devices", id, "status"] => Some(Self::DeviceStatus { device_id: *id }),
            _ => None,
        }
    }
}
