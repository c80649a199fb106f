use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "0.1";

pub const MSG_PING: &str = "ping";
pub const MSG_SHUTDOWN: &str = "shutdown";

pub const MSG_SEND: &str = "mail.send";
pub const MSG_WATCH: &str = "mail.watch";
pub const MSG_UNWATCH: &str = "mail.unwatch";
pub const MSG_RELAY: &str = "mail.relay";

pub const MSG_AGENT_REGISTER: &str = "agent.register";
pub const MSG_AGENT_LIST: &str = "agent.list";

pub const EVT_MESSAGE: &str = "mail.message";
pub const EVT_ERROR: &str = "mail.error";
pub const EVT_HEARTBEAT: &str = "heartbeat";

pub const RELAY_MODE: &str = "relay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub payload: Value,
}

/// Push frame sent while a watch or relay stream is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub version: String,
    pub protocol: String,
    pub pid: u32,
    pub started_at_ms: u64,
    pub uptime_ms: u64,
    #[serde(default)]
    pub project_id: String,
}

/// Wire form of a stored message. `time` is RFC 3339; a string `body` is
/// plain text, any other JSON value is a structured body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub from: String,
    pub to: String,
    pub time: String,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Sender's host, recorded in the agent registry.
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WatchRequest {
    /// Identity of the watching agent; owns its DM mailbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Topic name, `@agent`, or empty / `*` for the agent's inbox plus all topics.
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_time: Option<String>,
    #[serde(default)]
    pub allow_dm: bool,
    /// Watching agent's host, recorded in the agent registry.
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub mode: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub msg: MessageInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub now_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub host: String,
    pub first_seen: String,
    pub last_seen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request {
            r#type: MSG_PING.to_owned(),
            id: "req-1".to_owned(),
            payload: Value::Null,
        };

        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn error_response_shape() {
        let resp = Response {
            r#type: MSG_SEND.to_owned(),
            id: "req-1".to_owned(),
            success: false,
            error: Some(ErrorInfo {
                code: "size_limit_exceeded".to_owned(),
                message: "too big".to_owned(),
                retryable: false,
            }),
            payload: Value::Null,
        };

        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["code"], "size_limit_exceeded");
        assert_eq!(v["error"]["retryable"], false);

        let back: Response = serde_json::from_value(v).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"type":"ping","id":"x","payload":{},"extra":123}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.r#type, "ping");
        assert_eq!(req.id, "x");
    }

    #[test]
    fn missing_fields_default() {
        let raw = r#"{"type":"ping"}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.id, "");
        assert_eq!(req.payload, Value::Null);

        let watch: WatchRequest = serde_json::from_str(r#"{"target":"task"}"#).unwrap();
        assert_eq!(watch.target, "task");
        assert!(watch.since_id.is_none());
        assert!(!watch.allow_dm);
    }

    #[test]
    fn push_frame_wraps_message() {
        let evt = MessageEvent {
            msg: MessageInfo {
                id: "20260209-080000-0001".to_owned(),
                from: "alice".to_owned(),
                to: "task".to_owned(),
                time: "2026-02-09T08:00:00Z".to_owned(),
                body: Value::String("hello".to_owned()),
                reply_to: None,
                priority: None,
            },
        };
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v["msg"]["body"], "hello");
        assert!(v["msg"].get("reply_to").is_none());
    }
}
