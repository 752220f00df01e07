//! Bus messages: method calls, returns, errors and signals.

use serde::{Deserialize, Serialize};

use crate::codec::{Body, Value};

/// Well-known error names.
pub mod error_names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
}

pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER: &str = "org.freedesktop.DBus.Peer";

/// Source of the locally synthesized `Disconnected` signal.
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";
pub const DISCONNECTED: &str = "Disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Assigned by the transport on send.
    #[serde(default)]
    pub serial: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default)]
    pub body: Body,
}

impl Message {
    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            body: Body::default(),
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: Some(destination.to_string()),
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::empty(MessageType::Signal)
        }
    }

    /// A successful reply to `call`.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// An error reply to `call` carrying `text` as its single string argument.
    pub fn error(call: &Message, name: &str, text: &str) -> Self {
        let mut reply = Self::error_reply(call.serial, name, text);
        reply.destination = call.sender.clone();
        reply
    }

    /// An error reply addressed by serial only.
    pub fn error_reply(reply_serial: u32, name: &str, text: &str) -> Self {
        Self {
            reply_serial: Some(reply_serial),
            error_name: Some(name.to_string()),
            body: Body {
                signature: "s".to_string(),
                values: vec![Value::Str(text.to_string())],
            },
            ..Self::empty(MessageType::Error)
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Human-readable text of an error reply.
    pub fn error_text(&self) -> String {
        self.body
            .values
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// `"path:interface:member"`, the key signal handlers are stored under.
    pub fn signal_key(&self) -> String {
        signal_key(
            self.path.as_deref().unwrap_or_default(),
            self.interface.as_deref().unwrap_or_default(),
            self.member.as_deref().unwrap_or_default(),
        )
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::MethodReturn | MessageType::Error)
    }
}

pub fn signal_key(path: &str, interface: &str, member: &str) -> String {
    format!("{}:{}:{}", path, interface, member)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_addressing() {
        let mut call = Message::method_call("org.example", "/a", "org.example.I", "M");
        call.serial = 7;
        call.sender = Some(":1.3".into());

        let ret = Message::method_return(&call);
        assert_eq!(ret.kind, MessageType::MethodReturn);
        assert_eq!(ret.reply_serial, Some(7));
        assert_eq!(ret.destination.as_deref(), Some(":1.3"));

        let err = Message::error(&call, error_names::FAILED, "boom");
        assert_eq!(err.error_name.as_deref(), Some(error_names::FAILED));
        assert_eq!(err.error_text(), "boom");
        assert!(err.is_reply());
    }

    #[test]
    fn test_json_omits_absent_fields() {
        let signal = Message::signal("/a", "org.example.I", "Changed");
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"type\":\"signal\""));
        assert!(!json.contains("destination"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn test_signal_key() {
        let signal = Message::signal("/a", "org.example.I", "Changed");
        assert_eq!(signal.signal_key(), "/a:org.example.I:Changed");
    }
}
