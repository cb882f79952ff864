use crate::state::SourceArtifact;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Envelope types the client itself understands. Anything else is passed
/// through to the consumer untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ClientRegister,
    Ping,
    Pong,
    Update,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ClientRegister => "client_register",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Update => "update",
            MessageKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_register" => Some(MessageKind::ClientRegister),
            "ping" => Some(MessageKind::Ping),
            "pong" => Some(MessageKind::Pong),
            "update" => Some(MessageKind::Update),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// The versioned wire envelope. The payload is owned by whoever produced
/// the message type; the client only looks inside the kinds listed in
/// [`MessageKind`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub client_id: String,
    pub platform: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        message_type: impl Into<String>,
        client_id: impl Into<String>,
        platform: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            client_id: client_id.into(),
            platform: platform.into(),
            payload,
        }
    }

    /// Create a liveness probe
    pub fn new_ping(client_id: &str, platform: &str, nonce: u64) -> Self {
        let payload = HeartbeatPayload {
            nonce,
            timestamp: Utc::now(),
        };
        Self::new(
            MessageKind::Ping.as_str(),
            client_id,
            platform,
            json!(payload),
        )
    }

    /// Create the acknowledgment for a probe carrying `nonce`
    pub fn new_pong(client_id: &str, platform: &str, nonce: u64) -> Self {
        let payload = HeartbeatPayload {
            nonce,
            timestamp: Utc::now(),
        };
        Self::new(
            MessageKind::Pong.as_str(),
            client_id,
            platform,
            json!(payload),
        )
    }

    /// Create the handshake message
    pub fn new_register(
        client_id: &str,
        platform: &str,
        registration: &ClientRegistration,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            MessageKind::ClientRegister.as_str(),
            client_id,
            platform,
            serde_json::to_value(registration)?,
        ))
    }

    /// The well-known kind of this envelope, if any
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.message_type)
    }

    pub fn is_ping(&self) -> bool {
        self.kind() == Some(MessageKind::Ping)
    }

    pub fn is_pong(&self) -> bool {
        self.kind() == Some(MessageKind::Pong)
    }

    /// Nonce of a ping/pong payload
    pub fn nonce(&self) -> Option<u64> {
        self.payload.get("nonce").and_then(Value::as_u64)
    }

    /// Decode the payload into a concrete type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Payload of `ping` and `pong`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HeartbeatPayload {
    pub nonce: u64,
    pub timestamp: DateTime<Utc>,
}

/// Static facts about the device running the client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

/// Payload of `client_register`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_name: String,
    pub capabilities: Vec<String>,
    pub device: DeviceInfo,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Payload of `update`: the artifact the new layout came from plus the
/// application payload, which the client does not interpret.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdatePayload {
    pub source: SourceArtifact,
    #[serde(default)]
    pub content: Value,
}

/// Payload of a server-sent `error`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerErrorPayload {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    /// Overrides the default recoverability of server errors when present
    #[serde(default)]
    pub recoverable: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_field_names() {
        let envelope = Envelope::new("custom", "client-1", "linux", json!({"a": 1}));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "custom");
        assert_eq!(value["clientId"], "client-1");
        assert_eq!(value["platform"], "linux");
        assert_eq!(value["payload"]["a"], 1);
    }

    #[test]
    fn test_ping_pong_nonce() {
        let ping = Envelope::new_ping("c", "linux", 42);
        assert!(ping.is_ping());
        assert!(!ping.is_pong());
        assert_eq!(ping.nonce(), Some(42));

        let pong = Envelope::new_pong("c", "linux", 42);
        assert!(pong.is_pong());
        assert_eq!(pong.kind(), Some(MessageKind::Pong));
        assert_eq!(pong.nonce(), Some(42));
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let raw = r#"{"type":"fileChanged","clientId":"x","platform":"ios","payload":{"path":"a"}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind(), None);
        assert_eq!(envelope.message_type, "fileChanged");
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let raw = r#"{"type":"ping","clientId":"x","platform":"ios"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(envelope.payload.is_null());
        assert_eq!(envelope.nonce(), None);
    }

    #[test]
    fn test_server_error_payload() {
        let envelope = Envelope::new(
            "error",
            "server",
            "server",
            json!({"code": "E42", "message": "boom", "recoverable": false}),
        );
        let payload: ServerErrorPayload = envelope.parse_payload().unwrap();
        assert_eq!(payload.code.as_deref(), Some("E42"));
        assert_eq!(payload.recoverable, Some(false));
    }
}
