//! Minimal wire model for the gateway protocol.
//!
//! Only what the connection layer itself needs: control opcodes, the payload
//! envelope, the handshake bodies, and close-code classification. Everything
//! else in a dispatch frame is passed through untouched.

use crate::config::GatewayConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Gateway protocol version appended to the connect URL.
pub const GATEWAY_VERSION: u8 = 10;

/// Gateway control opcodes.
pub mod opcodes {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// The payload envelope every gateway frame uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Body of the server's initial hello frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The slice of the READY dispatch the connection layer cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Build an identify payload for `shard_id` of `total` shards.
pub fn identify(config: &GatewayConfig, shard_id: u16, total: u16) -> GatewayPayload {
    GatewayPayload {
        op: opcodes::IDENTIFY,
        d: json!({
            "token": config.token,
            "intents": config.intents,
            "compress": config.compress.is_some(),
            "large_threshold": config.large_threshold,
            "presence": config.presence,
            "properties": config.connection_properties,
            "shard": [shard_id, total],
        }),
        s: None,
        t: None,
    }
}

/// Build a resume payload replaying from `sequence`.
pub fn resume(token: &str, session_id: &str, sequence: u64) -> GatewayPayload {
    GatewayPayload {
        op: opcodes::RESUME,
        d: json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }),
        s: None,
        t: None,
    }
}

/// Build a heartbeat carrying the last-seen sequence.
pub fn heartbeat(sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload {
        op: opcodes::HEARTBEAT,
        d: sequence.map_or(serde_json::Value::Null, |s| json!(s)),
        s: None,
        t: None,
    }
}

/// What the reconnection policy should do with a given close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Session may be resumed
    Resume,
    /// Session is dead; reconnect with a fresh identify
    Reidentify,
    /// Programmer or authorization error; do not reconnect
    Fatal,
}

/// Classify a server close code.
///
/// Unknown codes are treated as resumable so transient server hiccups route
/// through the normal resume path.
pub fn close_policy(code: u16) -> ClosePolicy {
    match code {
        // authentication failed, invalid shard, sharding required,
        // invalid API version, invalid intents, disallowed intents
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => ClosePolicy::Fatal,
        // invalid sequence, session timed out
        4007 | 4009 => ClosePolicy::Reidentify,
        _ => ClosePolicy::Resume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::intents::bits;

    #[test]
    fn test_payload_roundtrip() {
        let raw = r#"{"op":0,"d":{"a":1},"s":42,"t":"MESSAGE_CREATE"}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.op, opcodes::DISPATCH);
        assert_eq!(payload.s, Some(42));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn test_payload_missing_optionals() {
        let raw = r#"{"op":11}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.op, opcodes::HEARTBEAT_ACK);
        assert!(payload.s.is_none());
        assert!(payload.t.is_none());
        assert!(payload.d.is_null());
    }

    #[test]
    fn test_hello_parsing() {
        let raw = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).unwrap();
        let hello: Hello = serde_json::from_value(payload.d).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn test_identify_shape() {
        let config = GatewayConfig::builder("secret")
            .intents(crate::intents::IntentsInput::Bits(bits::GUILDS))
            .build()
            .unwrap();
        let payload = identify(&config, 3, 8);
        assert_eq!(payload.op, opcodes::IDENTIFY);
        assert_eq!(payload.d["token"], "secret");
        assert_eq!(payload.d["intents"], bits::GUILDS);
        assert_eq!(payload.d["compress"], false);
        assert_eq!(payload.d["shard"][0], 3);
        assert_eq!(payload.d["shard"][1], 8);
    }

    #[test]
    fn test_resume_shape() {
        let payload = resume("secret", "abc123", 512);
        assert_eq!(payload.op, opcodes::RESUME);
        assert_eq!(payload.d["session_id"], "abc123");
        assert_eq!(payload.d["seq"], 512);
    }

    #[test]
    fn test_heartbeat_sequence() {
        assert_eq!(heartbeat(Some(7)).d, serde_json::json!(7));
        assert!(heartbeat(None).d.is_null());
    }

    #[test]
    fn test_close_policy() {
        assert_eq!(close_policy(4004), ClosePolicy::Fatal);
        assert_eq!(close_policy(4014), ClosePolicy::Fatal);
        assert_eq!(close_policy(4007), ClosePolicy::Reidentify);
        assert_eq!(close_policy(4009), ClosePolicy::Reidentify);
        assert_eq!(close_policy(1006), ClosePolicy::Resume);
        assert_eq!(close_policy(4000), ClosePolicy::Resume);
    }
}
