// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a client reads from the challenge characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    /// Issuance time of the live nonce, in milliseconds since the epoch.
    #[serde(rename = "timestamp")]
    pub issued_at_ms: i64,
    #[serde(rename = "computerName")]
    pub host_label: String,
}

/// The exact payload a client signs. The timestamp is the client's clock at
/// signing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignableMessage {
    pub nonce: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

impl SignableMessage {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Auth characteristic write. `signed_payload` is base64 of
/// `signature (64 bytes) || message bytes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "signedNonce")]
    pub signed_payload: String,
    #[serde(rename = "publicKey")]
    pub public_key_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub device_id: String,
    #[serde(rename = "publicKey")]
    pub public_key_b64: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// A trusted device. Only ever created by an operator copying a record into
/// the trusted store; the protocol never writes one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    #[serde(rename = "publicKey")]
    pub public_key_b64: String,
    #[serde(rename = "name", alias = "deviceName", alias = "label", default = "unknown_label")]
    pub label: String,
    #[serde(
        rename = "registeredAt",
        alias = "capturedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub registered_at: Option<DateTime<Utc>>,
}

/// A key written during registration mode, waiting for manual approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedKey {
    pub device_id: String,
    #[serde(rename = "publicKey")]
    pub public_key_b64: String,
    #[serde(rename = "deviceName")]
    pub label: String,
    pub captured_at: DateTime<Utc>,
}

fn unknown_label() -> String {
    UNKNOWN_DEVICE.to_string()
}

pub const UNKNOWN_DEVICE: &str = "Unknown Device";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn challenge_uses_client_field_names() {
        let c = Challenge {
            nonce: "abc".into(),
            issued_at_ms: 42,
            host_label: "deck".into(),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v, json!({"nonce": "abc", "timestamp": 42, "computerName": "deck"}));
    }

    #[test]
    fn staged_capture_file_parses_as_trusted_record() {
        let staged = json!({
            "deviceId": "phone-1",
            "publicKey": "AAAA",
            "deviceName": "Pixel",
            "capturedAt": "2024-05-01T10:00:00Z"
        });
        let dev: RegisteredDevice = serde_json::from_value(staged).unwrap();
        assert_eq!(dev.label, "Pixel");
        assert_eq!(dev.public_key_b64, "AAAA");
        assert!(dev.registered_at.is_some());
    }

    #[test]
    fn register_request_name_is_optional() {
        let r: RegisterRequest =
            serde_json::from_value(json!({"deviceId": "x", "publicKey": "k"})).unwrap();
        assert!(r.device_name.is_none());
    }
}
