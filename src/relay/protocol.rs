//! JSON messages exchanged between the radio host and the verifier host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Challenge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    GetChallenge,
    Authenticate,
    Register,
    Ping,
}

impl RelayAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayAction::GetChallenge => "getChallenge",
            RelayAction::Authenticate => "authenticate",
            RelayAction::Register => "register",
            RelayAction::Ping => "ping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "getChallenge" => RelayAction::GetChallenge,
            "authenticate" => RelayAction::Authenticate,
            "register" => RelayAction::Register,
            "ping" => RelayAction::Ping,
            _ => return None,
        })
    }
}

/// `{id, action, data}`. The id is echoed back untouched, so any JSON value
/// is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    #[serde(default)]
    pub id: Value,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<Challenge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<bool>,
}

impl RelayResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = id;
        self
    }
}

/// Unsolicited messages from the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notice {
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RegistrationMode {
        enabled: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Notice(Notice),
    Response(RelayResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_distinguishes_notices_from_responses() {
        let n: Inbound = serde_json::from_value(json!({"type": "registrationMode", "enabled": true})).unwrap();
        assert!(matches!(n, Inbound::Notice(Notice::RegistrationMode { enabled: true })));

        let c: Inbound =
            serde_json::from_value(json!({"type": "connected", "message": "Server ready"})).unwrap();
        assert!(matches!(c, Inbound::Notice(Notice::Connected { .. })));

        let r: Inbound =
            serde_json::from_value(json!({"id": 4, "success": true, "deviceName": "Watch"})).unwrap();
        match r {
            Inbound::Response(r) => {
                assert_eq!(r.id, json!(4));
                assert_eq!(r.device_name.as_deref(), Some("Watch"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn response_omits_empty_fields() {
        let v = serde_json::to_value(RelayResponse::failure("Unknown action").with_id(json!(9))).unwrap();
        assert_eq!(v, json!({"id": 9, "success": false, "error": "Unknown action"}));
    }

    #[test]
    fn actions_round_trip_by_name() {
        for a in [
            RelayAction::GetChallenge,
            RelayAction::Authenticate,
            RelayAction::Register,
            RelayAction::Ping,
        ] {
            assert_eq!(RelayAction::parse(a.as_str()), Some(a));
        }
        assert_eq!(RelayAction::parse("reboot"), None);
    }
}
