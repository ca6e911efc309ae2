use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::AuthError;
use crate::nonce::NonceManager;
use crate::registry::DeviceRegistry;
use crate::types::{AuthRequest, Challenge, SignableMessage};

/// Allowed distance between the signer's clock and ours.
pub const MAX_CLOCK_SKEW_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub device_label: String,
}

/// Issues challenges and checks signed responses.
#[derive(Debug)]
pub struct AuthService {
    nonces: Arc<NonceManager>,
    registry: Arc<DeviceRegistry>,
    host_label: String,
    /// Serialises verify -> consume -> rotate.
    verify_lock: Mutex<()>,
}

impl AuthService {
    pub fn new(
        nonces: Arc<NonceManager>,
        registry: Arc<DeviceRegistry>,
        host_label: impl Into<String>,
    ) -> Self {
        Self {
            nonces,
            registry,
            host_label: host_label.into(),
            verify_lock: Mutex::new(()),
        }
    }

    pub fn nonces(&self) -> &Arc<NonceManager> {
        &self.nonces
    }

    pub fn generate_challenge(&self) -> Challenge {
        let nonce = self.nonces.current();
        Challenge {
            nonce: nonce.value,
            issued_at_ms: nonce.issued_at_ms,
            host_label: self.host_label.clone(),
        }
    }

    /// The nonce is only consumed once the signature has verified, so a
    /// forged write cannot burn a live nonce.
    pub fn verify(&self, req: &AuthRequest) -> Result<Verified, AuthError> {
        let _guard = self.verify_lock.lock();

        let device = self
            .registry
            .find_by_public_key(&req.public_key_b64)
            .ok_or(AuthError::UnregisteredKey)?;

        let message = open_signed(&req.signed_payload, &req.public_key_b64)?;

        let signed: SignableMessage =
            serde_json::from_slice(&message).map_err(|_| AuthError::MalformedMessage)?;

        if !self.nonces.validate_and_consume(&signed.nonce) {
            return Err(AuthError::InvalidOrExpiredNonce);
        }

        // checked after consumption: a stale but correctly signed response
        // still burns its nonce
        let skew = Utc::now().timestamp_millis().abs_diff(signed.timestamp_ms);
        if skew > MAX_CLOCK_SKEW_MS {
            warn!(skew_ms = skew, "signed timestamp outside window");
            return Err(AuthError::TimestampOutOfRange);
        }

        Ok(Verified {
            device_label: device.label,
        })
    }
}

/// Splits `signature || message`, verifies it and returns the message.
fn open_signed(signed_b64: &str, public_key_b64: &str) -> Result<Vec<u8>, AuthError> {
    use core::convert::TryFrom;

    let mut combined = B64.decode(signed_b64).map_err(|_| AuthError::InvalidSignature)?;
    if combined.len() < SIGNATURE_LENGTH {
        return Err(AuthError::InvalidSignature);
    }
    let message = combined.split_off(SIGNATURE_LENGTH);
    let sig = Signature::from_slice(&combined).map_err(|_| AuthError::InvalidSignature)?;

    let vk_bytes = B64.decode(public_key_b64).map_err(|_| AuthError::InvalidSignature)?;
    let vk = VerifyingKey::try_from(&vk_bytes[..]).map_err(|_| AuthError::InvalidSignature)?;
    vk.verify(&message, &sig)
        .map_err(|_| AuthError::InvalidSignature)?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegisteredDevice;
    use ed25519_dalek::{Signer, SigningKey};
    use std::time::Duration;

    struct Fixture {
        auth: AuthService,
        key: SigningKey,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(
            vec![RegisteredDevice {
                public_key_b64: B64.encode(key.verifying_key().as_bytes()),
                label: "iPhone".into(),
                registered_at: None,
            }],
            dir.path().join("trusted"),
            dir.path().join("staged"),
        );
        let nonces = Arc::new(NonceManager::new(Duration::from_secs(30)));
        Fixture {
            auth: AuthService::new(nonces, Arc::new(registry), "deck"),
            key,
            _dir: dir,
        }
    }

    fn sign(key: &SigningKey, nonce: &str, timestamp_ms: i64) -> AuthRequest {
        let msg = SignableMessage {
            nonce: nonce.to_string(),
            timestamp_ms,
        }
        .to_bytes()
        .unwrap();
        let mut combined = key.sign(&msg).to_bytes().to_vec();
        combined.extend_from_slice(&msg);
        AuthRequest {
            signed_payload: B64.encode(combined),
            public_key_b64: B64.encode(key.verifying_key().as_bytes()),
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn challenge_carries_live_nonce_and_label() {
        let f = fixture();
        let c = f.auth.generate_challenge();
        assert_eq!(c.nonce, f.auth.nonces().current().value);
        assert_eq!(c.host_label, "deck");
    }

    #[test]
    fn valid_response_verifies_once() {
        let f = fixture();
        let c = f.auth.generate_challenge();
        let req = sign(&f.key, &c.nonce, now());
        assert_eq!(f.auth.verify(&req).unwrap().device_label, "iPhone");
        assert_eq!(f.auth.verify(&req), Err(AuthError::InvalidOrExpiredNonce));
    }

    #[test]
    fn unregistered_key_touches_no_nonce() {
        let f = fixture();
        let stranger = SigningKey::from_bytes(&[9u8; 32]);
        let c = f.auth.generate_challenge();
        let req = sign(&stranger, &c.nonce, now());
        assert_eq!(f.auth.verify(&req), Err(AuthError::UnregisteredKey));
        assert_eq!(f.auth.nonces().consumed_len(), 0);
        assert_eq!(f.auth.nonces().current().value, c.nonce);
    }

    #[test]
    fn forged_signature_does_not_burn_nonce() {
        let f = fixture();
        let c = f.auth.generate_challenge();
        let mut req = sign(&f.key, &c.nonce, now());
        let mut raw = B64.decode(&req.signed_payload).unwrap();
        raw[3] ^= 0xff;
        req.signed_payload = B64.encode(raw);
        assert_eq!(f.auth.verify(&req), Err(AuthError::InvalidSignature));

        let good = sign(&f.key, &c.nonce, now());
        assert!(f.auth.verify(&good).is_ok());
    }

    #[test]
    fn short_or_undecodable_payload_is_invalid_signature() {
        let f = fixture();
        let mut req = sign(&f.key, "x", now());
        req.signed_payload = B64.encode([0u8; 10]);
        assert_eq!(f.auth.verify(&req), Err(AuthError::InvalidSignature));
        req.signed_payload = "***".into();
        assert_eq!(f.auth.verify(&req), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn signed_garbage_is_malformed() {
        let f = fixture();
        let msg = b"not json".to_vec();
        let mut combined = f.key.sign(&msg).to_bytes().to_vec();
        combined.extend_from_slice(&msg);
        let req = AuthRequest {
            signed_payload: B64.encode(combined),
            public_key_b64: B64.encode(f.key.verifying_key().as_bytes()),
        };
        assert_eq!(f.auth.verify(&req), Err(AuthError::MalformedMessage));
        assert_eq!(f.auth.nonces().consumed_len(), 0);
    }

    #[test]
    fn stale_timestamp_fails_and_still_consumes() {
        let f = fixture();
        let c = f.auth.generate_challenge();
        let req = sign(&f.key, &c.nonce, now() - MAX_CLOCK_SKEW_MS as i64 - 5_000);
        assert_eq!(f.auth.verify(&req), Err(AuthError::TimestampOutOfRange));
        assert_eq!(f.auth.nonces().consumed_len(), 1);

        let retry = sign(&f.key, &c.nonce, now());
        assert_eq!(f.auth.verify(&retry), Err(AuthError::InvalidOrExpiredNonce));
    }

    #[test]
    fn future_timestamp_is_also_rejected() {
        let f = fixture();
        let c = f.auth.generate_challenge();
        let req = sign(&f.key, &c.nonce, now() + MAX_CLOCK_SKEW_MS as i64 + 5_000);
        assert_eq!(f.auth.verify(&req), Err(AuthError::TimestampOutOfRange));
    }

    #[test]
    fn extreme_timestamps_are_out_of_range() {
        let f = fixture();
        for ts in [i64::MIN, i64::MAX, now() - i64::MAX] {
            let c = f.auth.generate_challenge();
            let req = sign(&f.key, &c.nonce, ts);
            assert_eq!(f.auth.verify(&req), Err(AuthError::TimestampOutOfRange));
        }
    }

    #[test]
    fn previous_nonce_survives_scheduled_rotation() {
        let f = fixture();
        let c = f.auth.generate_challenge();
        f.auth.nonces().rotate();
        let req = sign(&f.key, &c.nonce, now());
        assert!(f.auth.verify(&req).is_ok());
    }
}
