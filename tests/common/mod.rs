#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};

use cyberdeck_login::auth::AuthService;
use cyberdeck_login::context::ServerContext;
use cyberdeck_login::lock_monitor::LockProbe;
use cyberdeck_login::nonce::NonceManager;
use cyberdeck_login::registry::DeviceRegistry;
use cyberdeck_login::session::RegistrationWindow;
use cyberdeck_login::types::{Challenge, RegisteredDevice, SignableMessage};
use cyberdeck_login::unlock::Unlocker;
use cyberdeck_login::Result;

#[derive(Default)]
pub struct CountingUnlocker {
    calls: AtomicUsize,
}

impl CountingUnlocker {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Unlocker for CountingUnlocker {
    async fn trigger_login(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeLock(pub AtomicBool);

impl FakeLock {
    pub fn set(&self, locked: bool) {
        self.0.store(locked, Ordering::SeqCst);
    }
}

#[async_trait]
impl LockProbe for FakeLock {
    async fn is_locked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub ctx: Arc<ServerContext>,
    pub registry: Arc<DeviceRegistry>,
    pub unlocker: Arc<CountingUnlocker>,
    pub key: SigningKey,
    pub dir: tempfile::TempDir,
}

pub fn device_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn public_key_b64(key: &SigningKey) -> String {
    B64.encode(key.verifying_key().as_bytes())
}

/// Context with one trusted device ("Test Phone") and a counting unlocker.
pub async fn harness(registration: Arc<RegistrationWindow>) -> Harness {
    let key = device_key();
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(DeviceRegistry::new(
        vec![RegisteredDevice {
            public_key_b64: public_key_b64(&key),
            label: "Test Phone".into(),
            registered_at: None,
        }],
        dir.path().join("trustedKeys"),
        dir.path().join("publicKeys"),
    ));
    registry.load().await.unwrap();

    let nonces = Arc::new(NonceManager::new(Duration::from_secs(30)));
    let unlocker = Arc::new(CountingUnlocker::default());
    let ctx = Arc::new(ServerContext {
        auth: Arc::new(AuthService::new(nonces, registry.clone(), "deck")),
        registry: registry.clone(),
        unlocker: unlocker.clone(),
        registration,
    });
    Harness {
        ctx,
        registry,
        unlocker,
        key,
        dir,
    }
}

/// Builds the auth write body a phone would send for `challenge`.
pub fn auth_body(key: &SigningKey, challenge: &Challenge) -> Value {
    let msg = SignableMessage {
        nonce: challenge.nonce.clone(),
        timestamp_ms: Utc::now().timestamp_millis(),
    }
    .to_bytes()
    .unwrap();
    let mut combined = key.sign(&msg).to_bytes().to_vec();
    combined.extend_from_slice(&msg);
    json!({
        "signedNonce": B64.encode(combined),
        "publicKey": public_key_b64(key),
    })
}

pub fn register_body(key: &SigningKey, device_id: &str, name: &str) -> Value {
    json!({
        "deviceId": device_id,
        "publicKey": public_key_b64(key),
        "deviceName": name,
    })
}
