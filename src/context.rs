use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::AuthService;
use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;
use crate::session::RegistrationWindow;
use crate::types::{AuthRequest, Challenge, RegisterRequest, UNKNOWN_DEVICE};
use crate::unlock::Unlocker;

/// Verification succeeded; `unlock` reports separately whether the unlock
/// sequence could be started.
#[derive(Debug)]
pub struct AuthOutcome {
    pub device_label: String,
    pub unlock: Result<()>,
}

/// Everything a transport needs to answer the three remote operations.
/// Built once at start-up and shared by the local GATT surface and the relay
/// verifier.
pub struct ServerContext {
    pub auth: Arc<AuthService>,
    pub registry: Arc<DeviceRegistry>,
    pub unlocker: Arc<dyn Unlocker>,
    pub registration: Arc<RegistrationWindow>,
}

impl ServerContext {
    pub fn challenge(&self) -> Challenge {
        let c = self.auth.generate_challenge();
        info!(nonce = %c.nonce.chars().take(16).collect::<String>(), "challenge issued");
        c
    }

    pub async fn authenticate(&self, req: &AuthRequest) -> Result<AuthOutcome> {
        info!("authentication attempt received");
        let verified = self.auth.verify(req).map_err(|e| {
            warn!("authentication failed: {e}");
            Error::from(e)
        })?;
        info!(device = %verified.device_label, "authentication successful, triggering login");

        let unlock = self.unlocker.trigger_login().await;
        if let Err(e) = &unlock {
            error!("unlock failed after successful authentication: {e}");
        }
        Ok(AuthOutcome {
            device_label: verified.device_label,
            unlock,
        })
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<PathBuf> {
        let label = req.device_name.as_deref().unwrap_or(UNKNOWN_DEVICE);
        if !self.registration.is_active() {
            warn!(device = %label, "registration attempted outside registration mode");
            return Err(Error::RegistrationModeDisabled);
        }
        info!(device = %label, id = %req.device_id, "registration request");
        self.registry
            .stage_captured(&req.device_id, &req.public_key_b64, label)
            .await
            .map_err(|e| {
                error!("registration error: {e}");
                e
            })
    }
}
