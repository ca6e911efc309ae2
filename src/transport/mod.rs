//! GATT-style peripheral surface.
//!
//! Three characteristics: challenge (read), auth (write), register (write).
//! Nothing ties a challenge read to a later auth write except the nonce; the
//! radio may reconnect between the two.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ServerContext;
use crate::error::Result;
use crate::types::{AuthRequest, RegisterRequest};

pub const SERVICE_UUID: Uuid = bluetooth_uuid(0xcd10);
pub const CHALLENGE_CHAR_UUID: Uuid = bluetooth_uuid(0xcd11);
pub const AUTH_CHAR_UUID: Uuid = bluetooth_uuid(0xcd12);
pub const REGISTER_CHAR_UUID: Uuid = bluetooth_uuid(0xcd13);

/// Advertised names are cut to fit the advertisement payload.
pub const MAX_LOCAL_NAME: usize = 20;

/// 16-bit UUID expanded onto the Bluetooth base UUID.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// What the remote side sees. Deliberately carries no detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttError {
    #[error("unlikely error")]
    UnlikelyError,
    #[error("attribute not found")]
    AttributeNotFound,
    #[error("invalid offset")]
    InvalidOffset,
}

#[async_trait]
pub trait GattHandler: Send + Sync {
    async fn read_challenge(&self) -> Result<Vec<u8>, AttError>;
    async fn write_auth(&self, data: &[u8]) -> Result<(), AttError>;
    async fn write_register(&self, data: &[u8]) -> Result<(), AttError>;
}

/// Routes a characteristic read, honouring the long-read offset.
pub async fn dispatch_read(
    handler: &dyn GattHandler,
    characteristic: Uuid,
    offset: usize,
) -> Result<Vec<u8>, AttError> {
    if characteristic != CHALLENGE_CHAR_UUID {
        return Err(AttError::AttributeNotFound);
    }
    let value = handler.read_challenge().await?;
    if offset > value.len() {
        return Err(AttError::InvalidOffset);
    }
    Ok(value[offset..].to_vec())
}

pub async fn dispatch_write(
    handler: &dyn GattHandler,
    characteristic: Uuid,
    data: &[u8],
) -> Result<(), AttError> {
    match characteristic {
        c if c == AUTH_CHAR_UUID => handler.write_auth(data).await,
        c if c == REGISTER_CHAR_UUID => handler.write_register(data).await,
        _ => Err(AttError::AttributeNotFound),
    }
}

/// A radio stack able to advertise and publish the service.
#[async_trait]
pub trait Radio: Send + Sync {
    async fn start_advertising(&self, local_name: &str) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;
    async fn publish(&self, handler: Arc<dyn GattHandler>) -> Result<()>;
    async fn unpublish(&self) -> Result<()>;
}

/// Radio + handler pair toggled as one unit by the orchestrator.
pub struct Peripheral {
    radio: Arc<dyn Radio>,
    handler: Arc<dyn GattHandler>,
    local_name: String,
}

impl Peripheral {
    pub fn new(radio: Arc<dyn Radio>, handler: Arc<dyn GattHandler>, local_name: &str) -> Self {
        Self {
            radio,
            handler,
            local_name: local_name.chars().take(MAX_LOCAL_NAME).collect(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.radio.start_advertising(&self.local_name).await?;
        self.radio.publish(self.handler.clone()).await?;
        info!(name = %self.local_name, "advertising started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.radio.stop_advertising().await?;
        self.radio.unpublish().await?;
        info!("advertising stopped");
        Ok(())
    }
}

/// Characteristics served straight from the local [`ServerContext`].
pub struct LocalGatt {
    ctx: Arc<ServerContext>,
}

impl LocalGatt {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl GattHandler for LocalGatt {
    async fn read_challenge(&self) -> Result<Vec<u8>, AttError> {
        let challenge = self.ctx.challenge();
        serde_json::to_vec(&challenge).map_err(|e| {
            error!("error serialising challenge: {e}");
            AttError::UnlikelyError
        })
    }

    async fn write_auth(&self, data: &[u8]) -> Result<(), AttError> {
        let req: AuthRequest = serde_json::from_slice(data).map_err(|e| {
            warn!("unparseable auth write: {e}");
            AttError::UnlikelyError
        })?;
        match self.ctx.authenticate(&req).await {
            Ok(outcome) if outcome.unlock.is_ok() => Ok(()),
            _ => Err(AttError::UnlikelyError),
        }
    }

    async fn write_register(&self, data: &[u8]) -> Result<(), AttError> {
        let req: RegisterRequest = serde_json::from_slice(data).map_err(|e| {
            warn!("unparseable registration write: {e}");
            AttError::UnlikelyError
        })?;
        self.ctx
            .register(&req)
            .await
            .map(|_| ())
            .map_err(|_| AttError::UnlikelyError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuids_expand_onto_base() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000cd10-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            REGISTER_CHAR_UUID.to_string(),
            "0000cd13-0000-1000-8000-00805f9b34fb"
        );
    }

    struct Fixed;

    #[async_trait]
    impl GattHandler for Fixed {
        async fn read_challenge(&self) -> Result<Vec<u8>, AttError> {
            Ok(b"0123456789".to_vec())
        }
        async fn write_auth(&self, _: &[u8]) -> Result<(), AttError> {
            Ok(())
        }
        async fn write_register(&self, _: &[u8]) -> Result<(), AttError> {
            Err(AttError::UnlikelyError)
        }
    }

    #[tokio::test]
    async fn reads_honour_offset() {
        assert_eq!(dispatch_read(&Fixed, CHALLENGE_CHAR_UUID, 4).await.unwrap(), b"456789");
        assert_eq!(
            dispatch_read(&Fixed, CHALLENGE_CHAR_UUID, 11).await,
            Err(AttError::InvalidOffset)
        );
        assert_eq!(
            dispatch_read(&Fixed, AUTH_CHAR_UUID, 0).await,
            Err(AttError::AttributeNotFound)
        );
    }

    #[tokio::test]
    async fn writes_route_by_characteristic() {
        assert!(dispatch_write(&Fixed, AUTH_CHAR_UUID, b"x").await.is_ok());
        assert!(dispatch_write(&Fixed, REGISTER_CHAR_UUID, b"x").await.is_err());
        assert_eq!(
            dispatch_write(&Fixed, CHALLENGE_CHAR_UUID, b"x").await,
            Err(AttError::AttributeNotFound)
        );
    }
}
