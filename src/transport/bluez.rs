//! BlueZ backend over D-Bus via `bluer`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    dispatch_read, dispatch_write, AttError, GattHandler, Radio, AUTH_CHAR_UUID,
    CHALLENGE_CHAR_UUID, REGISTER_CHAR_UUID, SERVICE_UUID,
};
use crate::error::{Error, Result};

pub struct BluezRadio {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    application: Mutex<Option<ApplicationHandle>>,
}

fn unavailable(e: bluer::Error) -> Error {
    Error::TransportUnavailable(e.to_string())
}

fn req_error(e: AttError) -> ReqError {
    match e {
        AttError::UnlikelyError => ReqError::Failed,
        AttError::AttributeNotFound => ReqError::NotSupported,
        AttError::InvalidOffset => ReqError::InvalidOffset,
    }
}

impl BluezRadio {
    /// Powers on the default adapter.
    pub async fn open() -> Result<Self> {
        let session = bluer::Session::new().await.map_err(unavailable)?;
        let adapter = session.default_adapter().await.map_err(unavailable)?;
        adapter.set_powered(true).await.map_err(unavailable)?;
        info!(adapter = %adapter.name(), "bluetooth adapter ready");
        Ok(Self {
            _session: session,
            adapter,
            advertisement: Mutex::new(None),
            application: Mutex::new(None),
        })
    }

    fn read_characteristic(handler: &Arc<dyn GattHandler>, uuid: Uuid) -> Characteristic {
        let handler = handler.clone();
        Characteristic {
            uuid,
            read: Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req| {
                    let handler = handler.clone();
                    async move {
                        debug!(offset = req.offset, "characteristic read");
                        dispatch_read(handler.as_ref(), uuid, req.offset as usize)
                            .await
                            .map_err(req_error)
                    }
                    .boxed()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn write_characteristic(handler: &Arc<dyn GattHandler>, uuid: Uuid) -> Characteristic {
        let handler = handler.clone();
        Characteristic {
            uuid,
            write: Some(CharacteristicWrite {
                write: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                    let handler = handler.clone();
                    async move {
                        dispatch_write(handler.as_ref(), uuid, &value)
                            .await
                            .map_err(req_error)
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Radio for BluezRadio {
    async fn start_advertising(&self, local_name: &str) -> Result<()> {
        let adv = Advertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: BTreeSet::from([SERVICE_UUID]),
            local_name: Some(local_name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        let handle = self.adapter.advertise(adv).await.map_err(unavailable)?;
        *self.advertisement.lock() = Some(handle);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        // dropping the handle unregisters the advertisement
        self.advertisement.lock().take();
        Ok(())
    }

    async fn publish(&self, handler: Arc<dyn GattHandler>) -> Result<()> {
        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Self::read_characteristic(&handler, CHALLENGE_CHAR_UUID),
                    Self::write_characteristic(&handler, AUTH_CHAR_UUID),
                    Self::write_characteristic(&handler, REGISTER_CHAR_UUID),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(unavailable)?;
        *self.application.lock() = Some(handle);
        Ok(())
    }

    async fn unpublish(&self) -> Result<()> {
        self.application.lock().take();
        Ok(())
    }
}
