//! In-process radio. Acts as both ends of the link: the server publishes into
//! it, and tests (or a dry run) read and write characteristics as a client.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{dispatch_read, dispatch_write, AttError, GattHandler, Radio};
use crate::error::Result;

#[derive(Default)]
struct SimState {
    advertising: Option<String>,
    handler: Option<Arc<dyn GattHandler>>,
    starts: usize,
}

#[derive(Default)]
pub struct SimulatedRadio {
    state: Mutex<SimState>,
}

impl SimulatedRadio {
    pub fn is_advertising(&self) -> bool {
        self.state.lock().advertising.is_some()
    }

    pub fn local_name(&self) -> Option<String> {
        self.state.lock().advertising.clone()
    }

    /// How many times advertising went from off to on.
    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }

    fn handler(&self) -> Result<Arc<dyn GattHandler>, AttError> {
        self.state
            .lock()
            .handler
            .clone()
            .ok_or(AttError::AttributeNotFound)
    }

    pub async fn read(&self, characteristic: Uuid, offset: usize) -> Result<Vec<u8>, AttError> {
        let handler = self.handler()?;
        dispatch_read(handler.as_ref(), characteristic, offset).await
    }

    pub async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), AttError> {
        let handler = self.handler()?;
        dispatch_write(handler.as_ref(), characteristic, data).await
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn start_advertising(&self, local_name: &str) -> Result<()> {
        let mut st = self.state.lock();
        if st.advertising.is_none() {
            st.starts += 1;
        }
        st.advertising = Some(local_name.to_string());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.state.lock().advertising = None;
        Ok(())
    }

    async fn publish(&self, handler: Arc<dyn GattHandler>) -> Result<()> {
        self.state.lock().handler = Some(handler);
        Ok(())
    }

    async fn unpublish(&self) -> Result<()> {
        self.state.lock().handler = None;
        Ok(())
    }
}
