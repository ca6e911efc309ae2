//! Advertising lifecycle driven by lock state, plus the registration window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::lock_monitor::{LockEvent, LockProbe};
use crate::transport::Peripheral;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdvertisingState {
    Idle,
    Advertising,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistrationState {
    pub active: bool,
    pub expires_at_ms: Option<i64>,
}

/// Time-boxed window during which registration writes are staged.
///
/// Only [`SessionOrchestrator`] opens and closes it; everything else gets a
/// read view and can subscribe to changes.
#[derive(Debug)]
pub struct RegistrationWindow {
    state: watch::Sender<RegistrationState>,
}

impl Default for RegistrationWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationWindow {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RegistrationState::default());
        Self { state }
    }

    /// Active and not yet past its expiry, even if the expiry timer is late.
    pub fn is_active(&self) -> bool {
        let st = *self.state.borrow();
        st.active && st.expires_at_ms.map_or(true, |t| Utc::now().timestamp_millis() < t)
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    fn open(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp_millis().saturating_add(millis);
        self.state.send_replace(RegistrationState {
            active: true,
            expires_at_ms: Some(expires),
        });
    }

    fn close(&self) {
        self.state.send_replace(RegistrationState::default());
    }
}

pub struct SessionOrchestrator {
    peripheral: Option<Peripheral>,
    probe: Option<Arc<dyn LockProbe>>,
    advertising: tokio::sync::Mutex<AdvertisingState>,
    registration: Arc<RegistrationWindow>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    /// `registration` is shared with the [`ServerContext`] the peripheral's
    /// handler answers from.
    ///
    /// [`ServerContext`]: crate::context::ServerContext
    pub fn new(
        peripheral: Peripheral,
        probe: Arc<dyn LockProbe>,
        registration: Arc<RegistrationWindow>,
    ) -> Self {
        Self {
            peripheral: Some(peripheral),
            probe: Some(probe),
            advertising: tokio::sync::Mutex::new(AdvertisingState::Idle),
            registration,
            expiry: Mutex::new(None),
        }
    }

    /// For a verifier host whose radio lives on the other side of a relay:
    /// only the registration window is managed here.
    pub fn registration_only() -> Self {
        Self {
            peripheral: None,
            probe: None,
            advertising: tokio::sync::Mutex::new(AdvertisingState::Idle),
            registration: Arc::new(RegistrationWindow::new()),
            expiry: Mutex::new(None),
        }
    }

    pub fn registration(&self) -> Arc<RegistrationWindow> {
        self.registration.clone()
    }

    pub async fn advertising_state(&self) -> AdvertisingState {
        *self.advertising.lock().await
    }

    pub async fn start_advertising(&self) -> Result<()> {
        let mut state = self.advertising.lock().await;
        if *state == AdvertisingState::Advertising {
            return Ok(());
        }
        if let Some(p) = &self.peripheral {
            p.start().await?;
        }
        *state = AdvertisingState::Advertising;
        Ok(())
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.advertising.lock().await;
        if *state == AdvertisingState::Idle {
            return Ok(());
        }
        if let Some(p) = &self.peripheral {
            p.stop().await?;
        }
        *state = AdvertisingState::Idle;
        Ok(())
    }

    async fn is_locked(&self) -> bool {
        match &self.probe {
            Some(p) => p.is_locked().await,
            None => false,
        }
    }

    /// Starts advertising right away if the session is already locked.
    pub async fn sync_initial_state(&self) -> Result<()> {
        if self.is_locked().await {
            info!("screen is locked, starting advertisement");
            self.start_advertising().await
        } else {
            info!("screen is unlocked, waiting");
            Ok(())
        }
    }

    pub async fn handle_event(&self, event: LockEvent) -> Result<()> {
        match event {
            LockEvent::Locked => {
                info!("screen locked, starting advertisement");
                self.start_advertising().await
            }
            LockEvent::Idle => {
                info!("system idle, starting advertisement");
                self.start_advertising().await
            }
            LockEvent::Unlocked | LockEvent::Active => {
                if self.is_locked().await {
                    info!(?event, "session still locked, keeping advertisement");
                    return Ok(());
                }
                info!(?event, "stopping advertisement");
                self.stop_advertising().await
            }
        }
    }

    /// Consumes monitor events until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<LockEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                error!(?event, "advertising transition failed: {e}");
            }
        }
    }

    pub fn enter_registration_mode(self: &Arc<Self>, duration: Duration) {
        info!(seconds = duration.as_secs_f64(), "entering registration mode");
        self.registration.open(duration);

        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(this) = weak.upgrade() {
                this.close_registration();
            }
        });
        if let Some(old) = self.expiry.lock().replace(timer) {
            old.abort();
        }
    }

    pub fn exit_registration_mode(&self) {
        if let Some(timer) = self.expiry.lock().take() {
            timer.abort();
        }
        self.close_registration();
    }

    fn close_registration(&self) {
        if self.registration.state().active {
            info!("exiting registration mode");
        }
        self.registration.close();
    }

    pub async fn shutdown(&self) {
        self.exit_registration_mode();
        if let Err(e) = self.stop_advertising().await {
            error!("failed to stop advertising: {e}");
        }
    }
}
