//! Trusted device store and the staging area for captured keys.
//!
//! Trusted records come from the config file and from the trusted directory
//! (one JSON file per device). Captured keys only ever go to the staging
//! directory; promoting one is done by an operator copying the file over.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{CapturedKey, RegisteredDevice};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct DeviceRegistry {
    inline: Vec<RegisteredDevice>,
    trusted_dir: PathBuf,
    staging_dir: PathBuf,
    /// Replaced wholesale on refresh; readers clone the `Arc`.
    devices: RwLock<Arc<Vec<RegisteredDevice>>>,
    captured: RwLock<Arc<Vec<CapturedKey>>>,
    /// Record count seen by the last scan of the trusted directory.
    last_count: RwLock<Option<usize>>,
}

impl DeviceRegistry {
    pub fn new(
        inline: Vec<RegisteredDevice>,
        trusted_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            devices: RwLock::new(Arc::new(inline.clone())),
            inline,
            trusted_dir: trusted_dir.into(),
            staging_dir: staging_dir.into(),
            captured: RwLock::new(Arc::new(Vec::new())),
            last_count: RwLock::new(None),
        }
    }

    /// Reads both stores. Called once at start-up.
    pub async fn load(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.trusted_dir).await?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let files = json_files(&self.trusted_dir).await?;
        self.replace_trusted(&files).await;

        let staged = json_files(&self.staging_dir).await?;
        let mut captured = Vec::with_capacity(staged.len());
        for path in staged {
            match read_json::<CapturedKey>(&path).await {
                Ok(c) => captured.push(c),
                Err(e) => warn!("skipping staged key {}: {e}", path.display()),
            }
        }
        *self.captured.write() = Arc::new(captured);

        info!(
            trusted = self.devices.read().len(),
            staged = self.captured.read().len(),
            "device registry loaded"
        );
        Ok(())
    }

    /// Re-scans the trusted directory if its record count changed since the
    /// last scan. Returns whether the snapshot was replaced.
    pub async fn refresh(&self) -> Result<bool> {
        let files = json_files(&self.trusted_dir).await?;
        if *self.last_count.read() == Some(files.len()) {
            return Ok(false);
        }
        self.replace_trusted(&files).await;
        info!(trusted = self.devices.read().len(), "trusted devices reloaded");
        Ok(true)
    }

    async fn replace_trusted(&self, files: &[PathBuf]) {
        let mut devices = self.inline.clone();
        for path in files {
            match read_json::<RegisteredDevice>(path).await {
                Ok(d) if devices.iter().any(|x| x.public_key_b64 == d.public_key_b64) => {
                    debug!("duplicate trusted key in {}", path.display());
                }
                Ok(d) => devices.push(d),
                Err(e) => warn!("skipping trusted record {}: {e}", path.display()),
            }
        }
        *self.devices.write() = Arc::new(devices);
        *self.last_count.write() = Some(files.len());
    }

    /// Polls `refresh` until the returned handle is aborted.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(reg) = registry.upgrade() else { break };
                if let Err(e) = reg.refresh().await {
                    warn!("trusted store refresh failed: {e}");
                }
            }
        })
    }

    pub fn snapshot(&self) -> Arc<Vec<RegisteredDevice>> {
        self.devices.read().clone()
    }

    pub fn find_by_public_key(&self, key: &str) -> Option<RegisteredDevice> {
        self.snapshot()
            .iter()
            .find(|d| d.public_key_b64 == key)
            .cloned()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.find_by_public_key(key).is_some()
    }

    pub fn list_captured(&self) -> Arc<Vec<CapturedKey>> {
        self.captured.read().clone()
    }

    /// Writes the key to the staging directory only.
    pub async fn stage_captured(
        &self,
        device_id: &str,
        public_key_b64: &str,
        label: &str,
    ) -> Result<PathBuf> {
        let key = CapturedKey {
            device_id: device_id.to_string(),
            public_key_b64: public_key_b64.to_string(),
            label: label.to_string(),
            captured_at: Utc::now(),
        };
        let path = self
            .staging_dir
            .join(format!("{}.json", capture_file_stem(device_id)));
        tokio::fs::write(&path, serde_json::to_string_pretty(&key)?).await?;

        {
            let mut captured = self.captured.write();
            let mut next: Vec<CapturedKey> = captured
                .iter()
                .filter(|c| c.device_id != key.device_id)
                .cloned()
                .collect();
            next.push(key);
            *captured = Arc::new(next);
        }

        info!("captured public key saved to {}", path.display());
        info!("to trust this device, copy it into {}", self.trusted_dir.display());
        Ok(path)
    }
}

/// Device ids come from clients; keep them to one safe path component.
fn sanitize_file_stem(id: &str) -> String {
    let s: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(128)
        .collect();
    if s.is_empty() {
        "device".to_string()
    } else {
        s
    }
}

/// Ids that had to be rewritten get a hash of the raw id appended after a
/// `.`, which never appears in a sanitized stem, so distinct ids never share
/// a staging file.
fn capture_file_stem(id: &str) -> String {
    let stem = sanitize_file_stem(id);
    if stem == id {
        return stem;
    }
    // FNV-1a: stable across builds and platforms
    let hash = id.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    });
    format!("{stem}.{hash:016x}")
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}
