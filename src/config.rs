use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::RegisteredDevice;
use crate::unlock::UnlockTimings;

/// Where the server keeps its state on disk.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    /// Staging area for captured, unapproved keys.
    pub public_keys_dir: PathBuf,
    /// Operator-curated trusted records, one file per device.
    pub trusted_keys_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub computer_name: String,
    pub login_user: String,
    pub nonce_rotation_interval_ms: u64,
    pub registration_duration_ms: u64,
    pub idle_threshold_ms: u64,
    pub idle_poll_interval_ms: u64,
    pub registry_poll_interval_ms: u64,
    pub registered_devices: Vec<RegisteredDevice>,
    pub unlock: UnlockTimings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            computer_name: std::env::var("COMPUTER_NAME").unwrap_or_else(|_| "cyberdeck".into()),
            login_user: std::env::var("LOGIN_USER").unwrap_or_else(|_| "pi".into()),
            nonce_rotation_interval_ms: 30_000,
            registration_duration_ms: 60_000,
            idle_threshold_ms: 300_000,
            idle_poll_interval_ms: 10_000,
            registry_poll_interval_ms: 2_000,
            registered_devices: Vec::new(),
            unlock: UnlockTimings::default(),
        }
    }
}

impl ServerConfig {
    /// Reads the config file, writing a default one if it does not exist.
    /// An unreadable file falls back to defaults rather than aborting start-up.
    pub async fn load(paths: &Paths) -> anyhow::Result<Self> {
        if let Some(parent) = paths.config.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&paths.public_keys_dir).await?;
        tokio::fs::create_dir_all(&paths.trusted_keys_dir).await?;

        match tokio::fs::read_to_string(&paths.config).await {
            Ok(data) => match serde_json::from_str::<ServerConfig>(&data) {
                Ok(cfg) => {
                    info!("loaded config from {}", paths.config.display());
                    Ok(cfg.with_valid_intervals())
                }
                Err(e) => {
                    error!("failed to parse {}: {e}; using defaults", paths.config.display());
                    Ok(Self::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save(&paths.config).await?;
                info!("created default config at {}", paths.config.display());
                Ok(cfg)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Zero intervals would spin or stall the periodic tasks; they fall
    /// back to the defaults.
    fn with_valid_intervals(mut self) -> Self {
        let defaults = Self::default();
        for (name, value, fallback) in [
            (
                "nonceRotationIntervalMs",
                &mut self.nonce_rotation_interval_ms,
                defaults.nonce_rotation_interval_ms,
            ),
            (
                "registrationDurationMs",
                &mut self.registration_duration_ms,
                defaults.registration_duration_ms,
            ),
            (
                "idlePollIntervalMs",
                &mut self.idle_poll_interval_ms,
                defaults.idle_poll_interval_ms,
            ),
            (
                "registryPollIntervalMs",
                &mut self.registry_poll_interval_ms,
                defaults.registry_poll_interval_ms,
            ),
        ] {
            if *value == 0 {
                warn!("{name} must be positive; using {fallback}");
                *value = fallback;
            }
        }
        self
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    pub fn nonce_rotation_interval(&self) -> Duration {
        Duration::from_millis(self.nonce_rotation_interval_ms)
    }

    pub fn registration_duration(&self) -> Duration {
        Duration::from_millis(self.registration_duration_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn registry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.registry_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &Path) -> Paths {
        Paths {
            config: dir.join("data/config.json"),
            public_keys_dir: dir.join("data/publicKeys"),
            trusted_keys_dir: dir.join("data/trustedKeys"),
        }
    }

    #[tokio::test]
    async fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let cfg = ServerConfig::load(&p).await.unwrap();
        assert_eq!(cfg.nonce_rotation_interval_ms, 30_000);
        assert!(p.config.exists());
        assert!(p.public_keys_dir.is_dir());
        assert!(p.trusted_keys_dir.is_dir());
    }

    #[tokio::test]
    async fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        std::fs::create_dir_all(p.config.parent().unwrap()).unwrap();
        std::fs::write(
            &p.config,
            r#"{"computerName":"bench","registeredDevices":[{"publicKey":"k","name":"Watch"}]}"#,
        )
        .unwrap();
        let cfg = ServerConfig::load(&p).await.unwrap();
        assert_eq!(cfg.computer_name, "bench");
        assert_eq!(cfg.registered_devices.len(), 1);
        assert_eq!(cfg.registration_duration_ms, 60_000);
    }

    #[tokio::test]
    async fn zero_intervals_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        std::fs::create_dir_all(p.config.parent().unwrap()).unwrap();
        std::fs::write(
            &p.config,
            r#"{"nonceRotationIntervalMs":0,"registryPollIntervalMs":0,"idlePollIntervalMs":0,"idleThresholdMs":5000}"#,
        )
        .unwrap();
        let cfg = ServerConfig::load(&p).await.unwrap();
        assert_eq!(cfg.nonce_rotation_interval(), Duration::from_secs(30));
        assert_eq!(cfg.registry_poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.idle_poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.idle_threshold(), Duration::from_secs(5));
    }
}
