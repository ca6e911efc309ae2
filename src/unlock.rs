//! Best-effort OS unlock.
//!
//! `trigger_login` walks a fixed list of named steps. Each step logs its own
//! failures and carries on; the only error that reaches the caller is being
//! unable to write the trigger file the login module waits for. Nothing here
//! can confirm the session actually unlocked.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{parse_sessions, CommandRunner};
use crate::error::{Error, Result};

pub const DEFAULT_TRIGGER_FILE: &str = "/tmp/cyberdeck-login-trigger";

const GREETER_XAUTHORITY: &str = "XAUTHORITY=/var/lib/lightdm/.Xauthority";
const GREETER_DISPLAY: &str = "DISPLAY=:0";

#[async_trait]
pub trait Unlocker: Send + Sync {
    async fn trigger_login(&self) -> Result<()>;
}

/// Delays between steps. They paper over greeter restarts and focus races,
/// so the ordering and rough sizes matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnlockTimings {
    /// After writing and syncing the trigger file.
    pub trigger_settle_ms: u64,
    /// After killing the greeter, for its replacement to come up.
    pub greeter_respawn_ms: u64,
    /// Between focusing the greeter and pressing Return.
    pub focus_settle_ms: u64,
    /// How long the trigger file lives before it is removed.
    pub trigger_ttl_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for UnlockTimings {
    fn default() -> Self {
        Self {
            trigger_settle_ms: 200,
            greeter_respawn_ms: 4_000,
            focus_settle_ms: 300,
            trigger_ttl_ms: 5_000,
            command_timeout_ms: 5_000,
        }
    }
}

impl UnlockTimings {
    pub fn immediate() -> Self {
        Self {
            trigger_settle_ms: 0,
            greeter_respawn_ms: 0,
            focus_settle_ms: 0,
            trigger_ttl_ms: 0,
            command_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStep {
    SessionUnlock,
    ScreensaverDeactivate,
    GreeterSubmit,
    TriggerCleanup,
}

pub struct UnlockActuator {
    login_user: String,
    trigger_file: PathBuf,
    timings: UnlockTimings,
    runner: Arc<dyn CommandRunner>,
    /// Pending trigger file removal; replaced by each new attempt.
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl UnlockActuator {
    pub fn new(
        login_user: impl Into<String>,
        trigger_file: impl Into<PathBuf>,
        timings: UnlockTimings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            login_user: login_user.into(),
            trigger_file: trigger_file.into(),
            timings,
            runner,
            cleanup: Mutex::new(None),
        }
    }

    async fn try_command(&self, step: UnlockStep, program: &str, args: &[&str]) -> Option<String> {
        match self.runner.run(program, args).await {
            Ok(out) if out.success => Some(out.stdout),
            Ok(_) => {
                debug!(?step, "{program} exited unsuccessfully");
                None
            }
            Err(e) => {
                debug!(?step, "{e}");
                None
            }
        }
    }

    async fn session_unlock(&self) {
        let step = UnlockStep::SessionUnlock;
        self.try_command(step, "loginctl", &["unlock-sessions"]).await;

        let Some(list) = self
            .try_command(step, "loginctl", &["list-sessions", "--no-legend"])
            .await
        else {
            return;
        };
        for (id, user, _) in parse_sessions(&list) {
            if user == self.login_user {
                self.try_command(step, "loginctl", &["unlock-session", &id]).await;
            }
        }
    }

    /// Every desktop gets a try whether or not an earlier one worked.
    async fn screensaver_deactivate(&self) {
        let step = UnlockStep::ScreensaverDeactivate;
        let dbus_targets = [
            ("org.gnome.ScreenSaver", "/org/gnome/ScreenSaver", "org.gnome.ScreenSaver.SetActive"),
            (
                "org.freedesktop.ScreenSaver",
                "/org/freedesktop/ScreenSaver",
                "org.freedesktop.ScreenSaver.SetActive",
            ),
            ("org.kde.screensaver", "/ScreenSaver", "org.freedesktop.ScreenSaver.SetActive"),
        ];
        for (dest, path, method) in dbus_targets {
            let dest = format!("--dest={dest}");
            self.try_command(
                step,
                "dbus-send",
                &["--session", "--type=method_call", &dest, path, method, "boolean:false"],
            )
            .await;
        }

        let commands: [(&str, &[&str]); 5] = [
            ("xscreensaver-command", &["-deactivate"]),
            ("light-locker-command", &["-l"]),
            ("cinnamon-screensaver-command", &["-d"]),
            ("mate-screensaver-command", &["-d"]),
            ("xdotool", &["key", "shift"]),
        ];
        for (program, args) in commands {
            self.try_command(step, program, args).await;
        }
    }

    async fn write_trigger_file(&self) -> Result<()> {
        let body = json!({
            "user": self.login_user,
            "timestamp": Utc::now().timestamp_millis(),
            "action": "unlock",
        });
        tokio::fs::write(&self.trigger_file, body.to_string()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o666);
            if let Err(e) = tokio::fs::set_permissions(&self.trigger_file, perms).await {
                warn!("could not relax trigger file permissions: {e}");
            }
        }
        Ok(())
    }

    /// The trigger file must exist before the greeter starts its PAM
    /// conversation, hence write -> sync -> restart greeter -> submit.
    async fn greeter_submit(&self) -> Result<()> {
        let step = UnlockStep::GreeterSubmit;
        self.write_trigger_file()
            .await
            .map_err(|e| Error::UnlockActuationFailed(format!("write trigger file: {e}")))?;

        self.try_command(step, "sync", &[]).await;
        sleep_ms(self.timings.trigger_settle_ms).await;

        if let Some(list) = self
            .try_command(step, "loginctl", &["list-sessions", "--no-legend"])
            .await
        {
            let greeter = parse_sessions(&list)
                .into_iter()
                .find(|(_, user, rest)| user.contains("greeter") || rest.contains("greeter"));
            if let Some((id, _, _)) = greeter {
                self.try_command(step, "sudo", &["loginctl", "terminate-session", &id])
                    .await;
            }
        }
        sleep_ms(self.timings.greeter_respawn_ms).await;

        let xdotool = ["/usr/bin/env", GREETER_DISPLAY, GREETER_XAUTHORITY, "/usr/bin/xdotool"];
        let mousemove: Vec<&str> = xdotool.iter().copied().chain(["mousemove", "500", "300"]).collect();
        self.try_command(step, "sudo", &mousemove).await;
        sleep_ms(self.timings.focus_settle_ms).await;

        let submit: Vec<&str> = xdotool.iter().copied().chain(["key", "Return"]).collect();
        self.try_command(step, "sudo", &submit).await;
        Ok(())
    }

    /// Removes the trigger file after its TTL whether or not login happened.
    /// A newer attempt restarts the TTL so its own file is not removed early.
    fn schedule_cleanup(&self) {
        let path = self.trigger_file.clone();
        let ttl = self.timings.trigger_ttl_ms;
        let task = tokio::spawn(async move {
            sleep_ms(ttl).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(step = ?UnlockStep::TriggerCleanup, "trigger file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(step = ?UnlockStep::TriggerCleanup, "remove trigger file: {e}"),
            }
        });
        if let Some(old) = self.cleanup.lock().replace(task) {
            old.abort();
        }
    }
}

#[async_trait]
impl Unlocker for UnlockActuator {
    async fn trigger_login(&self) -> Result<()> {
        info!(user = %self.login_user, "triggering login");

        self.session_unlock().await;
        self.screensaver_deactivate().await;
        let submitted = self.greeter_submit().await;
        self.schedule_cleanup();
        submitted?;

        info!("unlock sequence finished");
        Ok(())
    }
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
