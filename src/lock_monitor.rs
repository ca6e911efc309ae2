//! Lock / idle signal sources.
//!
//! Each source runs on its own task and pushes [`LockEvent`]s into a shared
//! channel. A source that cannot start or dies is logged and dropped; the
//! monitor keeps running on whatever is left.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::CommandRunner;

pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(300);
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(10);
pub const MIN_IDLE_POLL: Duration = Duration::from_millis(100);

const SCREENSAVER_INTERFACES: [&str; 3] = [
    "org.freedesktop.ScreenSaver",
    "org.gnome.ScreenSaver",
    "org.kde.screensaver",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Locked,
    Unlocked,
    Idle,
    Active,
}

/// Point-in-time lock query, used for the initial state and to guard the
/// unlocked/active transitions.
#[async_trait]
pub trait LockProbe: Send + Sync {
    async fn is_locked(&self) -> bool;
}

#[async_trait]
pub trait SignalSource: Send {
    fn name(&self) -> &'static str;

    /// Runs until the source is exhausted. Returning is never fatal to the
    /// monitor.
    async fn run(self: Box<Self>, events: mpsc::Sender<LockEvent>) -> anyhow::Result<()>;
}

pub struct LockStateMonitor {
    sources: Mutex<Vec<Box<dyn SignalSource>>>,
    probe: Arc<dyn LockProbe>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LockStateMonitor {
    pub fn new(sources: Vec<Box<dyn SignalSource>>, probe: Arc<dyn LockProbe>) -> Self {
        Self {
            sources: Mutex::new(sources),
            probe,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Standard desktop sources: screensaver D-Bus signals plus idle polling.
    pub fn desktop(runner: Arc<dyn CommandRunner>, idle_threshold: Duration, poll: Duration) -> Self {
        let sources: Vec<Box<dyn SignalSource>> = vec![
            Box::new(ScreenSaverSignals),
            Box::new(IdlePoller::new(runner.clone(), idle_threshold, poll)),
        ];
        Self::new(sources, Arc::new(SystemLockProbe::new(runner)))
    }

    pub fn probe(&self) -> Arc<dyn LockProbe> {
        self.probe.clone()
    }

    pub async fn is_locked(&self) -> bool {
        self.probe.is_locked().await
    }

    /// Starts every source. Sources can only be started once.
    pub fn start(&self) -> mpsc::Receiver<LockEvent> {
        let (tx, rx) = mpsc::channel(32);
        let sources: Vec<_> = self.sources.lock().drain(..).collect();
        let mut tasks = self.tasks.lock();
        for source in sources {
            let tx = tx.clone();
            let name = source.name();
            tasks.push(tokio::spawn(async move {
                match source.run(tx).await {
                    Ok(()) => info!(source = name, "lock signal source ended"),
                    Err(e) => warn!(source = name, "lock signal source unavailable: {e}"),
                }
            }));
        }
        rx
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for LockStateMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Screensaver `ActiveChanged` signals read from `dbus-monitor`.
pub struct ScreenSaverSignals;

#[async_trait]
impl SignalSource for ScreenSaverSignals {
    fn name(&self) -> &'static str {
        "dbus-screensaver"
    }

    async fn run(self: Box<Self>, events: mpsc::Sender<LockEvent>) -> anyhow::Result<()> {
        let mut args = vec!["--session".to_string()];
        args.extend(
            SCREENSAVER_INTERFACES
                .iter()
                .map(|i| format!("type='signal',interface='{i}'")),
        );
        let mut child = Command::new("dbus-monitor")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("dbus-monitor has no stdout"))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ActiveChangedParser::default();
        while let Some(line) = lines.next_line().await? {
            if let Some(event) = parser.feed(&line) {
                debug!(?event, "screensaver signal");
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("dbus-monitor exited with {status}");
        }
        Ok(())
    }
}

/// Turns `dbus-monitor` output into lock events. The boolean argument of an
/// `ActiveChanged` signal arrives on the line after the header.
#[derive(Debug, Default)]
pub struct ActiveChangedParser {
    pending: bool,
}

impl ActiveChangedParser {
    pub fn feed(&mut self, line: &str) -> Option<LockEvent> {
        if line.contains("member=ActiveChanged") {
            self.pending = true;
            return None;
        }
        if !self.pending {
            return None;
        }
        if line.trim_start().starts_with("signal ") {
            self.pending = false;
            return None;
        }
        let arg = line.trim();
        if arg == "boolean true" {
            self.pending = false;
            Some(LockEvent::Locked)
        } else if arg == "boolean false" {
            self.pending = false;
            Some(LockEvent::Unlocked)
        } else {
            None
        }
    }
}

/// Polls `xprintidle` and reports idle/active edges.
pub struct IdlePoller {
    runner: Arc<dyn CommandRunner>,
    tracker: IdleTracker,
    interval: Duration,
}

impl IdlePoller {
    pub fn new(runner: Arc<dyn CommandRunner>, threshold: Duration, interval: Duration) -> Self {
        Self {
            runner,
            tracker: IdleTracker::new(threshold),
            interval: interval.max(MIN_IDLE_POLL),
        }
    }

    async fn idle_time(&self) -> Option<Duration> {
        let out = self.runner.run("xprintidle", &[]).await.ok()?;
        if !out.success {
            return None;
        }
        out.stdout.trim().parse::<u64>().ok().map(Duration::from_millis)
    }
}

#[async_trait]
impl SignalSource for IdlePoller {
    fn name(&self) -> &'static str {
        "xprintidle"
    }

    async fn run(mut self: Box<Self>, events: mpsc::Sender<LockEvent>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // an unreadable sample is skipped, not treated as activity
            let Some(idle) = self.idle_time().await else { continue };
            if let Some(event) = self.tracker.observe(idle) {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdleTracker {
    threshold: Duration,
    last: Duration,
}

impl IdleTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last: Duration::ZERO,
        }
    }

    pub fn observe(&mut self, idle: Duration) -> Option<LockEvent> {
        let was_idle = self.last >= self.threshold;
        let is_idle = idle >= self.threshold;
        self.last = idle;
        match (was_idle, is_idle) {
            (false, true) => Some(LockEvent::Idle),
            (true, false) => Some(LockEvent::Active),
            _ => None,
        }
    }
}

/// `loginctl` LockedHint, falling back to the freedesktop screensaver.
pub struct SystemLockProbe {
    runner: Arc<dyn CommandRunner>,
}

impl SystemLockProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl LockProbe for SystemLockProbe {
    async fn is_locked(&self) -> bool {
        if let Ok(out) = self
            .runner
            .run("loginctl", &["show-session", "--property=LockedHint"])
            .await
        {
            if out.success && out.stdout.contains("LockedHint=yes") {
                return true;
            }
        }

        match self
            .runner
            .run(
                "dbus-send",
                &[
                    "--session",
                    "--dest=org.freedesktop.ScreenSaver",
                    "--type=method_call",
                    "--print-reply",
                    "/org/freedesktop/ScreenSaver",
                    "org.freedesktop.ScreenSaver.GetActive",
                ],
            )
            .await
        {
            Ok(out) => out.success && out.stdout.contains("boolean true"),
            Err(_) => false,
        }
    }
}
