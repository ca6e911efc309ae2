//! Local control socket. One JSON command per connection, one JSON reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use crate::session::{AdvertisingState, SessionOrchestrator};

pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/cyberdeck-login.sock";

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_COMMAND_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ControlCommand {
    EnterRegistrationMode {
        #[serde(rename = "durationMs", default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    ExitRegistrationMode,
    Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertising: Option<bool>,
}

impl ControlReply {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

pub struct ControlServer {
    orchestrator: Arc<SessionOrchestrator>,
    default_duration: Duration,
    path: PathBuf,
}

impl ControlServer {
    pub fn new(
        orchestrator: Arc<SessionOrchestrator>,
        default_duration: Duration,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            orchestrator,
            default_duration,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Binds the socket, replacing a stale one left by a previous run.
    pub async fn bind(&self) -> std::io::Result<UnixListener> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!("removed stale control socket {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&self.path)?;
        info!("control socket listening on {}", self.path.display());
        Ok(listener)
    }

    /// Accept loop; runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            warn!("control connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("control socket accept failed: {e}");
                    break;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> anyhow::Result<()> {
        let reply = match read_command(&mut stream).await {
            Ok(cmd) => self.execute(cmd).await,
            Err(e) => {
                warn!("bad control command: {e}");
                ControlReply::failure(e.to_string())
            }
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stream.write_all(&out).await?;
        stream.shutdown().await?;
        Ok(())
    }

    pub async fn execute(&self, cmd: ControlCommand) -> ControlReply {
        match cmd {
            ControlCommand::EnterRegistrationMode { duration_ms } => {
                let duration = duration_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.default_duration);
                self.orchestrator.enter_registration_mode(duration);
                let state = self.orchestrator.registration().state();
                ControlReply {
                    success: true,
                    registration_mode: Some(state.active),
                    expires_at: state.expires_at_ms,
                    ..Default::default()
                }
            }
            ControlCommand::ExitRegistrationMode => {
                self.orchestrator.exit_registration_mode();
                ControlReply {
                    success: true,
                    registration_mode: Some(false),
                    ..Default::default()
                }
            }
            ControlCommand::Status => {
                let window = self.orchestrator.registration();
                let state = window.state();
                ControlReply {
                    success: true,
                    registration_mode: Some(window.is_active()),
                    expires_at: state.expires_at_ms,
                    advertising: Some(
                        self.orchestrator.advertising_state().await == AdvertisingState::Advertising,
                    ),
                    ..Default::default()
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Reads until the buffer parses as a command, the peer closes, or the read
/// times out.
async fn read_command(stream: &mut UnixStream) -> anyhow::Result<ControlCommand> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk)).await??;
        if n == 0 {
            return Ok(serde_json::from_slice(&buf)?);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(cmd) = serde_json::from_slice(&buf) {
            return Ok(cmd);
        }
        anyhow::ensure!(buf.len() <= MAX_COMMAND_BYTES, "command too large");
    }
}

/// Client side, used by the operator subcommands.
pub async fn send_command(path: &Path, cmd: &ControlCommand) -> anyhow::Result<ControlReply> {
    let mut stream = UnixStream::connect(path).await.map_err(|e| {
        anyhow::anyhow!("cannot reach server at {}: {e}", path.display())
    })?;
    stream.write_all(&serde_json::to_vec(cmd)?).await?;
    stream.shutdown().await?;

    let mut out = Vec::new();
    tokio::time::timeout(READ_TIMEOUT, stream.read_to_end(&mut out)).await??;
    Ok(serde_json::from_slice(&out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn server() -> (Arc<ControlServer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let orch = Arc::new(SessionOrchestrator::registration_only());
        let server = Arc::new(ControlServer::new(
            orch,
            Duration::from_secs(60),
            dir.path().join("ctl.sock"),
        ));
        let listener = server.bind().await.unwrap();
        tokio::spawn(server.clone().serve(listener));
        (server, dir)
    }

    #[test]
    fn commands_use_the_legacy_wire_shape() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"enterRegistrationMode","durationMs":1500}"#).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::EnterRegistrationMode {
                duration_ms: Some(1500)
            }
        );
        let cmd: ControlCommand = serde_json::from_str(r#"{"command":"status"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Status);
    }

    #[tokio::test]
    async fn registration_mode_round_trip_over_socket() {
        let (server, _dir) = server().await;

        let reply = send_command(
            server.path(),
            &ControlCommand::EnterRegistrationMode {
                duration_ms: Some(30_000),
            },
        )
        .await
        .unwrap();
        assert!(reply.success);
        assert_eq!(reply.registration_mode, Some(true));
        assert!(reply.expires_at.is_some());

        let status = send_command(server.path(), &ControlCommand::Status).await.unwrap();
        assert_eq!(status.registration_mode, Some(true));
        assert_eq!(status.advertising, Some(false));

        let reply = send_command(server.path(), &ControlCommand::ExitRegistrationMode)
            .await
            .unwrap();
        assert_eq!(reply.registration_mode, Some(false));
        let status = send_command(server.path(), &ControlCommand::Status).await.unwrap();
        assert_eq!(status.registration_mode, Some(false));
    }

    #[tokio::test]
    async fn garbage_gets_a_failure_reply() {
        let (server, _dir) = server().await;
        let mut stream = UnixStream::connect(server.path()).await.unwrap();
        stream.write_all(b"{\"command\":\"reboot\"}").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.ends_with('\n'));
        let reply: ControlReply = serde_json::from_str(out.trim_end()).unwrap();
        assert!(!reply.success);
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = ControlServer::new(
            Arc::new(SessionOrchestrator::registration_only()),
            Duration::from_secs(1),
            &path,
        );
        let _listener = server.bind().await.unwrap();
        drop(server);
        assert!(!path.exists());
    }
}
