//! Running OS helper commands (loginctl, dbus-send, xdotool, ...).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion and captures stdout. `Err` means the
    /// command could not be started or did not finish in time.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, String>;
}

/// Spawns real child processes, each bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, String> {
        let mut c = Command::new(program);
        c.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, c.output())
            .await
            .map_err(|_| format!("{program} timed out after {:?}", self.timeout))?
            .map_err(|e| format!("spawn {program}: {e}"))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        })
    }
}

/// Rows of `loginctl list-sessions --no-legend` as (session id, user, rest).
pub fn parse_sessions(output: &str) -> Vec<(String, String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            Some((parts[0].to_string(), parts[2].to_string(), parts[3..].join(" ")))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records every invocation and answers from a canned table.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<String>>,
        pub replies: Mutex<HashMap<String, Result<CommandOutput, String>>>,
    }

    impl RecordingRunner {
        pub fn reply(&self, cmdline: &str, reply: Result<CommandOutput, String>) {
            self.replies.lock().insert(cmdline.to_string(), reply);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, String> {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().push(line.clone());
            self.replies.lock().get(&line).cloned().unwrap_or_else(|| {
                Err(format!("{program}: not found"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loginctl_sessions() {
        let out = "     2 1000 pi     seat0 tty7\n    c1  113 lightdm seat0 greeter\n\n";
        let rows = parse_sessions(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "2");
        assert_eq!(rows[0].1, "pi");
        assert_eq!(rows[1].1, "lightdm");
        assert!(rows[1].2.contains("greeter"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let runner = SystemRunner::default();
        assert!(runner
            .run("definitely-not-a-real-binary-xyz", &[])
            .await
            .is_err());
    }
}
