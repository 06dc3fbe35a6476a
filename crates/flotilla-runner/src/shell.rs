//! Remote-shell transport over multiplexed OpenSSH sessions.
//!
//! Each pooled connection owns one control-master process
//! (`ssh -M -N -S <socket>`). Commands run as short-lived clients of that
//! master, so reusing a connection skips the key exchange and login.

use crate::connection::{Connection, Connector, PoolKey, RemoteReply, TransportFailure};
use async_trait::async_trait;
use flotilla_core::agent::Endpoint;
use flotilla_core::ids::TaskId;
use flotilla_core::task::{RemoteStatus, TaskSpec};
use flotilla_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit code OpenSSH uses for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

/// Remote-shell transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Directory for control sockets. Defaults to the system temp dir.
    #[serde(default)]
    pub control_dir: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Extra `-o` options passed to the master, e.g. `StrictHostKeyChecking=no`.
    #[serde(default)]
    pub extra_options: Vec<String>,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            control_dir: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            extra_options: Vec::new(),
        }
    }
}

impl ShellConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn control_dir(&self) -> PathBuf {
        self.control_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Extract the command line from a task payload.
///
/// Accepts a bare string or an object with a string `command` field.
pub fn shell_command(payload: &serde_json::Value) -> Result<&str> {
    match payload {
        serde_json::Value::String(command) if !command.trim().is_empty() => Ok(command),
        serde_json::Value::Object(map) => match map.get("command") {
            Some(serde_json::Value::String(command)) if !command.trim().is_empty() => Ok(command),
            _ => Err(Error::InvalidPayload(
                "expected a non-empty string field 'command'".to_string(),
            )),
        },
        _ => Err(Error::InvalidPayload(
            "expected a command string or an object with 'command'".to_string(),
        )),
    }
}

fn destination(user: &str, host: &str) -> String {
    format!("{}@{}", user, host)
}

/// Arguments that start a control master for `destination`.
pub fn master_args(config: &ShellConfig, socket: &Path, destination: &str, port: u16) -> Vec<String> {
    let mut args = vec![
        "-M".to_string(),
        "-N".to_string(),
        "-S".to_string(),
        socket.display().to_string(),
        "-p".to_string(),
        port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout_ms.div_ceil(1000).max(1)),
    ];
    for option in &config.extra_options {
        args.push("-o".to_string());
        args.push(option.clone());
    }
    args.push(destination.to_string());
    args
}

/// Arguments that send a control command (`check`, `exit`) to a master.
pub fn control_args(socket: &Path, destination: &str, op: &str) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-O".to_string(),
        op.to_string(),
        destination.to_string(),
    ]
}

/// Arguments that run `command` over an existing master.
pub fn command_args(socket: &Path, destination: &str, command: &str) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        destination.to_string(),
        "--".to_string(),
        command.to_string(),
    ]
}

/// Opens one control master per pooled connection.
pub struct ShellConnector {
    config: Arc<ShellConfig>,
}

impl ShellConnector {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Connector for ShellConnector {
    async fn connect(
        &self,
        key: &PoolKey,
    ) -> std::result::Result<Box<dyn Connection>, TransportFailure> {
        let Endpoint::Shell { host, user, port } = &key.endpoint else {
            return Err(TransportFailure::new(format!(
                "endpoint {} is not a shell endpoint",
                key.endpoint
            )));
        };
        let dest = destination(user, host);
        let socket = self
            .config
            .control_dir()
            .join(format!("flotilla-{}.sock", Uuid::new_v4().simple()));

        let mut master = Command::new(&self.config.ssh_binary)
            .args(master_args(&self.config, &socket, &dest, *port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportFailure::new(format!("failed to spawn {}: {}", self.config.ssh_binary, e))
            })?;

        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            match master.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(&mut master).await;
                    return Err(TransportFailure::new(format!(
                        "ssh master for {} exited with {}: {}",
                        dest,
                        status,
                        stderr.trim()
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(TransportFailure::new(format!(
                        "failed to poll ssh master for {}: {}",
                        dest, e
                    )));
                }
            }

            let ready = Command::new(&self.config.ssh_binary)
                .args(control_args(&socket, &dest, "check"))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await
                .map(|status| status.success())
                .unwrap_or(false);
            if ready {
                break;
            }

            if Instant::now() >= deadline {
                let _ = master.kill().await;
                remove_socket(&socket).await;
                return Err(TransportFailure::new(format!(
                    "ssh master for {} not ready after {}ms",
                    dest, self.config.connect_timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(destination = %dest, socket = %socket.display(), "Opened ssh control master");
        Ok(Box::new(ShellConnection {
            config: Arc::clone(&self.config),
            socket,
            dest,
            master,
            broken: false,
        }))
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}

async fn remove_socket(socket: &Path) {
    if let Err(e) = tokio::fs::remove_file(socket).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(socket = %socket.display(), error = %e, "Failed to remove control socket");
    }
}

struct ShellConnection {
    config: Arc<ShellConfig>,
    socket: PathBuf,
    dest: String,
    master: Child,
    broken: bool,
}

impl ShellConnection {
    async fn run(&mut self, command: &str) -> std::result::Result<RemoteReply, TransportFailure> {
        debug!(destination = %self.dest, command = %command, "Running remote command");

        // Dropping this future kills the local client, which tears down the remote channel.
        let output = Command::new(&self.config.ssh_binary)
            .args(command_args(&self.socket, &self.dest, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                self.broken = true;
                TransportFailure::new(format!("failed to spawn ssh client: {}", e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            None => {
                self.broken = true;
                Err(TransportFailure::new(format!(
                    "ssh client for {} killed by signal",
                    self.dest
                )))
            }
            Some(SSH_ERROR_EXIT) => {
                self.broken = true;
                warn!(destination = %self.dest, stderr = %stderr.trim(), "ssh session failed");
                Err(TransportFailure::new(format!(
                    "ssh to {} failed: {}",
                    self.dest,
                    stderr.trim()
                )))
            }
            Some(code) => {
                let output = if code == 0 || stderr.is_empty() {
                    stdout
                } else {
                    format!("{}{}", stdout, stderr)
                };
                Ok(RemoteReply {
                    output,
                    status: RemoteStatus::Exit(code),
                })
            }
        }
    }
}

#[async_trait]
impl Connection for ShellConnection {
    async fn execute(
        &mut self,
        _task_id: TaskId,
        task: &TaskSpec,
    ) -> std::result::Result<RemoteReply, TransportFailure> {
        let command = shell_command(&task.payload)
            .map_err(|e| TransportFailure::new(e.to_string()))?
            .to_string();
        self.run(&command).await
    }

    async fn probe(&mut self) -> std::result::Result<(), TransportFailure> {
        let reply = self.run("true").await?;
        if reply.status.is_success() {
            Ok(())
        } else {
            Err(TransportFailure::new(format!(
                "probe on {} returned {}",
                self.dest, reply.status
            )))
        }
    }

    fn is_broken(&mut self) -> bool {
        // A master that exited on its own leaves a dead socket behind.
        self.broken || !matches!(self.master.try_wait(), Ok(None))
    }

    async fn close(mut self: Box<Self>) {
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            Command::new(&self.config.ssh_binary)
                .args(control_args(&self.socket, &self.dest, "exit"))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        let _ = self.master.kill().await;
        remove_socket(&self.socket).await;
        debug!(destination = %self.dest, "Closed ssh control master");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::agent::Transport;
    use serde_json::json;

    #[test]
    fn test_shell_command_accepts_string_or_object() {
        assert_eq!(shell_command(&json!("cargo test")).unwrap(), "cargo test");
        assert_eq!(
            shell_command(&json!({ "command": "make lint" })).unwrap(),
            "make lint"
        );
    }

    #[test]
    fn test_shell_command_rejects_other_payloads() {
        for payload in [json!(null), json!(42), json!({ "cmd": "ls" }), json!("  ")] {
            let err = shell_command(&payload).unwrap_err();
            assert!(matches!(err, Error::InvalidPayload(_)));
        }
    }

    #[test]
    fn test_master_args() {
        let config = ShellConfig {
            connect_timeout_ms: 2_500,
            extra_options: vec!["StrictHostKeyChecking=no".to_string()],
            ..Default::default()
        };
        let args = master_args(&config, Path::new("/tmp/m.sock"), "ci@build-01", 2222);
        assert_eq!(&args[..4], &["-M", "-N", "-S", "/tmp/m.sock"]);
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.contains(&"ConnectTimeout=3".to_string()));
        assert!(args.windows(2).any(|w| w == ["-o", "StrictHostKeyChecking=no"]));
        assert_eq!(args.last().map(String::as_str), Some("ci@build-01"));
    }

    #[test]
    fn test_command_args_end_with_command() {
        let args = command_args(Path::new("/tmp/m.sock"), "ci@build-01", "cargo test --all");
        assert_eq!(args[0], "-S");
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep - 1], "ci@build-01");
        assert_eq!(args[sep + 1], "cargo test --all");
        assert_eq!(args.len(), sep + 2);
    }

    #[tokio::test]
    async fn test_connect_rejects_url_endpoint() {
        let connector = ShellConnector::new(ShellConfig::default());
        let key = PoolKey::new(
            Transport::RemoteShell,
            Endpoint::Url("http://agent".to_string()),
        );
        let err = connector.connect(&key).await.err().unwrap();
        assert!(err.message.contains("not a shell endpoint"));
    }

    #[tokio::test]
    async fn test_connect_fails_when_binary_missing() {
        let connector = ShellConnector::new(ShellConfig {
            ssh_binary: "/nonexistent/flotilla-ssh".to_string(),
            ..Default::default()
        });
        let key = PoolKey::new(
            Transport::RemoteShell,
            Endpoint::Shell {
                host: "build-01".to_string(),
                user: "ci".to_string(),
                port: 22,
            },
        );
        let err = connector.connect(&key).await.err().unwrap();
        assert!(err.message.contains("failed to spawn"));
    }
}
