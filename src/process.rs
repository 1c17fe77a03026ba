//! Sandbox child process supervision
//!
//! The supervisor is the only component that spawns or signals sandbox
//! processes. A sandbox is started as `{binary} serve {config}`; its stdout
//! and stderr are mirrored both into the parent's log stream and into the
//! per-version log file.

use crate::error::{Error, Result};
use crate::ports;
use crate::template::SandboxArtifacts;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A running sandbox process.
#[derive(Debug)]
pub struct Sandbox {
    pub child: Child,
    pub pid: u32,
    pub port: u16,
}

/// Spawns, probes and terminates sandbox processes.
pub struct Supervisor {
    sandbox_bin: PathBuf,
    probe_timeout: Duration,
    probe_interval: Duration,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(
        sandbox_bin: impl Into<PathBuf>,
        probe_timeout: Duration,
        probe_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            sandbox_bin: sandbox_bin.into(),
            probe_timeout,
            probe_interval,
            shutdown_grace,
        }
    }

    /// Check whether a pid refers to a live process (signal 0).
    pub fn is_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    /// Spawn the sandbox for a version and wait until it accepts connections
    /// on `port`. On probe failure the child is killed before the error
    /// returns, so a failed start never leaks a process.
    pub async fn start(
        &self,
        name: &str,
        version: &str,
        artifacts: &SandboxArtifacts,
        port: u16,
    ) -> Result<Sandbox> {
        let mut cmd = Command::new(&self.sandbox_bin);
        cmd.arg("serve")
            .arg(&artifacts.conf_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            name,
            version,
            binary = %self.sandbox_bin.display(),
            config = %artifacts.conf_path.display(),
            "Spawning sandbox"
        );

        let mut child = cmd.spawn().map_err(|e| {
            Error::RuntimeStartFailed(format!(
                "spawn {} serve {}: {}",
                self.sandbox_bin.display(),
                artifacts.conf_path.display(),
                e
            ))
        })?;
        let pid = child.id().unwrap_or(0);
        info!(name, version, pid, port, "Sandbox process spawned");

        if let Some(stdout) = child.stdout.take() {
            mirror_output(stdout, artifacts.log_path.clone(), name, version, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            mirror_output(stderr, artifacts.log_path.clone(), name, version, "stderr");
        }

        match ports::wait_port_ready(port, self.probe_timeout, self.probe_interval).await {
            Ok(()) => Ok(Sandbox { child, pid, port }),
            Err(e) => {
                warn!(name, version, pid, port, error = %e, "Sandbox never became ready, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
        }
    }

    /// Terminate a sandbox: verify liveness with signal 0, send SIGTERM and
    /// wait for exit; escalate to SIGKILL when the grace period expires.
    pub async fn stop(&self, name: &str, version: &str, child: &mut Child) -> Result<()> {
        let pid = match child.id() {
            Some(pid) => pid,
            // Already reaped.
            None => return Ok(()),
        };

        if !Self::is_alive(pid) {
            debug!(name, version, pid, "Sandbox already gone");
            let _ = child.wait().await;
            return Ok(());
        }

        info!(name, version, pid, "Sending SIGTERM to sandbox");
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH: exited between the liveness check and the signal.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::Internal(format!(
                    "signal sandbox pid {}: {}",
                    pid, err
                )));
            }
        }

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(name, version, pid, ?status, "Sandbox exited");
                Ok(())
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidInput => {
                // Already reaped elsewhere.
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Internal(format!("wait for sandbox exit: {}", e))),
            Err(_) => {
                warn!(
                    name,
                    version,
                    pid,
                    grace_secs = self.shutdown_grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
                Ok(())
            }
        }
    }
}

/// Mirror one output stream of a sandbox into tracing and the log file.
fn mirror_output<R>(stream: R, log_path: PathBuf, name: &str, version: &str, label: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = name.to_string();
    let version = version.to_string();
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(%name, %version, path = %log_path.display(), error = %e, "Cannot open sandbox log file");
                None
            }
        };

        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(%name, %version, stream = label, "{}", line);
            if let Some(f) = file.as_mut() {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
            }
        }
    });
}
