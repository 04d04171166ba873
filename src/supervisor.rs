//! Subprocess supervision for the subagent orchestration layer and builders.
//!
//! Both supervisors share this implementation; they differ in working
//! directory, config isolation, and how failures are treated (orchestration
//! startup failure is fatal to the session, builder failure degrades).
//!
//! Stale-process cleanup is deliberately conservative: we only ever touch a
//! PID we wrote ourselves, and only after verifying via `/proc/<pid>/cmdline`
//! that it is still the same program serving the same port.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Server command not found; is it installed?")]
    CommandNotFound,
    #[error("Failed to spawn process: {0}")]
    Spawn(std::io::Error),
    #[error("Process exited with {0} before becoming healthy")]
    ExitedEarly(String),
    #[error("Process did not become healthy within {0:?}")]
    HealthTimeout(Duration),
    #[error("Failed to prepare config directory: {0}")]
    ConfigSetup(std::io::Error),
    #[error("Working directory does not exist: {0}")]
    MissingWorkingDir(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Display name for logs ("orchestration", "builder").
    pub role: String,
    /// Program to spawn (expected to accept `serve --port N --hostname H`).
    pub program: String,
    pub port: u16,
    pub working_dir: PathBuf,
    pub start_timeout: Duration,
    /// Isolated config dir exported via `OPENCODE_CONFIG_DIR`, when set.
    pub config_dir: Option<PathBuf>,
    /// Directory of versioned agent definition files copied into
    /// `<config_dir>/agent/` before start.
    pub agents_source: Option<PathBuf>,
    /// PID file written after a successful start.
    pub pid_file: PathBuf,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    child: Mutex<Option<Child>>,
    started_by_us: std::sync::atomic::AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            started_by_us: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.config.port)
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.started_by_us.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Start the server if it isn't already healthy on the target port.
    ///
    /// Returns Ok even when an external process is adopted.
    pub async fn start(&self) -> SupervisorResult<()> {
        if !self.config.working_dir.exists() {
            return Err(SupervisorError::MissingWorkingDir(
                self.config.working_dir.display().to_string(),
            ));
        }

        if self.health_check().await {
            tracing::info!(
                role = %self.config.role,
                port = self.config.port,
                "Server already running; adopting external process"
            );
            return Ok(());
        }

        self.cleanup_stale_process().await;

        if let Some(config_dir) = &self.config.config_dir {
            self.setup_config_dir(config_dir)?;
            self.sync_agents(config_dir);
        }

        tracing::info!(
            role = %self.config.role,
            port = self.config.port,
            dir = %self.config.working_dir.display(),
            "Starting server"
        );

        let mut cmd = Command::new(&self.config.program);
        cmd.arg("serve")
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--hostname")
            .arg("127.0.0.1")
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(config_dir) = &self.config.config_dir {
            cmd.env("OPENCODE_CONFIG_DIR", config_dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::CommandNotFound
            } else {
                SupervisorError::Spawn(e)
            }
        })?;

        if let Some(stdout) = child.stdout.take() {
            let role = self.config.role.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let lowered = line.to_lowercase();
                    if lowered.contains("error") || lowered.contains("listening") {
                        tracing::info!(role = %role, "[server] {line}");
                    } else {
                        tracing::debug!(role = %role, "[server] {line}");
                    }
                }
            });
        }

        let pid = child.id();
        *self.child.lock().await = Some(child);
        self.started_by_us.store(true, std::sync::atomic::Ordering::SeqCst);

        // Poll health until the timeout; bail if the child dies first.
        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            if self.health_check().await {
                tracing::info!(role = %self.config.role, port = self.config.port, "Server healthy");
                if let Some(pid) = pid {
                    self.write_pid_file(pid);
                }
                return Ok(());
            }

            {
                let mut guard = self.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        *guard = None;
                        self.started_by_us.store(false, std::sync::atomic::Ordering::SeqCst);
                        return Err(SupervisorError::ExitedEarly(status.to_string()));
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.stop().await;
                return Err(SupervisorError::HealthTimeout(self.config.start_timeout));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// SIGTERM, wait up to 5 s, SIGKILL, delete the PID file. Only touches a
    /// process we spawned.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if !self.started_by_us.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            tracing::info!(role = %self.config.role, "Stopping server");

            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }

            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(role = %self.config.role, "Server did not terminate gracefully, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
        self.started_by_us.store(false, std::sync::atomic::Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.config.pid_file);
    }

    pub async fn health_check(&self) -> bool {
        let client = match reqwest::Client::builder().timeout(HEALTH_CHECK_TIMEOUT).build() {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.get(format!("{}/agent", self.base_url())).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn setup_config_dir(&self, config_dir: &Path) -> SupervisorResult<()> {
        std::fs::create_dir_all(config_dir.join("agent")).map_err(SupervisorError::ConfigSetup)
    }

    /// Copy versioned agent definition files into the runtime location.
    /// A missing source directory is not fatal; agents may already be there.
    fn sync_agents(&self, config_dir: &Path) {
        let Some(source) = &self.config.agents_source else {
            return;
        };
        if !source.exists() {
            tracing::warn!(source = %source.display(), "Agents source not found");
            return;
        }

        let agent_dir = config_dir.join("agent");
        let mut synced = Vec::new();
        if let Ok(entries) = std::fs::read_dir(source) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    if let Some(name) = path.file_name() {
                        if std::fs::copy(&path, agent_dir.join(name)).is_ok() {
                            synced.push(name.to_string_lossy().to_string());
                        }
                    }
                }
            }
        }
        if !synced.is_empty() {
            tracing::info!(agents = ?synced, "Synced agent definitions");
        }
    }

    fn write_pid_file(&self, pid: u32) {
        if let Some(parent) = self.config.pid_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.config.pid_file, pid.to_string()) {
            tracing::debug!(error = %e, "Failed to write pid file");
        }
    }

    /// Kill a stale process left over from a previous run, but only when our
    /// own PID file points at it and the process still matches.
    async fn cleanup_stale_process(&self) {
        let pid_file = &self.config.pid_file;
        let Ok(content) = std::fs::read_to_string(pid_file) else {
            return;
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            let _ = std::fs::remove_file(pid_file);
            return;
        };

        // Signal 0 probes liveness without touching the process.
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            let _ = std::fs::remove_file(pid_file);
            return;
        }

        let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline")).unwrap_or_default();
        if !cmdline_matches(&cmdline, &self.config.program, self.config.port) {
            tracing::warn!(
                pid,
                pid_file = %pid_file.display(),
                "PID file points at an unrelated process; leaving it alone"
            );
            return;
        }

        tracing::warn!(pid, port = self.config.port, role = %self.config.role, "Terminating stale server process");
        let nix_pid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGTERM);
        tokio::time::sleep(Duration::from_secs(2)).await;
        if nix::sys::signal::kill(nix_pid, None).is_ok() {
            let _ = nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGKILL);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let _ = std::fs::remove_file(pid_file);
    }
}

/// `/proc/<pid>/cmdline` is NUL-separated. The process must be the expected
/// program running `serve` on our port; anything else is left alone.
fn cmdline_matches(raw_cmdline: &str, program: &str, port: u16) -> bool {
    let cmdline = raw_cmdline.replace('\0', " ").to_lowercase();
    let program = program.to_lowercase();
    let program_name = program.rsplit('/').next().unwrap_or(&program);

    cmdline.contains(program_name)
        && cmdline.contains("serve")
        && cmdline.contains(&format!("--port {port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_match_requires_program_serve_and_port() {
        let cmdline = "opencode\0serve\0--port\04158\0--hostname\0127.0.0.1";
        assert!(cmdline_matches(cmdline, "opencode", 4158));
        assert!(!cmdline_matches(cmdline, "opencode", 9999));
        assert!(!cmdline_matches(cmdline, "some-other-tool", 4158));

        let unrelated = "vim\0notes.txt";
        assert!(!cmdline_matches(unrelated, "opencode", 4158));

        // A process that mentions the program but is not serving.
        let not_serving = "opencode\0--version";
        assert!(!cmdline_matches(not_serving, "opencode", 4158));
    }

    #[test]
    fn test_cmdline_match_with_program_path() {
        let cmdline = "/usr/local/bin/opencode\0serve\0--port\08001";
        assert!(cmdline_matches(cmdline, "opencode", 8001));
        assert!(cmdline_matches(cmdline, "/usr/local/bin/opencode", 8001));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_working_dir() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            role: "builder".to_string(),
            program: "opencode".to_string(),
            port: 39999,
            working_dir: PathBuf::from("/definitely/not/a/real/dir"),
            start_timeout: Duration::from_secs(1),
            config_dir: None,
            agents_source: None,
            pid_file: std::env::temp_dir().join("parley-test.pid"),
        });
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::MissingWorkingDir(_)));
    }
}
