//! Process Supervisor for the managed agent binary.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use muster_common::constants::{AGENT_CONFIG_FILE, formation};
use muster_common::{ClusterConfig, ClusterError, LaunchMode};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::Supervisor;
use super::output::{self, OutputStream};

/// Default bound for the `leave` command and for the exit that follows it
const DEFAULT_LEAVE_TIMEOUT: Duration = Duration::from_secs(formation::LEAVE_TIMEOUT_SECS);

/// Time allowed for output forwarders to drain after exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running (or exited) agent launched by [`ProcessSupervisor`]
pub struct SupervisedProcess {
    pid: u32,
    child: Child,
    config: ClusterConfig,
    mode: LaunchMode,
    leave_requested: bool,
    exit: Option<ExitStatus>,
    forwarders: Vec<JoinHandle<usize>>,
    lines_forwarded: usize,
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn mode(&self) -> &LaunchMode {
        &self.mode
    }

    /// Exit status once the process is known to have terminated
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Output lines forwarded so far (complete after `wait_for_exit`)
    pub fn lines_forwarded(&self) -> usize {
        self.lines_forwarded
    }

    pub fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => {
                    tracing::warn!(pid = self.pid, error = %e, "Failed to poll agent status");
                }
            }
        }
        self.exit
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid = self.pid, error = %e, "Failed to kill agent");
        }
    }

    async fn drain_output(&mut self) {
        for handle in self.forwarders.drain(..) {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(lines)) => self.lines_forwarded += lines,
                Ok(Err(e)) => tracing::debug!(pid = self.pid, error = %e, "Output forwarder failed"),
                Err(_) => tracing::debug!(pid = self.pid, "Output forwarder still running after exit"),
            }
        }
    }
}

/// Runs the agent binary as a child process
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    binary: PathBuf,
    /// Arguments placed before the agent sub-command (wrappers such as `sh -c`)
    wrapper_args: Vec<String>,
    config_dir: PathBuf,
    launch_grace: Duration,
    leave_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(binary: impl Into<PathBuf>, config_dir: impl Into<PathBuf>, launch_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            wrapper_args: Vec::new(),
            config_dir: config_dir.into(),
            launch_grace,
            leave_timeout: DEFAULT_LEAVE_TIMEOUT,
        }
    }

    /// Bound on the leave command and on the agent exiting after it
    pub fn with_leave_timeout(mut self, leave_timeout: Duration) -> Self {
        self.leave_timeout = leave_timeout;
        self
    }

    pub fn with_wrapper_args(mut self, args: Vec<String>) -> Self {
        self.wrapper_args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.wrapper_args);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Write the agent config file and return its path
    async fn write_config(&self, config: &ClusterConfig) -> Result<PathBuf, ClusterError> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| ClusterError::LaunchFailure(format!("cannot create {}: {}", self.config_dir.display(), e)))?;

        let path = self.config_dir.join(AGENT_CONFIG_FILE);
        let body = serde_json::to_vec_pretty(&config.to_agent_json())
            .map_err(|e| ClusterError::LaunchFailure(format!("cannot encode agent config: {}", e)))?;

        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ClusterError::LaunchFailure(format!("cannot write {}: {}", path.display(), e)))?;

        Ok(path)
    }
}

/// `agent -server -config-file <path> [-bootstrap] [-join <addr>]...`
pub fn launch_args(config_file: &Path, config: &ClusterConfig, mode: &LaunchMode) -> Vec<String> {
    let mut args = vec![
        "agent".to_string(),
        "-server".to_string(),
        "-config-file".to_string(),
        config_file.to_string_lossy().into_owned(),
    ];

    if mode.is_bootstrap() {
        args.push("-bootstrap".to_string());
    }

    for host in mode.join_hosts() {
        args.push("-join".to_string());
        args.push(config.join_target(&host));
    }

    args
}

/// `leave -rpc-addr <client_addr>:<rpc>`
pub fn leave_args(config: &ClusterConfig) -> Vec<String> {
    vec![
        "leave".to_string(),
        "-rpc-addr".to_string(),
        config.rpc_addr().to_string(),
    ]
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    type Process = SupervisedProcess;

    async fn launch(&self, config: &ClusterConfig, mode: &LaunchMode) -> Result<SupervisedProcess, ClusterError> {
        let config_file = self.write_config(config).await?;
        let args = launch_args(&config_file, config, mode);

        tracing::info!(
            binary = %self.binary.display(),
            args = ?args,
            mode = %mode,
            "Launching agent"
        );

        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::LaunchFailure(format!("{}: {}", self.binary.display(), e)))?;

        let pid = child.id().unwrap_or(0);
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(output::forward(pid, OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(output::forward(pid, OutputStream::Stderr, stderr));
        }

        let mut process = SupervisedProcess {
            pid,
            child,
            config: config.clone(),
            mode: mode.clone(),
            leave_requested: false,
            exit: None,
            forwarders,
            lines_forwarded: 0,
        };

        // Bind failures and bad configs show up as an immediate exit
        tokio::time::sleep(self.launch_grace).await;
        if let Some(status) = process.poll_exit() {
            process.drain_output().await;
            return Err(ClusterError::LaunchFailure(format!(
                "agent exited during startup ({})",
                status
            )));
        }

        tracing::info!(pid = pid, mode = %mode, "Agent running");
        Ok(process)
    }

    async fn shutdown(&self, process: &mut SupervisedProcess) -> Result<(), ClusterError> {
        if process.poll_exit().is_some() {
            tracing::debug!(pid = process.pid, "Agent already exited, nothing to shut down");
            return Ok(());
        }

        let args = leave_args(&process.config);
        tracing::info!(pid = process.pid, args = ?args, "Asking agent to leave the cluster");

        process.leave_requested = true;
        let mut leave = self.command();
        leave.args(&args).kill_on_drop(true);
        match tokio::time::timeout(self.leave_timeout, leave.output()).await {
            Ok(Ok(out)) => {
                for line in String::from_utf8_lossy(&out.stdout).lines() {
                    output::log_line(process.pid, OutputStream::Stdout, line);
                }
                for line in String::from_utf8_lossy(&out.stderr).lines() {
                    output::log_line(process.pid, OutputStream::Stderr, line);
                }
                if !out.status.success() {
                    tracing::warn!(pid = process.pid, status = %out.status, "Leave command failed, killing agent");
                    process.kill();
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = process.pid, error = %e, "Leave command could not run, killing agent");
                process.kill();
            }
            Err(_) => {
                tracing::warn!(pid = process.pid, "Leave command timed out, killing agent");
                process.kill();
            }
        }

        Ok(())
    }

    async fn wait_for_exit(&self, process: &mut SupervisedProcess) -> Result<(), ClusterError> {
        if process.exit.is_none() {
            let status = if process.leave_requested {
                match tokio::time::timeout(self.leave_timeout, process.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!(
                            pid = process.pid,
                            timeout = ?self.leave_timeout,
                            "Agent still running after leave, killing it"
                        );
                        process.kill();
                        process.child.wait().await?
                    }
                }
            } else {
                process.child.wait().await?
            };
            process.exit = Some(status);
        }

        process.drain_output().await;
        tracing::info!(
            pid = process.pid,
            status = ?process.exit,
            lines = process.lines_forwarded,
            "Agent exited"
        );
        Ok(())
    }

    fn has_exited(&self, process: &mut SupervisedProcess) -> bool {
        !process.is_running()
    }
}
