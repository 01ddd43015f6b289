use std::collections::HashMap;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::credential::HelperCredential;
use super::discovery::{self, HeuristicMatch};
use super::ports::is_port_free;
use crate::config::HelperConfig;
use crate::error::{ShellgateError, ShellgateResult};

enum HelperProcess {
    /// Chosen by `allocate_port`, helper not running yet.
    Reserved,
    /// Spawned by this broker.
    Running { child: Child, pid: u32 },
    /// Found in the process table; only the pid is known.
    Adopted { pid: u32 },
}

struct HelperEntry {
    process: HelperProcess,
    created_at: DateTime<Utc>,
}

impl HelperEntry {
    fn reserved() -> Self {
        Self {
            process: HelperProcess::Reserved,
            created_at: Utc::now(),
        }
    }

    fn pid(&self) -> Option<u32> {
        match self.process {
            HelperProcess::Reserved => None,
            HelperProcess::Running { pid, .. } | HelperProcess::Adopted { pid } => Some(pid),
        }
    }
}

/// A helper that `start` brought up.
#[derive(Debug)]
pub struct HelperLaunch {
    pub port: u16,
    pub pid: u32,
    pub credential: HelperCredential,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelperInfo {
    pub port: u16,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    /// Rediscovered from the process table rather than started by this broker.
    pub adopted: bool,
}

/// Supervises external helper terminal servers, one per pool port.
pub struct HelperBroker {
    config: HelperConfig,
    entries: Mutex<HashMap<u16, HelperEntry>>,
}

impl HelperBroker {
    pub fn new(config: HelperConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Whether the helper executable can be found on this host. Blocks on a
    /// `which` lookup; async callers use [`Self::check_available`].
    pub fn is_available(&self) -> bool {
        let binary = &self.config.binary;
        if binary.contains('/') {
            return Path::new(binary).is_file();
        }

        match StdCommand::new("which")
            .arg(binary)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => which_result_exists(&output.stdout),
            _ => false,
        }
    }

    /// Same lookup as [`Self::is_available`] without blocking the runtime.
    pub async fn check_available(&self) -> bool {
        let binary = &self.config.binary;
        if binary.contains('/') {
            return tokio::fs::metadata(binary)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);
        }

        match Command::new("which")
            .arg(binary)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
        {
            Ok(output) if output.status.success() => which_result_exists(&output.stdout),
            _ => false,
        }
    }

    /// Reserve the first pool port that is untracked and free on loopback.
    pub fn allocate_port(&self) -> Option<u16> {
        let mut entries = self.entries.lock();
        for port in self.config.ports() {
            if entries.contains_key(&port) {
                continue;
            }
            if !is_port_free(&self.config.bind_address, port) {
                debug!(port, "Helper port busy on loopback, skipping");
                continue;
            }
            entries.insert(port, HelperEntry::reserved());
            debug!(port, "Reserved helper port");
            return Some(port);
        }
        warn!(
            "Helper port pool {}-{} exhausted",
            self.config.port_base,
            self.config.port_last()
        );
        None
    }

    /// Drop a reservation that never got a helper.
    pub fn release(&self, port: u16) {
        let mut entries = self.entries.lock();
        if matches!(
            entries.get(&port).map(|e| &e.process),
            Some(HelperProcess::Reserved)
        ) {
            entries.remove(&port);
            debug!(port, "Released helper port");
        }
    }

    fn command(&self, port: u16, credential: &HelperCredential) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(port.to_string())
            .arg("-i")
            .arg(&self.config.bind_address)
            .arg("-c")
            .arg(credential.basic_auth_arg())
            .arg("-W")
            .arg("-t")
            .arg(format!("fontSize={}", self.config.font_size))
            .arg("-t")
            .arg(format!("theme={}", self.config.theme))
            .arg(&self.config.shell)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        cmd
    }

    /// Launch a helper on `port`, which must be reserved or untracked.
    ///
    /// Resolves after the startup grace period; a helper that has already
    /// exited by then is reported as a spawn failure. Any failure releases
    /// the port.
    pub async fn start(&self, port: u16) -> ShellgateResult<HelperLaunch> {
        if !self.config.contains_port(port) {
            return Err(ShellgateError::InvalidArgument(format!(
                "Port {} is outside the helper pool {}-{}",
                port,
                self.config.port_base,
                self.config.port_last()
            )));
        }
        if !self.check_available().await {
            self.release(port);
            return Err(ShellgateError::HelperUnavailable(format!(
                "{} not found",
                self.config.binary
            )));
        }

        {
            let mut entries = self.entries.lock();
            let reserved = entries
                .get(&port)
                .map(|e| matches!(e.process, HelperProcess::Reserved));
            match reserved {
                None => {
                    entries.insert(port, HelperEntry::reserved());
                }
                Some(true) => {}
                Some(false) => {
                    return Err(ShellgateError::InvalidArgument(format!(
                        "Port {} already has a helper",
                        port
                    )));
                }
            }
        }

        let credential = HelperCredential::generate(self.config.username.clone());
        let mut child = match self.command(port, &credential).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.release(port);
                let err = ShellgateError::spawn_failed(&self.config.binary, e);
                error!("{}", err);
                return Err(err);
            }
        };
        let pid = child.id().unwrap_or_default();

        tokio::time::sleep(self.config.startup_grace()).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                self.release(port);
                let err = ShellgateError::spawn_failed(
                    &self.config.binary,
                    format!("exited during startup with {}", status),
                );
                error!(port, "{}", err);
                return Err(err);
            }
            Err(e) => {
                self.release(port);
                let _ = child.start_kill();
                return Err(ShellgateError::spawn_failed(&self.config.binary, e));
            }
        }

        {
            let mut entries = self.entries.lock();
            let still_reserved = matches!(
                entries.get(&port).map(|e| &e.process),
                Some(HelperProcess::Reserved)
            );
            if !still_reserved {
                drop(entries);
                // Stopped while it was starting up.
                let _ = child.start_kill();
                reap_in_background(child);
                return Err(ShellgateError::spawn_failed(
                    &self.config.binary,
                    "stopped during startup",
                ));
            }
            entries.insert(
                port,
                HelperEntry {
                    process: HelperProcess::Running { child, pid },
                    created_at: Utc::now(),
                },
            );
        }

        info!(port, pid, "Terminal helper started");
        Ok(HelperLaunch {
            port,
            pid,
            credential,
        })
    }

    /// Allocate a port and start a helper on it.
    pub async fn create(&self) -> ShellgateResult<HelperLaunch> {
        if !self.check_available().await {
            return Err(ShellgateError::HelperUnavailable(format!(
                "{} not found",
                self.config.binary
            )));
        }
        let port = self
            .allocate_port()
            .ok_or(ShellgateError::PoolExhausted {
                base: self.config.port_base,
                last: self.config.port_last(),
            })?;
        self.start(port).await
    }

    /// Stop whatever serves `port` and forget it. Returns how many processes
    /// were signalled.
    pub fn stop(&self, port: u16) -> usize {
        let entry = self.entries.lock().remove(&port);

        let signalled = match entry.map(|e| e.process) {
            Some(HelperProcess::Reserved) => 0,
            Some(HelperProcess::Running { mut child, pid }) => {
                let signalled = if discovery::terminate_pid(pid) {
                    1
                } else {
                    match child.start_kill() {
                        Ok(()) => 1,
                        Err(e) => {
                            debug!(port, pid, error = %e, "Helper already gone");
                            0
                        }
                    }
                };
                reap_in_background(child);
                signalled
            }
            Some(HelperProcess::Adopted { .. }) | None => discovery::kill_port(&self.config, port),
        };

        info!(port, signalled, "Terminal helper stopped");
        signalled
    }

    /// Reconcile the registry with the process table and list live helpers.
    ///
    /// Helpers found by [`discovery::scan`] that this broker does not track
    /// are adopted; tracked entries whose process is gone are pruned.
    pub fn list_active(&self) -> Vec<HelperInfo> {
        let found = discovery::scan(&self.config);
        let mut entries = self.entries.lock();

        entries.retain(|port, entry| {
            let alive = match &mut entry.process {
                HelperProcess::Reserved => true,
                HelperProcess::Running { child, .. } => matches!(child.try_wait(), Ok(None)),
                HelperProcess::Adopted { pid } => found.iter().any(|m| m.pid == *pid),
            };
            if !alive {
                debug!(port, "Pruning dead helper entry");
            }
            alive
        });

        for HeuristicMatch {
            pid,
            port,
            start_time,
        } in found
        {
            if entries.contains_key(&port) {
                continue;
            }
            info!(port, pid, "Adopting running terminal helper");
            let created_at = DateTime::from_timestamp(start_time as i64, 0).unwrap_or_else(Utc::now);
            entries.insert(
                port,
                HelperEntry {
                    process: HelperProcess::Adopted { pid },
                    created_at,
                },
            );
        }

        let mut active: Vec<HelperInfo> = entries
            .iter()
            .filter_map(|(port, entry)| {
                Some(HelperInfo {
                    port: *port,
                    pid: entry.pid()?,
                    created_at: entry.created_at,
                    adopted: matches!(entry.process, HelperProcess::Adopted { .. }),
                })
            })
            .collect();
        active.sort_by_key(|info| info.port);
        active
    }

    /// Ports currently tracked, reservations included.
    pub fn tracked_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.entries.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop every helper this broker tracks.
    pub fn shutdown(&self) {
        let ports = self.tracked_ports();
        if !ports.is_empty() {
            info!("Stopping {} terminal helpers", ports.len());
        }
        for port in ports {
            self.stop(port);
        }
    }
}

fn which_result_exists(stdout: &[u8]) -> bool {
    let path = String::from_utf8_lossy(stdout);
    Path::new(path.trim()).exists()
}

fn reap_in_background(mut child: Child) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = child.wait().await;
            });
        }
        Err(_) => {
            let _ = child.start_kill();
        }
    }
}
