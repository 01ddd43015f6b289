use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, MasterPty, PtySize};
use serde::Serialize;
use tracing::debug;

use super::protocol::ServerMessage;
use super::transport::TransportHandle;
use crate::error::{ShellgateError, ShellgateResult};

/// How long a hung-up shell gets before it is killed outright.
const KILL_ESCALATION_DELAY: Duration = Duration::from_secs(2);

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PtySessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connected: bool,
    pub shell: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

pub(crate) struct PtyProcess {
    pub(crate) master: Box<dyn MasterPty + Send>,
    pub(crate) writer: Box<dyn Write + Send>,
    pub(crate) child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    pub(crate) killer: Box<dyn ChildKiller + Send + Sync>,
    pub(crate) pid: Option<u32>,
}

/// One live shell. Owns its process; borrows at most one transport.
pub struct PtySession {
    id: String,
    shell: String,
    cwd: PathBuf,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    transport: Mutex<Option<TransportHandle>>,
    closed: AtomicBool,
}

impl PtySession {
    pub(crate) fn new(id: String, shell: String, cwd: PathBuf, process: PtyProcess) -> Self {
        let activity = Activity::now();
        Self {
            id,
            shell,
            cwd,
            pid: process.pid,
            created_at: activity.wall,
            activity: Mutex::new(activity),
            writer: Mutex::new(process.writer),
            master: Mutex::new(process.master),
            child: process.child,
            killer: Mutex::new(process.killer),
            transport: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn touch(&self) {
        *self.activity.lock() = Activity::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.activity.lock().at)
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .map(|t| t.is_healthy())
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking liveness check.
    pub fn has_exited(&self) -> bool {
        match self.child.lock().try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    pub fn info(&self) -> PtySessionInfo {
        let (cols, rows) = self.geometry().unwrap_or((0, 0));
        PtySessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_activity: self.activity.lock().wall,
            connected: self.is_connected(),
            shell: self.shell.clone(),
            cwd: self.cwd.to_string_lossy().to_string(),
            pid: self.pid,
            cols,
            rows,
        }
    }

    pub fn write(&self, data: &[u8]) -> ShellgateResult<()> {
        if self.is_closed() {
            return Err(ShellgateError::SessionNotFound(self.id.clone()));
        }
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        drop(writer);
        self.touch();
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> ShellgateResult<()> {
        if self.is_closed() {
            return Err(ShellgateError::SessionNotFound(self.id.clone()));
        }
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellgateError::Io(format!("Failed to resize: {}", e)))?;
        self.touch();
        Ok(())
    }

    /// Geometry as the process sees it, read back from the PTY.
    pub fn geometry(&self) -> ShellgateResult<(u16, u16)> {
        let size = self
            .master
            .lock()
            .get_size()
            .map_err(|e| ShellgateError::Io(format!("Failed to read size: {}", e)))?;
        Ok((size.cols, size.rows))
    }

    /// Install a transport, closing whichever one was bound before.
    pub(crate) fn bind(&self, transport: TransportHandle) -> ShellgateResult<()> {
        let mut slot = self.transport.lock();
        if self.is_closed() {
            transport.close();
            return Err(ShellgateError::SessionNotFound(self.id.clone()));
        }
        if let Some(previous) = slot.take() {
            debug!(session_id = %self.id, transport = previous.id(), "Replacing transport");
            previous.close();
        }
        transport.send(ServerMessage::Connected {
            session_id: self.id.clone(),
        });
        *slot = Some(transport);
        drop(slot);
        self.touch();
        Ok(())
    }

    /// Unbind only if `transport_id` is still the bound transport.
    pub(crate) fn unbind(&self, transport_id: u64) -> bool {
        let mut slot = self.transport.lock();
        match slot.as_ref() {
            Some(current) if current.id() == transport_id => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    /// Deliver a frame to the bound transport, if any. Output is dropped
    /// while detached.
    pub(crate) fn forward(&self, msg: ServerMessage) {
        let mut slot = self.transport.lock();
        if self.is_closed() {
            return;
        }
        if let Some(transport) = slot.as_ref() {
            if !transport.send(msg) {
                debug!(session_id = %self.id, transport = transport.id(), "Transport gone or backed up, detaching");
                slot.take();
            }
        }
    }

    /// The process exited on its own: report it and release the transport.
    pub(crate) fn finish(&self, code: Option<i32>) {
        let mut slot = self.transport.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(transport) = slot.take() {
            transport.send(ServerMessage::Exit { code });
            transport.close();
        }
    }

    /// Close the transport and signal the process. Returns immediately; a
    /// shell that ignores the hangup is killed after a short delay.
    pub(crate) fn terminate(&self) {
        {
            let mut slot = self.transport.lock();
            self.closed.store(true, Ordering::Release);
            if let Some(transport) = slot.take() {
                transport.close();
            }
        }

        if let Err(e) = self.killer.lock().kill() {
            debug!(session_id = %self.id, error = %e, "Hangup signal failed");
        }

        let child = Arc::clone(&self.child);
        let session_id = self.id.clone();
        let spawned = std::thread::Builder::new()
            .name("pty-kill".to_string())
            .spawn(move || {
                std::thread::sleep(KILL_ESCALATION_DELAY);
                let mut child = child.lock();
                if let Ok(None) = child.try_wait() {
                    debug!(session_id = %session_id, "Shell ignored hangup, killing");
                    let _ = child.kill();
                }
            });
        if let Err(e) = spawned {
            debug!(session_id = %self.id, error = %e, "Could not schedule kill escalation");
        }
    }
}
