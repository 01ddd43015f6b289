use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::reader::{spawn_reader_thread, PtyEvent, EVENT_QUEUE_CAPACITY};
use super::session::{PtyProcess, PtySession, PtySessionInfo};
use super::transport::TransportHandle;
use crate::config::TerminalConfig;
use crate::error::{ShellgateError, ShellgateResult};

type Registry = Mutex<HashMap<String, Arc<PtySession>>>;

/// Optional fields of a create request; unset ones come from [`TerminalConfig`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub shell: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<PathBuf>,
}

/// Owns every in-process PTY session and mediates all traffic to them.
pub struct PtyBroker {
    sessions: Arc<Registry>,
    config: TerminalConfig,
}

fn validate_geometry(cols: u16, rows: u16) -> ShellgateResult<()> {
    if cols == 0 || rows == 0 {
        return Err(ShellgateError::InvalidArgument(format!(
            "Terminal geometry must be positive, got {}x{}",
            cols, rows
        )));
    }
    Ok(())
}

impl PtyBroker {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Create a session from request options, filling gaps from config.
    pub fn create_with(&self, options: CreateOptions) -> ShellgateResult<String> {
        let shell = options
            .shell
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.config.shell());
        let cols = options.cols.unwrap_or(self.config.default_cols);
        let rows = options.rows.unwrap_or(self.config.default_rows);
        let cwd = options.cwd.unwrap_or_else(|| self.config.cwd());
        self.create(&shell, cols, rows, cwd)
    }

    /// Spawn `shell` on a new PTY. Must run inside a tokio runtime.
    pub fn create(
        &self,
        shell: &str,
        cols: u16,
        rows: u16,
        cwd: impl Into<PathBuf>,
    ) -> ShellgateResult<String> {
        validate_geometry(cols, rows)?;
        if shell.is_empty() {
            return Err(ShellgateError::InvalidArgument(
                "Shell path must not be empty".to_string(),
            ));
        }

        if self.sessions.lock().len() >= self.config.max_sessions {
            return Err(ShellgateError::SessionLimitReached(self.config.max_sessions));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ShellgateError::Internal("PTY sessions require a tokio runtime".to_string())
        })?;

        let cwd = cwd.into();
        if !cwd.is_dir() {
            let err = ShellgateError::spawn_failed(
                shell,
                format!("working directory {} does not exist", cwd.display()),
            );
            error!("{}", err);
            return Err(err);
        }

        info!(shell = %shell, cwd = %cwd.display(), cols, rows, "Creating PTY session");

        let (process, reader) =
            spawn_pty(shell, cols, rows, &cwd, &self.config.term).map_err(|e| {
                error!("{}", e);
                e
            })?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let child = Arc::clone(&process.child);

        let session = Arc::new(PtySession::new(
            session_id.clone(),
            shell.to_string(),
            cwd,
            process,
        ));

        if let Err(e) = spawn_reader_thread(reader, child, session_id.clone(), events_tx) {
            session.terminate();
            return Err(ShellgateError::spawn_failed("reader thread", e));
        }

        {
            let mut sessions = self.sessions.lock();
            if sessions.len() >= self.config.max_sessions {
                drop(sessions);
                session.terminate();
                return Err(ShellgateError::SessionLimitReached(self.config.max_sessions));
            }
            sessions.insert(session_id.clone(), Arc::clone(&session));
        }

        runtime.spawn(pump_output(Arc::clone(&self.sessions), session, events_rx));

        info!(session_id = %session_id, "PTY session created");
        Ok(session_id)
    }

    fn get(&self, session_id: &str) -> ShellgateResult<Arc<PtySession>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ShellgateError::SessionNotFound(session_id.to_string()))
    }

    /// Bind `transport` to the session, replacing (and closing) any previous one.
    pub fn attach(&self, session_id: &str, transport: TransportHandle) -> ShellgateResult<()> {
        let session = match self.get(session_id) {
            Ok(session) => session,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        let transport_id = transport.id();
        session.bind(transport)?;
        debug!(session_id = %session_id, transport = transport_id, "Transport attached");
        Ok(())
    }

    /// Called by the transport layer when a connection drops.
    pub fn detach(&self, session_id: &str, transport_id: u64) {
        if let Ok(session) = self.get(session_id) {
            if session.unbind(transport_id) {
                debug!(session_id = %session_id, transport = transport_id, "Transport detached");
            }
        }
    }

    pub fn write(&self, session_id: &str, data: &[u8]) -> ShellgateResult<()> {
        self.get(session_id)?.write(data)
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> ShellgateResult<()> {
        validate_geometry(cols, rows)?;
        self.get(session_id)?.resize(cols, rows)
    }

    pub fn geometry(&self, session_id: &str) -> ShellgateResult<(u16, u16)> {
        self.get(session_id)?.geometry()
    }

    /// Remove the session now and signal its process. Later lookups of the
    /// same id fail even while the process is still going down.
    pub fn close(&self, session_id: &str) -> ShellgateResult<()> {
        let session = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| ShellgateError::SessionNotFound(session_id.to_string()))?;
        session.terminate();
        info!(session_id = %session_id, "PTY session closed");
        Ok(())
    }

    /// Dispatch one inbound text frame from an attached transport.
    /// Returns a reply for the sender, if the message calls for one.
    pub fn handle_client_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> ShellgateResult<Option<ServerMessage>> {
        let session = self.get(session_id)?;
        match ClientMessage::parse(text) {
            ClientMessage::Input { data } => {
                session.write(data.as_bytes())?;
                Ok(None)
            }
            ClientMessage::Resize {
                cols: Some(cols),
                rows: Some(rows),
            } => {
                validate_geometry(cols, rows)?;
                session.resize(cols, rows)?;
                Ok(None)
            }
            ClientMessage::Resize { .. } => Err(ShellgateError::InvalidArgument(
                "resize requires cols and rows".to_string(),
            )),
            ClientMessage::Ping => {
                session.touch();
                Ok(Some(ServerMessage::Pong))
            }
        }
    }

    pub fn list(&self) -> Vec<PtySessionInfo> {
        let sessions: Vec<Arc<PtySession>> = self.sessions.lock().values().cloned().collect();
        let mut infos: Vec<PtySessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<PtySession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Close every session, e.g. on process shutdown.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<PtySession>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            info!("Closing {} PTY sessions", drained.len());
        }
        for session in drained {
            session.terminate();
        }
    }
}

fn spawn_pty(
    shell: &str,
    cols: u16,
    rows: u16,
    cwd: &std::path::Path,
    term: &str,
) -> ShellgateResult<(PtyProcess, Box<dyn Read + Send>)> {
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(size)
        .map_err(|e| ShellgateError::spawn_failed("pty", e))?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.cwd(cwd);
    cmd.env("TERM", term);
    cmd.env("COLORTERM", "truecolor");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ShellgateError::spawn_failed(shell, e))?;
    // The master only sees EOF once every slave handle is gone.
    drop(pair.slave);

    let streams = pair
        .master
        .try_clone_reader()
        .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
    let (reader, writer) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            let _ = child.kill();
            return Err(ShellgateError::spawn_failed(
                shell,
                format!("PTY streams: {}", e),
            ));
        }
    };

    let killer = child.clone_killer();
    let pid = child.process_id();

    let process = PtyProcess {
        master: pair.master,
        writer,
        child: Arc::new(Mutex::new(child)),
        killer,
        pid,
    };
    Ok((process, reader))
}

/// Drain one session's output channel until its exit frame.
async fn pump_output(
    sessions: Arc<Registry>,
    session: Arc<PtySession>,
    mut events: mpsc::Receiver<PtyEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Output(data) => {
                session.touch();
                session.forward(ServerMessage::Output { data });
            }
            PtyEvent::Exit(code) => {
                session.finish(code);
                let mut registry = sessions.lock();
                if registry
                    .get(session.id())
                    .map(|current| Arc::ptr_eq(current, &session))
                    .unwrap_or(false)
                {
                    registry.remove(session.id());
                    drop(registry);
                    info!(session_id = %session.id(), code = ?code, "PTY session ended");
                }
                return;
            }
        }
    }
    warn!(session_id = %session.id(), "PTY output channel closed without exit frame");
}
