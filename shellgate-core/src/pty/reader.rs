use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 4096;
/// Output frames buffered between the reader thread and the pump task.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 64;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const EXIT_POLL_ATTEMPTS: u32 = 100;

/// Frames produced by one PTY, in order. `Exit` is always the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PtyEvent {
    Output(String),
    Exit(Option<i32>),
}

/// Splits a byte stream into strings without cutting multi-byte characters.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        // Truncated sequence at the end; wait for the rest.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

pub(crate) fn spawn_reader_thread(
    mut master_reader: Box<dyn Read + Send>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    session_id: String,
    events: mpsc::Sender<PtyEvent>,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("pty-{}", &session_id[..session_id.len().min(8)]);

    std::thread::Builder::new().name(name).spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut chunker = Utf8Chunker::default();

        loop {
            match master_reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = chunker.push(&buf[..n]);
                    // Blocks while the pump is behind. Once the pump is gone the
                    // send fails and the PTY keeps being drained.
                    if !text.is_empty() {
                        let _ = events.blocking_send(PtyEvent::Output(text));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(session_id = %session_id, error = %e, "PTY read ended");
                    break;
                }
            }
        }

        let tail = chunker.finish();
        if !tail.is_empty() {
            let _ = events.blocking_send(PtyEvent::Output(tail));
        }

        let code = wait_for_exit(&child, &session_id);
        debug!(session_id = %session_id, code = ?code, "PTY process exited");
        let _ = events.blocking_send(PtyEvent::Exit(code));
    })
}

/// Reap the process behind a PTY that reached end of file.
///
/// A process can close its terminal and keep running. After the poll window
/// it is killed, and this only returns once it has been waited for.
fn wait_for_exit(child: &Mutex<Box<dyn Child + Send + Sync>>, session_id: &str) -> Option<i32> {
    for _ in 0..EXIT_POLL_ATTEMPTS {
        match child.lock().try_wait() {
            Ok(Some(status)) => return Some(status.exit_code() as i32),
            Ok(None) => {}
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Polling PTY process failed");
                break;
            }
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    warn!(session_id = %session_id, "PTY closed but its process is still running, killing it");
    let mut child = child.lock();
    // SIGHUP, then SIGKILL if it lingers.
    if let Err(e) = child.kill() {
        debug!(session_id = %session_id, error = %e, "Killing PTY process failed");
    }
    match child.wait() {
        Ok(status) => Some(status.exit_code() as i32),
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "Waiting for PTY process failed");
            None
        }
    }
}
