use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};

use super::protocol::ServerMessage;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Frames a client connection may fall behind by before it is dropped.
pub const TRANSPORT_QUEUE_CAPACITY: usize = 1024;

/// A frame travelling from the broker to one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    /// The broker no longer routes this session here; the connection should close.
    Close,
}

/// Close flag shared by both ends. Kept out of the queue so that a full
/// queue can still be closed.
#[derive(Debug, Default)]
struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

/// Broker-side end of a client connection.
///
/// The broker only holds this handle; the connection itself (socket, task) is
/// owned by the transport layer, which drains the paired [`TransportReceiver`].
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: u64,
    tx: mpsc::Sender<ServerMessage>,
    signal: Arc<CloseSignal>,
}

pub struct TransportReceiver {
    id: u64,
    rx: mpsc::Receiver<ServerMessage>,
    signal: Arc<CloseSignal>,
    done: bool,
}

/// Create a fresh transport pair with a process-unique id.
pub fn channel() -> (TransportHandle, TransportReceiver) {
    channel_with_capacity(TRANSPORT_QUEUE_CAPACITY)
}

/// Like [`channel`], with a custom queue depth.
pub fn channel_with_capacity(capacity: usize) -> (TransportHandle, TransportReceiver) {
    let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let signal = Arc::new(CloseSignal::default());
    (
        TransportHandle {
            id,
            tx,
            signal: Arc::clone(&signal),
        },
        TransportReceiver {
            id,
            rx,
            signal,
            done: false,
        },
    )
}

impl TransportHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame without waiting. Returns false once the connection is
    /// closed or gone. A connection whose queue is full is closed on the spot.
    pub fn send(&self, msg: ServerMessage) -> bool {
        if self.signal.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection to close after the frames already queued.
    pub fn close(&self) {
        if !self.signal.closed.swap(true, Ordering::AcqRel) {
            self.signal.notify.notify_one();
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.tx.is_closed() && !self.signal.closed.load(Ordering::Acquire)
    }
}

impl TransportReceiver {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame. Queued messages come first, then a single `Close` if the
    /// handle side closed, then `None`.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            if let Some(next) = self.poll_queue() {
                return next;
            }
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => return Some(Outbound::Message(msg)),
                    None => continue,
                },
                _ = self.signal.notify.notified() => continue,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.poll_queue().flatten()
    }

    /// `Some(frame)` when there is an answer right now, `None` when the
    /// caller has to wait.
    fn poll_queue(&mut self) -> Option<Option<Outbound>> {
        if self.done {
            return Some(None);
        }
        match self.rx.try_recv() {
            Ok(msg) => Some(Some(Outbound::Message(msg))),
            Err(TryRecvError::Empty) if !self.signal.closed.load(Ordering::Acquire) => None,
            Err(TryRecvError::Empty) => {
                self.done = true;
                Some(Some(Outbound::Close))
            }
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                if self.signal.closed.load(Ordering::Acquire) {
                    Some(Some(Outbound::Close))
                } else {
                    Some(None)
                }
            }
        }
    }
}
