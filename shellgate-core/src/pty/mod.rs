//! In-process PTY sessions.
//!
//! Each session owns one shell on a pseudo-terminal. A reader thread turns
//! PTY output into [`reader::PtyEvent`] frames and an async pump forwards them
//! to whichever transport is currently bound.

pub mod broker;
pub mod protocol;
mod reader;
pub mod session;
pub mod transport;

pub use broker::{CreateOptions, PtyBroker};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{PtySession, PtySessionInfo};
pub use transport::{
    channel as transport_channel, channel_with_capacity as transport_channel_with_capacity,
    Outbound, TransportHandle, TransportReceiver, TRANSPORT_QUEUE_CAPACITY,
};
