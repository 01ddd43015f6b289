//! Remote terminal access for a browser-based server console.
//!
//! Two independent strategies give a client a shell on the host:
//! [`PtyBroker`] owns shells on in-process pseudo-terminals (supervised by
//! the [`Reaper`]), while [`HelperBroker`] runs an external helper terminal
//! server per session on its own loopback port.

pub mod config;
pub mod error;
pub mod helper;
pub mod pty;
pub mod reaper;

pub use config::{
    get_config_dir, ConfigLoadError, HelperConfig, LoggingConfig, ReaperConfig, ServerConfig,
    ShellgateConfig, TerminalConfig,
};
pub use error::{ShellgateError, ShellgateResult};
pub use helper::{HelperAuth, HelperBroker, HelperCredential, HelperInfo, HelperLaunch, HeuristicMatch};
pub use pty::{
    transport_channel, transport_channel_with_capacity, ClientMessage, CreateOptions, Outbound,
    PtyBroker, PtySession, PtySessionInfo, ServerMessage, TransportHandle, TransportReceiver,
    TRANSPORT_QUEUE_CAPACITY,
};
pub use reaper::{Eviction, EvictionReason, Reaper, ReaperHandle};
