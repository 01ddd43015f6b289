//! External helper terminal servers (`ttyd` and compatibles), one per port.

mod broker;
mod credential;
pub mod discovery;
mod ports;

pub use broker::{HelperBroker, HelperInfo, HelperLaunch};
pub use credential::{HelperAuth, HelperCredential};
pub use discovery::HeuristicMatch;
