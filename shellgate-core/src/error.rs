//! Error types for the Shellgate core library.
//!
//! Broker failures are returned as values, never thrown across the
//! process/transport boundary. The request layer maps them to responses.
//!
//! # Error Codes Reference
//!
//! | Code Range | Category | Description |
//! |------------|----------|-------------|
//! | E1001-E1099 | Session | PTY session lookup and capacity errors |
//! | E2001-E2099 | Helper | External helper availability and port pool errors |
//! | E3001-E3099 | Process | Process and PTY creation errors |
//! | E9001-E9099 | General | Validation, IO, and internal errors |

use thiserror::Error;

/// The main error type for the Shellgate core library.
#[derive(Debug, Error)]
pub enum ShellgateError {
    // ========================================================================
    // Session Errors (E1001-E1099)
    // ========================================================================
    /// Unknown, closed, or evicted session
    #[error("[E1001] Session not found: {0}")]
    SessionNotFound(String),

    /// The broker already holds its maximum number of sessions
    #[error("[E1002] Maximum session limit reached ({0})")]
    SessionLimitReached(usize),

    // ========================================================================
    // Helper Errors (E2001-E2099)
    // ========================================================================
    /// Helper executable is not installed on the host
    #[error("[E2001] Terminal helper unavailable: {0}")]
    HelperUnavailable(String),

    /// Every port in the helper pool is taken
    #[error("[E2002] No free port in range {base}-{last}")]
    PoolExhausted { base: u16, last: u16 },

    // ========================================================================
    // Process Errors (E3001-E3099)
    // ========================================================================
    /// Creating a PTY or child process failed
    #[error("[E3001] Failed to spawn {what}: {message}")]
    SpawnFailed { what: String, message: String },

    // ========================================================================
    // General Errors (E9001-E9099)
    // ========================================================================
    /// Rejected before any resource was allocated
    #[error("[E9001] Invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error
    #[error("[E9002] IO error: {0}")]
    Io(String),

    /// Internal error (catch-all for unexpected conditions)
    #[error("[E9003] Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Shellgate operations.
pub type ShellgateResult<T> = Result<T, ShellgateError>;

impl ShellgateError {
    pub fn spawn_failed(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ShellgateError::SpawnFailed {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Returns true for the expected "nothing there" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShellgateError::SessionNotFound(_))
    }

    /// Returns true if this error is transient and the call might succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShellgateError::PoolExhausted { .. } | ShellgateError::SessionLimitReached(_)
        )
    }

    /// Returns an error code suitable for logging or external reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            ShellgateError::SessionNotFound(_) => "E1001",
            ShellgateError::SessionLimitReached(_) => "E1002",
            ShellgateError::HelperUnavailable(_) => "E2001",
            ShellgateError::PoolExhausted { .. } => "E2002",
            ShellgateError::SpawnFailed { .. } => "E3001",
            ShellgateError::InvalidArgument(_) => "E9001",
            ShellgateError::Io(_) => "E9002",
            ShellgateError::Internal(_) => "E9003",
        }
    }
}

impl From<std::io::Error> for ShellgateError {
    fn from(err: std::io::Error) -> Self {
        ShellgateError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ShellgateError::SessionNotFound("x".into()).error_code(),
            "E1001"
        );
        assert_eq!(
            ShellgateError::PoolExhausted {
                base: 7681,
                last: 7700
            }
            .error_code(),
            "E2002"
        );
        assert_eq!(
            ShellgateError::spawn_failed("shell", "no such file").error_code(),
            "E3001"
        );
    }

    #[test]
    fn test_display_carries_code() {
        let err = ShellgateError::HelperUnavailable("ttyd not found".into());
        assert_eq!(
            err.to_string(),
            "[E2001] Terminal helper unavailable: ttyd not found"
        );
    }

    #[test]
    fn test_categories() {
        assert!(ShellgateError::SessionNotFound("a".into()).is_not_found());
        assert!(!ShellgateError::Internal("a".into()).is_not_found());
        assert!(ShellgateError::PoolExhausted { base: 1, last: 2 }.is_transient());
        assert!(!ShellgateError::InvalidArgument("cols".into()).is_transient());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ShellgateError = io.into();
        assert!(matches!(err, ShellgateError::Io(ref m) if m == "gone"));
    }
}
