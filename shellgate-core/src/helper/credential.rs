use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

/// Basic-auth pair handed to one helper instance.
pub struct HelperCredential {
    username: String,
    password: SecretString,
}

/// Plain form of a credential, for the one response that hands it to the client.
#[derive(Serialize, Clone, PartialEq, Eq)]
pub struct HelperAuth {
    pub username: String,
    pub password: String,
}

impl HelperCredential {
    /// A fresh credential with a random 128-bit password.
    pub fn generate(username: impl Into<String>) -> Self {
        let password = uuid::Uuid::new_v4().simple().to_string();
        Self {
            username: username.into(),
            password: SecretString::from(password),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `user:password`, the form the helper's `-c` flag expects.
    pub(crate) fn basic_auth_arg(&self) -> String {
        format!("{}:{}", self.username, self.password.expose_secret())
    }

    pub fn to_auth(&self) -> HelperAuth {
        HelperAuth {
            username: self.username.clone(),
            password: self.password.expose_secret().to_string(),
        }
    }
}

impl fmt::Debug for HelperCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperCredential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for HelperAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passwords_are_fresh() {
        let a = HelperCredential::generate("admin");
        let b = HelperCredential::generate("admin");
        assert_ne!(a.to_auth().password, b.to_auth().password);
        assert_eq!(a.to_auth().password.len(), 32);
    }

    #[test]
    fn test_debug_is_redacted() {
        let credential = HelperCredential::generate("admin");
        let password = credential.to_auth().password;

        let debug = format!("{:?}", credential);
        assert!(debug.contains("admin"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&password));

        let auth_debug = format!("{:?}", credential.to_auth());
        assert!(!auth_debug.contains(&password));
    }

    #[test]
    fn test_basic_auth_arg() {
        let credential = HelperCredential::generate("ops");
        let arg = credential.basic_auth_arg();
        let (user, pass) = arg.split_once(':').unwrap();
        assert_eq!(user, "ops");
        assert_eq!(pass, credential.to_auth().password);
    }
}
