//! Token sources injected into the history loader and the transport channel.

use std::path::PathBuf;

use tracing::debug;

pub trait CredentialStore: Send + Sync {
    /// Current bearer token, if the user is signed in.
    fn token(&self) -> Option<String>;
}

/// A token fixed at construction (CLI flag, env var, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

impl CredentialStore for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Reads the token file on every call so a re-login is picked up without
/// restarting.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialStore for FileCredentials {
    fn token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Some(raw.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no token file");
                None
            }
        }
    }
}
