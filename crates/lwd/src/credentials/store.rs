use std::path::{Path, PathBuf};

use lw_core::Credential;
use tracing::{debug, info, warn};

use super::CredentialError;
use crate::persist::{read_json, restrict_permissions, write_json_atomic};

/// File-based storage for the user credential: `{"token": ..., "expires_at": ...}`.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored credential, if any.
    ///
    /// An unreadable file is logged and treated as absent: the operator
    /// can always re-authorize.
    pub fn load(&self) -> Option<Credential> {
        match read_json::<Credential>(&self.path) {
            Ok(Some(credential)) => {
                debug!(path = %self.path.display(), expires_at = %credential.expires_at, "User credential loaded");
                Some(credential)
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "No stored user credential");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Stored user credential unreadable");
                None
            }
        }
    }

    /// Overwrites the stored credential.
    ///
    /// # Errors
    ///
    /// `CredentialError::Persist` if the file cannot be written.
    pub fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        let persist_err = |e: std::io::Error| CredentialError::Persist {
            path: self.path.clone(),
            message: e.to_string(),
        };

        write_json_atomic(&self.path, credential).map_err(persist_err)?;
        restrict_permissions(&self.path).map_err(persist_err)?;

        info!(path = %self.path.display(), expires_at = %credential.expires_at, "User credential saved");
        Ok(())
    }
}
