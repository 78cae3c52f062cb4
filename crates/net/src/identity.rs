//! Stored user identity
//!
//! The logged-in user's identity is kept in a small JSON file and read
//! once when a discussion is opened.

use std::path::Path;

use agora_core::Participant;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
        }
    }

    /// Read the identity file. A missing, empty or unusable file is
    /// reported as [`Error::IdentityMissing`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::IdentityMissing(path.display().to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if text.trim().is_empty() {
            return Err(Error::IdentityMissing(path.display().to_string()));
        }

        let identity: Self = serde_json::from_str(&text)
            .map_err(|e| Error::IdentityMissing(format!("{}: {}", path.display(), e)))?;

        if identity.id.is_nil() || identity.name.trim().is_empty() {
            return Err(Error::IdentityMissing(format!(
                "{}: incomplete identity",
                path.display()
            )));
        }

        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn participant(&self) -> Participant {
        Participant::new(self.id, self.name.clone()).with_email(self.email.clone())
    }
}
