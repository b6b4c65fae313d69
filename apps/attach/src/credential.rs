//! The long-lived bearer credential kept between runs, and the policy that
//! decides when a rejected credential is really dead.

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::AttachError;

/// A second 401 must come at least this long after the first before the
/// stored credential is dropped.
pub const CONFIRM_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Unix millis of the first unconfirmed 401.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspect_since_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthorizedVerdict {
    /// First rejection; the credential is kept.
    Suspect,
    /// Rejected again after the confirmation interval; the credential is gone.
    Confirmed,
    NoCredential,
}

impl StoredCredential {
    pub fn record_unauthorized(&mut self, now_ms: u64, confirm_after: Duration) -> UnauthorizedVerdict {
        if self.token.is_none() {
            self.suspect_since_ms = None;
            return UnauthorizedVerdict::NoCredential;
        }
        match self.suspect_since_ms {
            Some(since) if now_ms.saturating_sub(since) >= confirm_after.as_millis() as u64 => {
                self.token = None;
                self.suspect_since_ms = None;
                UnauthorizedVerdict::Confirmed
            }
            Some(_) => UnauthorizedVerdict::Suspect,
            None => {
                self.suspect_since_ms = Some(now_ms);
                UnauthorizedVerdict::Suspect
            }
        }
    }

    /// Clears any suspicion. Returns whether anything changed.
    pub fn record_success(&mut self) -> bool {
        self.suspect_since_ms.take().is_some()
    }
}

pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Result<Self, AttachError> {
        let base = BaseDirs::new()
            .ok_or_else(|| AttachError::Credential("unable to determine home directory".into()))?;
        Ok(Self::at(base.home_dir().join(".attach").join("credentials")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoredCredential, AttachError> {
        if !self.path.exists() {
            return Ok(StoredCredential::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, credential: &StoredCredential) -> Result<(), AttachError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string_pretty(credential)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }

    pub fn clear(&self) -> Result<bool, AttachError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Applies a 401 to the stored credential and persists the outcome.
    pub fn note_unauthorized(&self, now_ms: u64) -> Result<UnauthorizedVerdict, AttachError> {
        let mut stored = self.load()?;
        let verdict = stored.record_unauthorized(now_ms, CONFIRM_AFTER);
        match verdict {
            UnauthorizedVerdict::Suspect => {
                warn!(path = %self.path.display(), "stored credential rejected; keeping it until confirmed")
            }
            UnauthorizedVerdict::Confirmed => {
                info!(path = %self.path.display(), "stored credential rejected twice; removed")
            }
            UnauthorizedVerdict::NoCredential => return Ok(verdict),
        }
        self.save(&stored)?;
        Ok(verdict)
    }

    pub fn note_success(&self) -> Result<(), AttachError> {
        let mut stored = self.load()?;
        if stored.record_success() {
            self.save(&stored)?;
        }
        Ok(())
    }
}

pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
