use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{AuthError, Credentials};

/// Persistence abstraction for authentication credentials.
///
/// `load` returns `Ok(None)` for every kind of unusable record (absent file,
/// unreadable file, malformed JSON) so callers can treat it like "never
/// authenticated".
pub trait CredentialStore {
    fn load(&self) -> Result<Option<Credentials>, AuthError>;
    fn save(&self, credentials: &Credentials) -> Result<(), AuthError>;
    fn delete(&self) -> Result<(), AuthError>;
}

/// JSON file holding a single credential record.
///
/// Writers are not coordinated across processes; when two invocations save
/// concurrently the last write wins.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(path: &Path, payload: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(payload.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o600);
            fs::set_permissions(path, perm)?;
        }

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credentials>, AuthError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no credentials file");
                return Ok(None);
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "credentials file unreadable");
                return Ok(None);
            }
        };
        match serde_json::from_str::<Credentials>(&raw) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring malformed credentials file");
                Ok(None)
            }
        }
    }

    fn save(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let payload = serde_json::to_string_pretty(credentials)?;
        Self::write_file(&self.path, &payload).map_err(AuthError::Persistence)?;
        debug!(path = %self.path.display(), "credentials saved");
        Ok(())
    }

    fn delete(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
