//! Local PAT file bind-mounted read-only into every worker

use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `token` (replacing any previous content) and return the absolute path
    pub fn write(&self, token: &SecretString) -> Result<PathBuf> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .map_err(|e| Error::filesystem(&self.path, e))?;
        file.write_all(token.expose_secret().as_bytes())
            .map_err(|e| Error::filesystem(&self.path, e))?;

        std::path::absolute(&self.path).map_err(|e| Error::filesystem(&self.path, e))
    }

    /// Delete the file; a missing file is not an error
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Removed secret file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::filesystem(&self.path, e)),
        }
    }
}
