//! Error types for the runner pool controller

use std::path::PathBuf;
use thiserror::Error;

/// Validation failures of the configuration document.
///
/// The set is closed: every way a document can be rejected maps to exactly
/// one variant, and all of them are fatal before the control loop starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {} is not readable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is invalid: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("runner is required")]
    MissingRunner,

    #[error("owner is required")]
    MissingOwner,

    #[error("auth is required")]
    MissingAuth,

    #[error("auth is invalid: access_token is required")]
    MissingAccessToken,

    #[error("auth is invalid: key_path is required")]
    MissingKeyPath,

    #[error("auth is invalid: app.id is required")]
    MissingAppId,

    #[error("auth is invalid: app.installation_id is required")]
    MissingInstallationId,

    #[error("can not find {}", .0.display())]
    MissingDockerfile(PathBuf),

    #[error("invalid image host {0:?}")]
    InvalidImageHost(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential exchange failed: {0}")]
    AuthExchange(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a filesystem error for a specific path
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Errors that must stop the process before the control loop starts
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::AuthExchange(_) | Error::Build(_)
        )
    }
}
