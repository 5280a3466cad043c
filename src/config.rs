//! Controller configuration
//!
//! The on-disk document is loosely typed JSON. It is decoded into
//! [`ConfigDocument`] (every field optional) and validated once into
//! [`Settings`] before any component is constructed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::image::ImageReference;

pub const DEFAULT_API_DOMAIN: &str = "api.github.com";
pub const DEFAULT_WEB_DOMAIN: &str = "github.com";
pub const DEFAULT_CONTAINER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_BASE_IMAGE: &str = "Jammy";
pub const DEFAULT_RUNNER_VERSION: &str = "2.322.0";
pub const DEFAULT_LIMIT: usize = 2;
pub const DEFAULT_DOCKERFILES_DIR: &str = "./dockerfiles";
pub const DEFAULT_SECRET_FILE: &str = "./pat.txt";

const RUNNER_RELEASES_URL: &str = "https://github.com/actions/runner/releases/tag";
const USER_AGENT: &str = concat!("runner-pool/", env!("CARGO_PKG_VERSION"));
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw configuration document as written on disk
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub runner: Option<RunnerDocument>,
    pub base_image: Option<String>,
    pub limit: Option<usize>,
    pub labels: Option<Vec<String>>,
    pub container_host: Option<String>,
    pub image_host: Option<String>,
    pub runners_version: Option<String>,
    pub dockerfiles_dir: Option<PathBuf>,
    pub secret_file: Option<PathBuf>,
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunnerDocument {
    pub api_domain: Option<String>,
    pub domain: Option<String>,
    pub owner: Option<String>,
    pub repository: Option<String>,
    pub auth: Option<AuthDocument>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthDocument {
    pub is_app: bool,
    pub access_token: Option<String>,
    #[serde(alias = "App")]
    pub app: Option<AppDocument>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppDocument {
    pub id: u64,
    pub installation_id: u64,
    pub key_path: Option<PathBuf>,
}

/// Where registered runners attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerTarget {
    Organization(String),
    Repository { owner: String, repository: String },
}

impl RunnerTarget {
    pub fn owner(&self) -> &str {
        match self {
            RunnerTarget::Organization(org) => org,
            RunnerTarget::Repository { owner, .. } => owner,
        }
    }

    pub fn repository(&self) -> Option<&str> {
        match self {
            RunnerTarget::Organization(_) => None,
            RunnerTarget::Repository { repository, .. } => Some(repository),
        }
    }
}

impl std::fmt::Display for RunnerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerTarget::Organization(org) => write!(f, "{}", org),
            RunnerTarget::Repository { owner, repository } => write!(f, "{}/{}", owner, repository),
        }
    }
}

/// Authentication material for the CI coordinator
#[derive(Debug)]
pub enum AuthMode {
    /// Long-lived personal access token, never refreshed
    Token(SecretString),
    /// App identity exchanged for short-lived installation tokens
    App {
        app_id: u64,
        installation_id: u64,
        key_path: PathBuf,
    },
}

impl AuthMode {
    pub fn is_app(&self) -> bool {
        matches!(self, AuthMode::App { .. })
    }
}

/// Desired identity and image for every worker. Immutable after load.
#[derive(Debug)]
pub struct RunnerSpec {
    pub target: RunnerTarget,
    pub auth: AuthMode,
    pub labels: Vec<String>,
    pub base_image: String,
    pub image_host: Option<String>,
    pub version: String,
    pub api_domain: String,
    pub web_domain: String,
}

impl RunnerSpec {
    pub fn builder(owner: impl Into<String>, auth: AuthMode) -> RunnerSpecBuilder {
        RunnerSpecBuilder::new(owner, auth)
    }

    pub fn image_reference(&self) -> ImageReference {
        ImageReference::new(self.image_host.as_deref(), &self.base_image, &self.version)
    }

    /// Name of the build definition inside the dockerfiles directory
    pub fn dockerfile_name(&self) -> String {
        format!("Dockerfile{}", self.base_image)
    }
}

/// Desired steady-state number of running workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTarget {
    limit: usize,
}

impl PoolTarget {
    /// Zero falls back to the default limit
    pub fn new(limit: usize) -> Self {
        Self {
            limit: if limit == 0 { DEFAULT_LIMIT } else { limit },
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots left to fill given the number of occupied ones
    pub fn deficit(&self, occupied: usize) -> usize {
        self.limit.saturating_sub(occupied)
    }
}

impl Default for PoolTarget {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

/// Validated controller settings
#[derive(Debug)]
pub struct Settings {
    pub runner: RunnerSpec,
    pub pool: PoolTarget,
    pub container_host: String,
    pub dockerfiles_dir: PathBuf,
    pub secret_file: PathBuf,
    pub drain_timeout: Option<Duration>,
}

impl Settings {
    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let document: ConfigDocument =
            serde_json::from_slice(bytes).map_err(ConfigError::Malformed)?;
        Self::from_document(document)
    }

    /// Single validation pass over a decoded document
    pub fn from_document(document: ConfigDocument) -> Result<Self, ConfigError> {
        let runner = document.runner.ok_or(ConfigError::MissingRunner)?;

        let owner = non_empty(runner.owner).ok_or(ConfigError::MissingOwner)?;
        let auth = validate_auth(runner.auth.ok_or(ConfigError::MissingAuth)?)?;
        let target = match non_empty(runner.repository) {
            Some(repository) => RunnerTarget::Repository { owner, repository },
            None => RunnerTarget::Organization(owner),
        };

        let dockerfiles_dir = document
            .dockerfiles_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKERFILES_DIR));

        let base_image = match non_empty(document.base_image) {
            Some(base) => {
                let dockerfile = dockerfiles_dir.join(format!("Dockerfile{}", base));
                if !dockerfile.is_file() {
                    return Err(ConfigError::MissingDockerfile(dockerfile));
                }
                base
            }
            None => DEFAULT_BASE_IMAGE.to_string(),
        };

        let image_host = match non_empty(document.image_host) {
            Some(host) => Some(validate_image_host(host)?),
            None => None,
        };

        Ok(Self {
            runner: RunnerSpec {
                target,
                auth,
                labels: document.labels.unwrap_or_default(),
                base_image,
                image_host,
                version: non_empty(document.runners_version)
                    .unwrap_or_else(|| DEFAULT_RUNNER_VERSION.to_string()),
                api_domain: non_empty(runner.api_domain)
                    .unwrap_or_else(|| DEFAULT_API_DOMAIN.to_string()),
                web_domain: non_empty(runner.domain)
                    .unwrap_or_else(|| DEFAULT_WEB_DOMAIN.to_string()),
            },
            pool: PoolTarget::new(document.limit.unwrap_or(0)),
            container_host: non_empty(document.container_host)
                .unwrap_or_else(|| DEFAULT_CONTAINER_HOST.to_string()),
            dockerfiles_dir,
            secret_file: document
                .secret_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRET_FILE)),
            drain_timeout: document.drain_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn validate_auth(auth: AuthDocument) -> Result<AuthMode, ConfigError> {
    if !auth.is_app {
        let token = non_empty(auth.access_token).ok_or(ConfigError::MissingAccessToken)?;
        return Ok(AuthMode::Token(SecretString::from(token)));
    }

    let app = auth.app.unwrap_or_default();
    let key_path = app
        .key_path
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or(ConfigError::MissingKeyPath)?;
    if app.id == 0 {
        return Err(ConfigError::MissingAppId);
    }
    if app.installation_id == 0 {
        return Err(ConfigError::MissingInstallationId);
    }

    Ok(AuthMode::App {
        app_id: app.id,
        installation_id: app.installation_id,
        key_path,
    })
}

/// A registry prefix is `host[:port]`, optionally followed by namespace
/// segments (`ghcr.io/myorg`). No scheme, no empty segments.
fn validate_image_host(host: String) -> Result<String, ConfigError> {
    let invalid = host.contains("://")
        || host.chars().any(char::is_whitespace)
        || host.split('/').any(str::is_empty);
    if invalid {
        Err(ConfigError::InvalidImageHost(host))
    } else {
        Ok(host)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// HTTP client shared by the startup checks and the App token exchange
pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    http_client_with_timeout(HTTP_TIMEOUT)
}

fn http_client_with_timeout(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Keep the requested runner version only if its release page exists.
///
/// Any failure to confirm the release falls back to the default version.
pub async fn resolve_runner_version(client: &reqwest::Client, requested: &str) -> String {
    resolve_runner_version_from(client, RUNNER_RELEASES_URL, requested).await
}

async fn resolve_runner_version_from(
    client: &reqwest::Client,
    releases_url: &str,
    requested: &str,
) -> String {
    if requested == DEFAULT_RUNNER_VERSION {
        return requested.to_string();
    }

    let url = format!("{}/v{}", releases_url, requested);
    match client.get(&url).send().await {
        Ok(res) if res.status() == reqwest::StatusCode::OK => requested.to_string(),
        Ok(res) => {
            tracing::warn!(version = %requested, status = %res.status(), fallback = DEFAULT_RUNNER_VERSION, "Runner release not found");
            DEFAULT_RUNNER_VERSION.to_string()
        }
        Err(e) => {
            tracing::warn!(version = %requested, error = %e, fallback = DEFAULT_RUNNER_VERSION, "Can not verify runner release");
            DEFAULT_RUNNER_VERSION.to_string()
        }
    }
}

/// Builder used to assemble a [`RunnerSpec`] without a config document
pub struct RunnerSpecBuilder {
    spec: RunnerSpec,
}

impl RunnerSpecBuilder {
    fn new(owner: impl Into<String>, auth: AuthMode) -> Self {
        Self {
            spec: RunnerSpec {
                target: RunnerTarget::Organization(owner.into()),
                auth,
                labels: Vec::new(),
                base_image: DEFAULT_BASE_IMAGE.to_string(),
                image_host: None,
                version: DEFAULT_RUNNER_VERSION.to_string(),
                api_domain: DEFAULT_API_DOMAIN.to_string(),
                web_domain: DEFAULT_WEB_DOMAIN.to_string(),
            },
        }
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        let owner = self.spec.target.owner().to_string();
        self.spec.target = RunnerTarget::Repository {
            owner,
            repository: repository.into(),
        };
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.spec.labels.push(label.into());
        self
    }

    pub fn base_image(mut self, base: impl Into<String>) -> Self {
        self.spec.base_image = base.into();
        self
    }

    pub fn image_host(mut self, host: impl Into<String>) -> Self {
        self.spec.image_host = Some(host.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.spec.version = version.into();
        self
    }

    pub fn build(self) -> RunnerSpec {
        self.spec
    }
}
