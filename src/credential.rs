//! Credential lifecycle for registering workers with the CI coordinator
//!
//! Two modes exist. A static personal access token never expires and is never
//! refreshed. An App installation token is minted by exchanging a signed JWT
//! for a short-lived token and is refreshed lazily: only when a caller asks
//! for the credential after its expiry has passed. There is no timer.
//!
//! The manager is owned by the single control loop and mutated through
//! `&mut self`, so no lock guards the token/expiry pair.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::{self, AuthMode};
use crate::{Error, Result};

/// Active access credential
#[derive(Debug)]
pub enum Credential {
    Static(SecretString),
    Installation {
        token: SecretString,
        expires_at: DateTime<Utc>,
    },
}

impl Credential {
    pub fn token(&self) -> &SecretString {
        match self {
            Credential::Static(token) => token,
            Credential::Installation { token, .. } => token,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credential::Static(_) => None,
            Credential::Installation { expires_at, .. } => Some(*expires_at),
        }
    }

    /// True only for a present expiry strictly before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at(), Some(expires_at) if expires_at < now)
    }
}

/// Mints installation tokens
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<Credential>;

    fn name(&self) -> &'static str;
}

/// Owns the current credential and decides when to refresh it
pub struct CredentialManager {
    issuer: Option<Arc<dyn TokenIssuer>>,
    current: Credential,
}

impl CredentialManager {
    /// Static-token mode
    pub fn from_static(token: SecretString) -> Self {
        Self {
            issuer: None,
            current: Credential::Static(token),
        }
    }

    /// Exchange mode; performs the initial exchange immediately
    pub async fn acquire(issuer: Arc<dyn TokenIssuer>) -> Result<Self> {
        let current = issuer.issue().await?;
        tracing::info!(issuer = issuer.name(), expires_at = ?current.expires_at(), "Credential acquired");
        Ok(Self {
            issuer: Some(issuer),
            current,
        })
    }

    /// Build the manager matching the configured auth mode
    pub async fn for_auth(auth: &AuthMode, api_domain: &str) -> Result<Self> {
        match auth {
            AuthMode::Token(token) => Ok(Self::from_static(SecretString::from(
                token.expose_secret().to_string(),
            ))),
            AuthMode::App {
                app_id,
                installation_id,
                key_path,
            } => {
                let issuer = GitHubAppIssuer::from_key_file(*app_id, *installation_id, key_path, api_domain)?;
                Self::acquire(Arc::new(issuer)).await
            }
        }
    }

    /// Whether [`current_credential`](Self::current_credential) would refresh at `now`
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.current.is_expired_at(now)
    }

    /// The active credential, refreshed first if its expiry has passed
    pub async fn current_credential(&mut self) -> Result<&Credential> {
        if self.needs_refresh(Utc::now()) {
            tracing::info!(expired_at = ?self.current.expires_at(), "Credential expired, refreshing");
            self.refresh().await?;
        }
        Ok(&self.current)
    }

    /// Exchange for a new installation token; a no-op for static tokens.
    ///
    /// On failure the previous credential stays in place and the error is
    /// returned to the caller.
    pub async fn refresh(&mut self) -> Result<()> {
        let Some(issuer) = &self.issuer else {
            return Ok(());
        };

        let credential = issuer.issue().await?;
        tracing::info!(issuer = issuer.name(), expires_at = ?credential.expires_at(), "Credential refreshed");
        self.current = credential;
        Ok(())
    }
}


/// Installation token issuer using the App JWT exchange
pub struct GitHubAppIssuer {
    app_id: u64,
    installation_id: u64,
    private_key: SecretString,
    api_base_url: String,
    http: reqwest::Client,
}

impl GitHubAppIssuer {
    pub fn new(
        app_id: u64,
        installation_id: u64,
        private_key: SecretString,
        api_domain: &str,
    ) -> Result<Self> {
        if private_key.expose_secret().trim().is_empty() {
            return Err(Error::AuthExchange("private key is empty".into()));
        }

        let http = config::http_client().map_err(|e| Error::AuthExchange(e.to_string()))?;

        Ok(Self {
            app_id,
            installation_id,
            private_key,
            api_base_url: api_base_url(api_domain),
            http,
        })
    }

    /// Load the PEM private key from disk
    pub fn from_key_file(
        app_id: u64,
        installation_id: u64,
        key_path: &Path,
        api_domain: &str,
    ) -> Result<Self> {
        let pem = std::fs::read_to_string(key_path).map_err(|e| {
            Error::AuthExchange(format!("can not read private key {}: {}", key_path.display(), e))
        })?;
        Self::new(app_id, installation_id, SecretString::from(pem), api_domain)
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base_url, self.installation_id
        )
    }

    fn generate_jwt(&self, now: i64) -> Result<String> {
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.to_string(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| Error::AuthExchange(format!("invalid private key: {}", e)))?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| Error::AuthExchange(format!("can not sign JWT: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl TokenIssuer for GitHubAppIssuer {
    async fn issue(&self) -> Result<Credential> {
        let jwt = self.generate_jwt(Utc::now().timestamp())?;

        let response = self
            .http
            .post(self.endpoint())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| Error::AuthExchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read token response body".to_string());
            return Err(Error::AuthExchange(format!("HTTP {}: {}", status, body)));
        }

        let payload: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::AuthExchange(format!("invalid token response: {}", e)))?;

        Ok(Credential::Installation {
            token: SecretString::from(payload.token),
            expires_at: payload.expires_at,
        })
    }

    fn name(&self) -> &'static str {
        "github-app"
    }
}

/// `api.github.com` and Enterprise API hosts are both addressed over HTTPS
fn api_base_url(api_domain: &str) -> String {
    let domain = api_domain.trim_end_matches('/');
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("https://{}", domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn installation(token: &str, expires_at: DateTime<Utc>) -> Credential {
        Credential::Installation {
            token: SecretString::from(token.to_string()),
            expires_at,
        }
    }

    fn issuer_returning(token: &'static str, ttl: ChronoDuration, times: usize) -> MockTokenIssuer {
        let mut issuer = MockTokenIssuer::new();
        issuer
            .expect_issue()
            .times(times)
            .returning(move || Ok(installation(token, Utc::now() + ttl)));
        issuer.expect_name().return_const("mock");
        issuer
    }

    #[test]
    fn test_expiry_is_strict() {
        let now = Utc::now();
        assert!(installation("t", now - ChronoDuration::seconds(1)).is_expired_at(now));
        assert!(!installation("t", now).is_expired_at(now));
        assert!(!installation("t", now + ChronoDuration::minutes(5)).is_expired_at(now));
        assert!(!Credential::Static(SecretString::from("t")).is_expired_at(now));
    }

    #[tokio::test]
    async fn test_static_token_never_refreshes() {
        let mut manager = CredentialManager::from_static(SecretString::from("ghp_static"));
        assert!(!manager.needs_refresh(Utc::now() + ChronoDuration::days(3650)));

        let credential = manager.current_credential().await.unwrap();
        assert_eq!(credential.token().expose_secret(), "ghp_static");
        assert!(credential.expires_at().is_none());

        manager.refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_token_is_reused() {
        // One issue for the initial acquisition only
        let issuer = issuer_returning("ghs_one", ChronoDuration::hours(1), 1);
        let mut manager = CredentialManager::acquire(Arc::new(issuer)).await.unwrap();

        for _ in 0..3 {
            let credential = manager.current_credential().await.unwrap();
            assert_eq!(credential.token().expose_secret(), "ghs_one");
        }
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let issuer = issuer_returning("ghs_new", ChronoDuration::hours(1), 1);
        let mut manager = CredentialManager {
            issuer: Some(Arc::new(issuer)),
            current: installation("ghs_old", Utc::now() - ChronoDuration::minutes(1)),
        };

        let credential = manager.current_credential().await.unwrap();
        assert_eq!(credential.token().expose_secret(), "ghs_new");
        assert!(!manager.needs_refresh(Utc::now()));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_credential() {
        let mut issuer = MockTokenIssuer::new();
        issuer
            .expect_issue()
            .times(1)
            .returning(|| Err(Error::AuthExchange("HTTP 401".into())));
        issuer.expect_name().return_const("mock");

        let mut manager = CredentialManager {
            issuer: Some(Arc::new(issuer)),
            current: installation("ghs_old", Utc::now() - ChronoDuration::minutes(1)),
        };

        let err = manager.current_credential().await.unwrap_err();
        assert!(matches!(err, Error::AuthExchange(_)));
        assert_eq!(manager.current.token().expose_secret(), "ghs_old");
    }

    #[tokio::test]
    async fn test_initial_exchange_failure() {
        let mut issuer = MockTokenIssuer::new();
        issuer
            .expect_issue()
            .returning(|| Err(Error::AuthExchange("bad key".into())));
        issuer.expect_name().return_const("mock");

        let result = CredentialManager::acquire(Arc::new(issuer)).await;
        assert!(matches!(result, Err(Error::AuthExchange(_))));
    }

    #[test]
    fn test_endpoint() {
        let issuer = GitHubAppIssuer::new(1, 42, SecretString::from("-----BEGIN"), "api.github.com").unwrap();
        assert_eq!(issuer.endpoint(), "https://api.github.com/app/installations/42/access_tokens");

        let issuer = GitHubAppIssuer::new(1, 7, SecretString::from("k"), "https://ghe.example.com/api/v3/").unwrap();
        assert_eq!(issuer.endpoint(), "https://ghe.example.com/api/v3/app/installations/7/access_tokens");
    }

    #[test]
    fn test_unreadable_key_file() {
        let result = GitHubAppIssuer::from_key_file(1, 2, Path::new("/nonexistent/key.pem"), "api.github.com");
        assert!(matches!(result, Err(Error::AuthExchange(_))));
    }

    #[test]
    fn test_invalid_pem_fails_jwt() {
        let issuer = GitHubAppIssuer::new(1, 2, SecretString::from("not a pem"), "api.github.com").unwrap();
        assert!(matches!(issuer.generate_jwt(1_700_000_000), Err(Error::AuthExchange(_))));
    }
}
