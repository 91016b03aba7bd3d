//! GitHub registry client.
//!
//! Issues short-lived runner registration tokens, lists registered runners
//! and deregisters them. Authentication is the GitHub App flow:
//!
//! ```text
//! RS256 app JWT ─► GET /app/installations (find the configured account)
//!     └► POST /app/installations/{id}/access_tokens ─► installation token
//!         └► POST …/actions/runners/registration-token   (HTTP 201)
//!            GET  …/actions/runners                       (paginated)
//!            DELETE …/actions/runners/{id}                (HTTP 204)
//! ```
//!
//! Account-scoped runners exist only for organizations; a user account must
//! configure a repository scope.

pub mod mock;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

const API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// App JWTs are backdated against clock skew and kept under GitHub's ten
/// minute ceiling.
const JWT_BACKDATE_SECS: i64 = 60;
const JWT_LIFETIME_SECS: i64 = 540;

/// Installation tokens last an hour; refresh this long before expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

const RUNNERS_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read GitHub App private key at {path}")]
    PrivateKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to sign GitHub App JWT")]
    Jwt(#[source] jsonwebtoken::errors::Error),
    #[error("GitHub API request failed during {operation}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("GitHub API returned {status} during {operation}: {body}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("GitHub App is not installed on account {account}")]
    NoInstallation { account: String },
    #[error("account-scoped runners require an organization; user accounts must set github.repo")]
    AccountScopeUnsupported,
}

/// A registration token and its server-side expiry.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A runner as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerRecord {
    pub id: u64,
    pub name: String,
    /// `online`, `offline` or `idle` as reported by the registry.
    pub status: String,
}

/// Registry operations the pool depends on. Safe for concurrent calls.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn issue_registration_token(&self) -> Result<RegistrationToken, IdentityError>;

    /// Every registered runner in the configured scope, paginated to
    /// completion.
    async fn list_runners(&self) -> Result<Vec<RunnerRecord>, IdentityError>;

    async fn deregister_runner(&self, id: u64) -> Result<(), IdentityError>;
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
    account: InstallationAccount,
}

#[derive(Deserialize)]
struct InstallationAccount {
    login: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RunnersPage {
    total_count: usize,
    runners: Vec<RunnerRecord>,
}

pub struct GithubClient {
    config: Config,
    http: reqwest::Client,
    /// Cached installation token; installation tokens are valid for an hour
    /// and the monitor fleet would otherwise mint one per health tick.
    cached_token: Mutex<Option<AccessToken>>,
}

impl GithubClient {
    pub fn new(config: Config) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("hyperv-runner-pool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| IdentityError::Http {
                operation: "build HTTP client",
                source,
            })?;
        Ok(Self {
            config,
            http,
            cached_token: Mutex::new(None),
        })
    }

    /// URL under which this scope's runner collection lives.
    fn runners_url(&self) -> Result<String, IdentityError> {
        let account = self
            .config
            .github
            .account()
            .ok_or(IdentityError::AccountScopeUnsupported)?;
        match &self.config.github.repo {
            Some(repo) => Ok(format!("{API_BASE}/repos/{account}/{repo}/actions/runners")),
            None if self.config.github.org.is_some() => {
                Ok(format!("{API_BASE}/orgs/{account}/actions/runners"))
            }
            // A user account with no repository cannot host runners.
            None => Err(IdentityError::AccountScopeUnsupported),
        }
    }

    fn app_jwt(&self) -> Result<String, IdentityError> {
        let key_path = self
            .config
            .github
            .app_private_key_path
            .clone()
            .unwrap_or_default();
        let pem = std::fs::read(&key_path).map_err(|source| IdentityError::PrivateKey {
            path: key_path,
            source,
        })?;
        let key = EncodingKey::from_rsa_pem(&pem).map_err(IdentityError::Jwt)?;

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - JWT_BACKDATE_SECS,
            exp: now + JWT_LIFETIME_SECS,
            iss: self.config.github.app_id.unwrap_or_default().to_string(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(IdentityError::Jwt)
    }

    /// Exchange the app JWT for an installation access token, reusing a
    /// cached token while it is comfortably within its lifetime.
    async fn installation_token(&self) -> Result<String, IdentityError> {
        {
            let cached = self.cached_token.lock().expect("token cache mutex poisoned");
            if let Some(token) = cached.as_ref() {
                let remaining = token.expires_at.timestamp() - Utc::now().timestamp();
                if remaining > TOKEN_REFRESH_MARGIN_SECS {
                    return Ok(token.token.clone());
                }
            }
        }

        let jwt = self.app_jwt()?;
        let account = self
            .config
            .github
            .account()
            .ok_or(IdentityError::AccountScopeUnsupported)?;

        let operation = "list app installations";
        let resp = self
            .http
            .get(format!("{API_BASE}/app/installations?per_page=100"))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|source| IdentityError::Http { operation, source })?;
        let installations: Vec<Installation> = expect_json(resp, operation, 200).await?;

        let installation = installations
            .into_iter()
            .find(|inst| inst.account.login == account)
            .ok_or_else(|| IdentityError::NoInstallation {
                account: account.to_string(),
            })?;

        if installation.account.kind == "User" && self.config.github.repo.is_none() {
            return Err(IdentityError::AccountScopeUnsupported);
        }
        debug!(
            installation_id = installation.id,
            account,
            account_type = %installation.account.kind,
            "found GitHub App installation"
        );

        let operation = "create installation access token";
        let resp = self
            .http
            .post(format!(
                "{API_BASE}/app/installations/{}/access_tokens",
                installation.id
            ))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|source| IdentityError::Http { operation, source })?;
        let token: AccessToken = expect_json(resp, operation, 201).await?;

        let value = token.token.clone();
        *self.cached_token.lock().expect("token cache mutex poisoned") = Some(token);
        Ok(value)
    }
}

#[async_trait]
impl IdentityClient for GithubClient {
    async fn issue_registration_token(&self) -> Result<RegistrationToken, IdentityError> {
        let url = format!("{}/registration-token", self.runners_url()?);
        let token = self.installation_token().await?;

        let operation = "create runner registration token";
        let resp = self
            .http
            .post(url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|source| IdentityError::Http { operation, source })?;
        let registration: RegistrationToken = expect_json(resp, operation, 201).await?;

        debug!(expires_at = %registration.expires_at, "generated runner registration token");
        Ok(registration)
    }

    async fn list_runners(&self) -> Result<Vec<RunnerRecord>, IdentityError> {
        let base = self.runners_url()?;
        let token = self.installation_token().await?;

        let operation = "list registered runners";
        let mut runners = Vec::new();
        for page in 1.. {
            let resp = self
                .http
                .get(format!("{base}?per_page={RUNNERS_PAGE_SIZE}&page={page}"))
                .bearer_auth(&token)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", API_VERSION)
                .send()
                .await
                .map_err(|source| IdentityError::Http { operation, source })?;
            let body: RunnersPage = expect_json(resp, operation, 200).await?;

            let fetched = body.runners.len();
            runners.extend(body.runners);
            if runners.len() >= body.total_count || fetched == 0 {
                break;
            }
        }
        Ok(runners)
    }

    async fn deregister_runner(&self, id: u64) -> Result<(), IdentityError> {
        let url = format!("{}/{id}", self.runners_url()?);
        let token = self.installation_token().await?;

        let operation = "deregister runner";
        let resp = self
            .http
            .delete(url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|source| IdentityError::Http { operation, source })?;

        let status = resp.status().as_u16();
        if status != 204 {
            let body = resp.text().await.unwrap_or_default();
            return Err(IdentityError::UnexpectedStatus {
                operation,
                status,
                body,
            });
        }
        Ok(())
    }
}

/// Check the status code and decode the JSON body, folding both failure
/// shapes into [`IdentityError`].
async fn expect_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    operation: &'static str,
    expected: u16,
) -> Result<T, IdentityError> {
    let status = resp.status().as_u16();
    if status != expected {
        let body = resp.text().await.unwrap_or_default();
        return Err(IdentityError::UnexpectedStatus {
            operation,
            status,
            body,
        });
    }
    resp.json()
        .await
        .map_err(|source| IdentityError::Http { operation, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn client_for(yaml: &str) -> GithubClient {
        GithubClient::new(Config::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn runners_url_uses_org_endpoint_for_account_scope() {
        let client = client_for("github:\n  org: acme\ndebug:\n  use_mock: true\n");
        assert_eq!(
            client.runners_url().unwrap(),
            "https://api.github.com/orgs/acme/actions/runners"
        );
    }

    #[test]
    fn runners_url_uses_repo_endpoint_when_repo_is_configured() {
        let client =
            client_for("github:\n  org: acme\n  repo: widgets\ndebug:\n  use_mock: true\n");
        assert_eq!(
            client.runners_url().unwrap(),
            "https://api.github.com/repos/acme/widgets/actions/runners"
        );
    }

    #[test]
    fn runners_url_rejects_user_account_without_repo() {
        let client =
            client_for("github:\n  user: somebody\n  repo: widgets\ndebug:\n  use_mock: true\n");
        // Repo scope works for user accounts…
        assert!(client.runners_url().is_ok());

        let mut config = client.config.clone();
        config.github.repo = None;
        let client = GithubClient::new(config).unwrap();
        // …but an account scope does not.
        assert!(matches!(
            client.runners_url(),
            Err(IdentityError::AccountScopeUnsupported)
        ));
    }

    #[test]
    fn runner_record_parses_registry_json() {
        let page: RunnersPage = serde_json::from_str(
            r#"{
                "total_count": 2,
                "runners": [
                    {"id": 11, "name": "runner-1", "os": "windows", "status": "online", "busy": false},
                    {"id": 12, "name": "runner-2", "os": "windows", "status": "offline", "busy": false}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.runners[0].id, 11);
        assert_eq!(page.runners[0].status, "online");
        assert_eq!(page.runners[1].name, "runner-2");
    }

    #[test]
    fn registration_token_parses_issue_response() {
        let token: RegistrationToken = serde_json::from_str(
            r#"{"token": "AABBCC", "expires_at": "2026-08-02T12:30:00Z"}"#,
        )
        .unwrap();
        assert_eq!(token.token, "AABBCC");
        assert_eq!(token.expires_at.to_rfc3339(), "2026-08-02T12:30:00+00:00");
    }
}
