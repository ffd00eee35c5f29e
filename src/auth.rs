//! Session and authentication providers
//!
//! Two providers exist: no authentication, where the session is an opaque
//! client-chosen id, and GitHub OAuth, where the session is an access token
//! obtained through the code-exchange flow. Repo visibility decisions for
//! the authenticated variant are cached per token with separate allow and
//! deny lifetimes.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::pool::now_secs;

/// How long a positive repo-visibility decision is cached.
pub const REPO_ALLOWED_TTL_SECONDS: i64 = 20 * 60;
/// How long a negative repo-visibility decision is cached.
pub const REPO_DENIED_TTL_SECONDS: i64 = 5 * 60;

const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_URL: &str = "https://api.github.com/user";

/// An authenticated client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub access_token: String,
    pub email: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Exchange an OAuth code for a user record.
    async fn exchange_code(&self, code: &str) -> Result<User>;

    /// Validate an access token and produce the user holding it.
    async fn login_user(&self, access_token: &str) -> Result<User>;

    /// Whether the user may view the repository.
    async fn user_can_view_repo(&self, user: &User, repo: &str) -> Result<bool>;
}

/// Known sessions, keyed by access token.
#[derive(Default)]
pub struct SessionRegistry {
    users: RwLock<HashMap<String, User>>,
}

impl SessionRegistry {
    pub async fn get(&self, access_token: &str) -> Option<User> {
        self.users.read().await.get(access_token).cloned()
    }

    pub async fn insert(&self, user: User) {
        self.users
            .write()
            .await
            .insert(user.access_token.clone(), user);
    }

    pub async fn contains(&self, access_token: &str) -> bool {
        self.users.read().await.contains_key(access_token)
    }
}

/// Provider for deployments without authentication: any non-empty token is
/// accepted as an opaque session id.
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn exchange_code(&self, _code: &str) -> Result<User> {
        bail!("authentication is not configured")
    }

    async fn login_user(&self, access_token: &str) -> Result<User> {
        if access_token.is_empty() {
            bail!("empty session id");
        }
        Ok(User {
            access_token: access_token.to_string(),
            email: String::new(),
        })
    }

    async fn user_can_view_repo(&self, _user: &User, _repo: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Per-token cache of repo-visibility decisions.
///
/// Allowed and denied entries live in separate maps with their own
/// lifetimes.
#[derive(Default)]
pub struct RepoPermissionCache {
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    allowed: HashMap<String, HashMap<String, i64>>,
    denied: HashMap<String, HashMap<String, i64>>,
}

impl RepoPermissionCache {
    /// Non-expired cached decision, if any. Allowed entries win over denied
    /// ones.
    pub async fn lookup(&self, access_token: &str, repo: &str, now: i64) -> Option<bool> {
        let state = self.state.lock().await;
        if let Some(expires) = state.allowed.get(access_token).and_then(|m| m.get(repo)) {
            if *expires > now {
                return Some(true);
            }
        }
        if let Some(expires) = state.denied.get(access_token).and_then(|m| m.get(repo)) {
            if *expires > now {
                return Some(false);
            }
        }
        None
    }

    /// Record a decision with its lifetime.
    pub async fn record(&self, access_token: &str, repo: &str, allowed: bool, now: i64) {
        let mut state = self.state.lock().await;
        let (map, ttl) = if allowed {
            (&mut state.allowed, REPO_ALLOWED_TTL_SECONDS)
        } else {
            (&mut state.denied, REPO_DENIED_TTL_SECONDS)
        };
        map.entry(access_token.to_string())
            .or_default()
            .insert(repo.to_string(), now + ttl);
    }

    /// The recorded decision and its expiry, regardless of expiration.
    pub async fn expiry(&self, access_token: &str, repo: &str) -> Option<(bool, i64)> {
        let state = self.state.lock().await;
        if let Some(expires) = state.allowed.get(access_token).and_then(|m| m.get(repo)) {
            return Some((true, *expires));
        }
        if let Some(expires) = state.denied.get(access_token).and_then(|m| m.get(repo)) {
            return Some((false, *expires));
        }
        None
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GitHubRepo {
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub permissions: Option<GitHubRepoPermissions>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GitHubRepoPermissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub pull: bool,
}

/// A private repo needs admin or push permission; a public repo needs pull.
pub fn can_view_repo(repo: &GitHubRepo) -> bool {
    match &repo.permissions {
        None => false,
        Some(permissions) => {
            if repo.private {
                permissions.admin || permissions.push
            } else {
                permissions.pull
            }
        }
    }
}

/// GitHub OAuth provider.
pub struct GitHubAuth {
    http_client: reqwest::Client,
    client_id: String,
    client_secret: String,
    cache: RepoPermissionCache,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

impl GitHubAuth {
    pub fn new(client_id: &str, client_secret: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("envpool/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building auth http client")?;
        Ok(Self {
            http_client,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cache: RepoPermissionCache::default(),
        })
    }
}

#[async_trait]
impl AuthProvider for GitHubAuth {
    async fn exchange_code(&self, code: &str) -> Result<User> {
        let request = TokenRequest {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            code,
        };
        let response = self
            .http_client
            .post(GITHUB_TOKEN_URL)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .context("exchanging oauth code")?;
        let token: TokenResponse = response
            .json()
            .await
            .context("decoding oauth token response")?;
        if token.access_token.is_empty() {
            bail!("oauth provider returned no access token");
        }
        info!("oauth code exchanged");
        Ok(User {
            access_token: token.access_token.clone(),
            email: token.access_token,
        })
    }

    async fn login_user(&self, access_token: &str) -> Result<User> {
        if access_token.is_empty() {
            bail!("empty access token");
        }
        let response = self
            .http_client
            .get(GITHUB_USER_URL)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(access_token)
            .send()
            .await
            .context("verifying access token")?;
        if !response.status().is_success() {
            bail!("access token rejected by provider");
        }
        Ok(User {
            access_token: access_token.to_string(),
            email: access_token.to_string(),
        })
    }

    async fn user_can_view_repo(&self, user: &User, repo: &str) -> Result<bool> {
        let now = now_secs();
        if let Some(cached) = self.cache.lookup(&user.access_token, repo, now).await {
            debug!(repo = %repo, allowed = cached, "repo permission served from cache");
            return Ok(cached);
        }
        let url = repo.replacen("github.com", "api.github.com/repos", 1);
        let response = self
            .http_client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(&user.access_token)
            .send()
            .await
            .context("querying repo permissions")?;
        let repo_response: GitHubRepo = response
            .json()
            .await
            .context("decoding repo permissions")?;
        let allowed = can_view_repo(&repo_response);
        self.cache.record(&user.access_token, repo, allowed, now).await;
        Ok(allowed)
    }
}
