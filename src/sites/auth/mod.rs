//! All methods and structs related to user authentication on imageboard websites
//!
//! The [`AuthDescriptor`] of a site tells how requests must be decorated. Schemes that need a
//! handshake (POST login, OAuth) keep their result in an [`AuthSession`], cached in memory by
//! the [`AuthManager`] and optionally on disk as bincode.
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use bincode::{deserialize, serialize};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::template::append_query;
use super::transport::{HttpRequest, Transport, TransportError};
use super::SiteConfig;

pub mod oauth1;
pub mod oauth2;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Indicates that login credentials are incorrect.
    #[error("Invalid username or API key")]
    InvalidLogin,

    #[error("Missing credential '{field}' for this site")]
    MissingCredential { field: &'static str },

    /// OAuth1 needs the operator to approve the request token and supply the verifier.
    #[error("Authorization required, open {url} and configure the verifier code")]
    AuthorizationRequired { url: String },

    #[error("Unexpected answer from the token endpoint: {message}")]
    TokenResponse { message: String },

    #[error("Connection to auth url failed: {source}")]
    ConnectionError {
        #[from]
        source: TransportError,
    },

    /// Indicates any unrecoverable IO error when trying to read or write the auth cache.
    #[error("Failed to access auth cache. error: {source}")]
    CacheIOError {
        #[from]
        source: io::Error,
    },

    #[error("Failed to encode auth cache")]
    CacheEncodeError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2Grant {
    #[default]
    ClientCredentials,
    Password,
}

/// How a site expects its users to prove who they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    #[default]
    None,
    /// Credentials sent as query parameters. With a salt, the password is sent as
    /// `sha1(salt)` where `%password%` inside the salt is replaced by the password.
    Url {
        login_field: String,
        password_field: String,
        #[serde(default)]
        salt: Option<String>,
    },
    /// HTTP basic auth with the login and the api key (or password).
    Basic,
    /// Form login whose `Set-Cookie` answer authenticates later requests.
    Post {
        url: String,
        login_field: String,
        password_field: String,
        #[serde(default)]
        salt: Option<String>,
        /// Cookie that must be present for the login to count as successful
        #[serde(default)]
        cookie: Option<String>,
        #[serde(default)]
        extra: BTreeMap<String, String>,
    },
    /// Raw cookie string taken from `credentials.cookie`.
    Cookie,
    OAuth1 {
        request_token_url: String,
        authorize_url: String,
        access_token_url: String,
    },
    OAuth2 {
        token_url: String,
        #[serde(default)]
        refresh_url: Option<String>,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        grant: OAuth2Grant,
    },
}

/// User supplied secrets. Which fields matter depends on the [`AuthDescriptor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub login: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub cookie: Option<String>,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub access_token: Option<String>,
    pub token_secret: Option<String>,
    pub verifier: Option<String>,
    /// Lifts the regular tag cap of the site
    pub premium: bool,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.login.is_none()
            && self.api_key.is_none()
            && self.cookie.is_none()
            && self.consumer_key.is_none()
            && self.access_token.is_none()
    }

    pub(crate) fn require<'a>(
        value: &'a Option<String>,
        field: &'static str,
    ) -> Result<&'a str, AuthError> {
        value
            .as_deref()
            .ok_or(AuthError::MissingCredential { field })
    }
}

/// Outcome of a handshake, reused until it expires or the site rejects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub cookies: Vec<(String, String)>,
    pub token: Option<String>,
    pub token_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// OAuth1 request token waiting for the operator's approval
    pub pending: Option<(String, String)>,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Hashes a password the way Moebooru and Shimmie logins expect.
pub fn hash_password(salt: Option<&str>, password: &str) -> String {
    match salt {
        Some(salt) => format!("{:x}", Sha1::digest(salt.replace("%password%", password))),
        None => password.to_string(),
    }
}

/// Keeps handshake results per site.
#[derive(Debug, Default)]
pub struct AuthManager {
    sessions: Mutex<AHashMap<String, AuthSession>>,
    cache_dir: Option<PathBuf>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions are also written to and read from `dir` as bincode files.
    pub fn with_cache_dir(dir: &Path) -> Self {
        Self {
            sessions: Mutex::default(),
            cache_dir: Some(dir.to_path_buf()),
        }
    }

    /// Adds whatever the site's scheme needs to `request`, running the handshake first when
    /// no valid session is cached.
    pub async fn authorize(
        &self,
        site: &SiteConfig,
        transport: &dyn Transport,
        request: HttpRequest,
    ) -> Result<HttpRequest, AuthError> {
        let creds = &site.credentials;
        match &site.auth {
            AuthDescriptor::None => Ok(request),
            _ if creds.is_empty() => {
                debug!("No credentials for {}, sending anonymous request", site.name);
                Ok(request)
            }
            AuthDescriptor::Url {
                login_field,
                password_field,
                salt,
            } => {
                let login = Credentials::require(&creds.login, "login")?;
                let secret = match (&creds.api_key, &creds.password) {
                    (Some(key), _) => key.clone(),
                    (None, Some(pass)) => hash_password(salt.as_deref(), pass),
                    (None, None) => return Err(AuthError::MissingCredential { field: "api_key" }),
                };
                let url = append_query(
                    &request.url,
                    &[
                        (login_field.clone(), login.to_string()),
                        (password_field.clone(), secret),
                    ],
                );
                Ok(HttpRequest { url, ..request })
            }
            AuthDescriptor::Basic => {
                let login = Credentials::require(&creds.login, "login")?;
                let secret = creds
                    .api_key
                    .as_deref()
                    .or(creds.password.as_deref())
                    .unwrap_or_default();
                let encoded = STANDARD.encode(format!("{}:{}", login, secret));
                Ok(request.header("Authorization", format!("Basic {}", encoded)))
            }
            AuthDescriptor::Cookie => {
                let cookie = Credentials::require(&creds.cookie, "cookie")?;
                Ok(request.header("Cookie", cookie))
            }
            AuthDescriptor::Post { .. } => {
                let session = self.session(site, transport).await?;
                match session.cookie_header() {
                    Some(cookie) => Ok(request.header("Cookie", cookie)),
                    None => Err(AuthError::InvalidLogin),
                }
            }
            AuthDescriptor::OAuth1 { .. } => {
                let session = self.session(site, transport).await?;
                let consumer_key = Credentials::require(&creds.consumer_key, "consumer_key")?;
                let consumer_secret =
                    Credentials::require(&creds.consumer_secret, "consumer_secret")?;
                let header = oauth1::authorization_header(
                    &request,
                    consumer_key,
                    consumer_secret,
                    session.token.as_deref(),
                    session.token_secret.as_deref(),
                    &[],
                );
                Ok(request.header("Authorization", header))
            }
            AuthDescriptor::OAuth2 { .. } => {
                let session = self.session(site, transport).await?;
                let token = session.token.ok_or_else(|| AuthError::TokenResponse {
                    message: "no access token".to_string(),
                })?;
                Ok(request.header("Authorization", format!("Bearer {}", token)))
            }
        }
    }

    /// Returns a usable session, running or refreshing the handshake if needed.
    ///
    /// The lock is held across the handshake so concurrent requests to the same site log in
    /// only once.
    async fn session(
        &self,
        site: &SiteConfig,
        transport: &dyn Transport,
    ) -> Result<AuthSession, AuthError> {
        let mut sessions = self.sessions.lock().await;

        if !sessions.contains_key(&site.name) {
            if let Some(cached) = self.read_cache(&site.name).await {
                sessions.insert(site.name.clone(), cached);
            }
        }

        let current = sessions.get(&site.name).cloned();
        let usable = current
            .as_ref()
            .is_some_and(|s| !s.is_expired() && (s.token.is_some() || !s.cookies.is_empty()));
        if usable {
            if let Some(session) = current {
                return Ok(session);
            }
        }

        let creds = &site.credentials;
        let fresh = match &site.auth {
            AuthDescriptor::Post {
                url,
                login_field,
                password_field,
                salt,
                cookie,
                extra,
            } => {
                let login = Credentials::require(&creds.login, "login")?;
                let password = Credentials::require(&creds.password, "password")?;
                let mut form = vec![
                    (login_field.clone(), login.to_string()),
                    (password_field.clone(), hash_password(salt.as_deref(), password)),
                ];
                form.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

                debug!("Logging in to {}", site.base_url);
                let res = transport
                    .execute(
                        HttpRequest::post(url.clone(), form)
                            .header("User-Agent", site.user_agent.clone()),
                    )
                    .await?;
                if res.status >= 400 {
                    return Err(AuthError::InvalidLogin);
                }
                let cookies: Vec<(String, String)> = res
                    .header_all("Set-Cookie")
                    .filter_map(|raw| raw.split(';').next())
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .collect();
                let logged_in = match cookie {
                    Some(name) => cookies.iter().any(|(k, _)| k == name),
                    None => !cookies.is_empty(),
                };
                if !logged_in {
                    return Err(AuthError::InvalidLogin);
                }
                AuthSession {
                    cookies,
                    ..Default::default()
                }
            }
            AuthDescriptor::OAuth1 {
                request_token_url,
                access_token_url,
                ..
            } => {
                oauth1::acquire(
                    transport,
                    creds,
                    current.unwrap_or_default(),
                    request_token_url,
                    access_token_url,
                )
                .await?
            }
            AuthDescriptor::OAuth2 {
                token_url,
                refresh_url,
                scope,
                grant,
            } => {
                oauth2::acquire(
                    transport,
                    creds,
                    current.as_ref(),
                    token_url,
                    refresh_url.as_deref(),
                    scope.as_deref(),
                    *grant,
                )
                .await?
            }
            _ => AuthSession::default(),
        };

        if let AuthDescriptor::OAuth1 { authorize_url, .. } = &site.auth {
            if fresh.token.is_none() {
                // Keep the pending request token so the verifier entered later matches it
                let url = match &fresh.pending {
                    Some((token, _)) => {
                        append_query(authorize_url, &[("oauth_token".to_string(), token.clone())])
                    }
                    None => authorize_url.clone(),
                };
                sessions.insert(site.name.clone(), fresh);
                warn!("{} needs to be authorized at {}", site.name, url);
                return Err(AuthError::AuthorizationRequired { url });
            }
        }

        self.write_cache(&site.name, &fresh).await?;
        sessions.insert(site.name.clone(), fresh.clone());
        Ok(fresh)
    }

    /// Drops the session of a site after it rejected it.
    pub async fn invalidate(&self, site: &str) {
        if self.sessions.lock().await.remove(site).is_some() {
            debug!("Dropped auth session for {}", site);
        }
        if let Some(dir) = &self.cache_dir {
            let _ = tokio::fs::remove_file(dir.join(format!("{}.bin", site))).await;
        }
    }

    async fn read_cache(&self, site: &str) -> Option<AuthSession> {
        let path = self.cache_dir.as_ref()?.join(format!("{}.bin", site));
        let bytes = tokio::fs::read(&path).await.ok()?;
        match deserialize::<AuthSession>(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Ignoring corrupted auth cache {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Generates a bincode file with the session inside the configured cache directory.
    async fn write_cache(&self, site: &str, session: &AuthSession) -> Result<(), AuthError> {
        let Some(dir) = &self.cache_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let config_path = dir.join(format!("{}.bin", site));
        let mut cfg_cache = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&config_path)
            .await?;

        let Ok(bytes) = serialize(session) else {
            return Err(AuthError::CacheEncodeError);
        };

        cfg_cache.write_all(&bytes).await?;
        debug!("Wrote auth cache to {}", &config_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;
    use crate::sites::transport::fake::{FakeTransport, Reply};
    use crate::sites::DEFAULT_SITES;

    fn site_with(auth: AuthDescriptor, credentials: Credentials) -> SiteConfig {
        let mut site = DEFAULT_SITES["danbooru"].clone();
        site.auth = auth;
        site.credentials = credentials;
        site
    }

    #[test]
    fn moebooru_password_hash() {
        let hash = hash_password(Some("So-I-Heard-You-Like-Mupkids-?--%password%--"), "pass");
        assert_eq!(hash.len(), 40);
        assert_eq!(hash_password(None, "pass"), "pass");
    }

    #[tokio::test]
    async fn url_credentials_are_appended() {
        let site = site_with(
            AuthDescriptor::Url {
                login_field: "login".into(),
                password_field: "api_key".into(),
                salt: None,
            },
            Credentials {
                login: Some("user".into()),
                api_key: Some("key".into()),
                ..Default::default()
            },
        );
        let transport = FakeTransport::new();
        let req = AuthManager::new()
            .authorize(&site, &transport, HttpRequest::get("https://x/posts.json?page=1"))
            .await
            .unwrap();
        assert_eq!(req.url, "https://x/posts.json?page=1&login=user&api_key=key");
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn anonymous_without_credentials() {
        let site = site_with(AuthDescriptor::Basic, Credentials::default());
        let req = AuthManager::new()
            .authorize(&site, &FakeTransport::new(), HttpRequest::get("https://x"))
            .await
            .unwrap();
        assert!(req.headers.is_empty());
    }

    #[tokio::test]
    async fn post_login_captures_cookies_once() {
        let dir = TempDir::new("ibf-auth").unwrap();
        let site = site_with(
            AuthDescriptor::Post {
                url: "https://x/login".into(),
                login_field: "user".into(),
                password_field: "pass".into(),
                salt: None,
                cookie: Some("session".into()),
                extra: BTreeMap::new(),
            },
            Credentials {
                login: Some("me".into()),
                password: Some("secret".into()),
                ..Default::default()
            },
        );
        let transport = FakeTransport::new().route(
            "https://x/login",
            vec![Reply::WithHeaders(
                200,
                vec![
                    ("Set-Cookie".into(), "session=abc; Path=/; HttpOnly".into()),
                    ("set-cookie".into(), "theme=dark".into()),
                ],
                Vec::new(),
            )],
        );
        let manager = AuthManager::with_cache_dir(dir.path());

        for _ in 0..2 {
            let req = manager
                .authorize(&site, &transport, HttpRequest::get("https://x/list"))
                .await
                .unwrap();
            assert_eq!(
                req.headers,
                vec![("Cookie".to_string(), "session=abc; theme=dark".to_string())]
            );
        }
        assert_eq!(transport.calls_to("https://x/login"), 1);
        assert!(dir.path().join("danbooru.bin").exists());

        // A new manager picks the session up from the disk cache
        let reloaded = AuthManager::with_cache_dir(dir.path());
        reloaded
            .authorize(&site, &transport, HttpRequest::get("https://x/list"))
            .await
            .unwrap();
        assert_eq!(transport.calls_to("https://x/login"), 1);
    }

    #[tokio::test]
    async fn rejected_login() {
        let site = site_with(
            AuthDescriptor::Post {
                url: "https://x/login".into(),
                login_field: "user".into(),
                password_field: "pass".into(),
                salt: None,
                cookie: None,
                extra: BTreeMap::new(),
            },
            Credentials {
                login: Some("me".into()),
                password: Some("wrong".into()),
                ..Default::default()
            },
        );
        let transport = FakeTransport::new().route("https://x/login", vec![Reply::Status(403, vec![])]);
        let res = AuthManager::new()
            .authorize(&site, &transport, HttpRequest::get("https://x/list"))
            .await;
        assert!(matches!(res, Err(AuthError::InvalidLogin)));
    }
}
