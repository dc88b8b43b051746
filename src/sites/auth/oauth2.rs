//! OAuth2 bearer tokens through the client credentials or password grants.
use chrono::{Duration, Utc};
use log::debug;
use serde::Deserialize;

use super::{AuthError, AuthSession, Credentials, OAuth2Grant};
use crate::sites::transport::{HttpRequest, Transport};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

async fn request_token(
    transport: &dyn Transport,
    url: &str,
    form: Vec<(String, String)>,
) -> Result<AuthSession, AuthError> {
    let res = transport.execute(HttpRequest::post(url, form)).await?;
    let status = res.status;
    let body = res.text().await?;
    if status == 400 || status == 401 || status == 403 {
        return Err(AuthError::InvalidLogin);
    }
    if status >= 300 {
        return Err(AuthError::TokenResponse { message: body });
    }

    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| AuthError::TokenResponse {
            message: e.to_string(),
        })?;

    // Renew a little before the server considers the token dead
    let expires_at = token
        .expires_in
        .map(|secs| Utc::now() + Duration::seconds((secs - 30).max(0)));

    Ok(AuthSession {
        token: Some(token.access_token),
        refresh_token: token.refresh_token,
        expires_at,
        ..Default::default()
    })
}

/// Refreshes `current` when it carries a refresh token, otherwise runs the configured grant.
pub async fn acquire(
    transport: &dyn Transport,
    creds: &Credentials,
    current: Option<&AuthSession>,
    token_url: &str,
    refresh_url: Option<&str>,
    scope: Option<&str>,
    grant: OAuth2Grant,
) -> Result<AuthSession, AuthError> {
    let client_id = Credentials::require(&creds.consumer_key, "consumer_key")?;
    let client_secret = creds.consumer_secret.clone().unwrap_or_default();

    if let Some(refresh) = current.and_then(|s| s.refresh_token.as_deref()) {
        debug!("Refreshing OAuth2 token");
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh.to_string()),
            ("client_id".to_string(), client_id.to_string()),
            ("client_secret".to_string(), client_secret.clone()),
        ];
        match request_token(transport, refresh_url.unwrap_or(token_url), form).await {
            Ok(mut session) => {
                if session.refresh_token.is_none() {
                    session.refresh_token = Some(refresh.to_string());
                }
                return Ok(session);
            }
            Err(e) => debug!("Token refresh failed ({}), requesting a new one", e),
        }
    }

    let mut form = vec![
        ("client_id".to_string(), client_id.to_string()),
        ("client_secret".to_string(), client_secret),
    ];
    match grant {
        OAuth2Grant::ClientCredentials => {
            form.push(("grant_type".to_string(), "client_credentials".to_string()));
        }
        OAuth2Grant::Password => {
            form.push(("grant_type".to_string(), "password".to_string()));
            form.push((
                "username".to_string(),
                Credentials::require(&creds.login, "login")?.to_string(),
            ));
            form.push((
                "password".to_string(),
                Credentials::require(&creds.password, "password")?.to_string(),
            ));
        }
    }
    if let Some(scope) = scope {
        form.push(("scope".to_string(), scope.to_string()));
    }

    debug!("Requesting OAuth2 token from {}", token_url);
    request_token(transport, token_url, form).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sites::transport::fake::{FakeTransport, Reply};

    fn creds() -> Credentials {
        Credentials {
            consumer_key: Some("id".into()),
            consumer_secret: Some("secret".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn client_credentials_grant() {
        let transport = FakeTransport::new().ok(
            "https://o/token",
            r#"{"access_token":"abc","token_type":"bearer","expires_in":3600}"#,
        );
        let session = acquire(&transport, &creds(), None, "https://o/token", None, Some("read"), OAuth2Grant::ClientCredentials)
            .await
            .unwrap();
        assert_eq!(session.token.as_deref(), Some("abc"));
        assert!(!session.is_expired());
        let log = transport.log.lock();
        assert!(log[0]
            .form
            .contains(&("grant_type".to_string(), "client_credentials".to_string())));
        assert!(log[0].form.contains(&("scope".to_string(), "read".to_string())));
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token() {
        let transport = FakeTransport::new().ok(
            "https://o/refresh",
            r#"{"access_token":"new","expires_in":60}"#,
        );
        let old = AuthSession {
            token: Some("old".into()),
            refresh_token: Some("r1".into()),
            expires_at: Some(Utc::now() - Duration::seconds(5)),
            ..Default::default()
        };
        assert!(old.is_expired());
        let session = acquire(
            &transport,
            &creds(),
            Some(&old),
            "https://o/token",
            Some("https://o/refresh"),
            None,
            OAuth2Grant::ClientCredentials,
        )
        .await
        .unwrap();
        assert_eq!(session.token.as_deref(), Some("new"));
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert_eq!(transport.calls_to("https://o/token"), 0);
    }

    #[tokio::test]
    async fn bad_client() {
        let transport =
            FakeTransport::new().route("https://o/token", vec![Reply::Status(401, b"{}".to_vec())]);
        let res = acquire(&transport, &creds(), None, "https://o/token", None, None, OAuth2Grant::ClientCredentials).await;
        assert!(matches!(res, Err(AuthError::InvalidLogin)));
    }
}
