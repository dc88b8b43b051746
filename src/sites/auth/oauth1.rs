//! OAuth 1.0a request signing (HMAC-SHA1) and the three-legged token exchange.
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::debug;
use rand::{distributions::Alphanumeric, Rng};
use sha1::Sha1;

use super::{AuthError, AuthSession, Credentials};
use crate::sites::transport::{HttpRequest, Method, Transport};

type HmacSha1 = Hmac<Sha1>;

fn enc(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn query_pairs(url: &str) -> Vec<(String, String)> {
    let Some((_, query)) = url.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            (decode(k), decode(v))
        })
        .collect()
}

/// Computes the signature over the method, the base url and every parameter.
pub fn signature(
    method: Method,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> String {
    let base_url = url.split(['?', '#']).next().unwrap_or(url);
    let mut encoded: Vec<(String, String)> =
        params.iter().map(|(k, v)| (enc(k), enc(v))).collect();
    encoded.sort();
    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let method = match method {
        Method::Get => "GET",
        Method::Post => "POST",
    };
    let base = format!("{}&{}&{}", method, enc(base_url), enc(&param_string));
    let key = format!(
        "{}&{}",
        enc(consumer_secret),
        enc(token_secret.unwrap_or_default())
    );

    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(base.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Builds the `Authorization: OAuth ...` header for `request`.
pub fn authorization_header(
    request: &HttpRequest,
    consumer_key: &str,
    consumer_secret: &str,
    token: Option<&str>,
    token_secret: Option<&str>,
    extra: &[(String, String)],
) -> String {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    let mut oauth = vec![
        ("oauth_consumer_key".to_string(), consumer_key.to_string()),
        ("oauth_nonce".to_string(), nonce),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), Utc::now().timestamp().to_string()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];
    if let Some(token) = token {
        oauth.push(("oauth_token".to_string(), token.to_string()));
    }
    oauth.extend(extra.iter().cloned());

    let mut all = oauth.clone();
    all.extend(query_pairs(&request.url));
    all.extend(request.form.iter().cloned());
    let sig = signature(request.method, &request.url, &all, consumer_secret, token_secret);
    oauth.push(("oauth_signature".to_string(), sig));

    let fields = oauth
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", enc(k), enc(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {}", fields)
}

fn parse_token_body(body: &str) -> Result<(String, String), AuthError> {
    let pairs = query_pairs(&format!("?{}", body.trim()));
    let get = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    match (get("oauth_token"), get("oauth_token_secret")) {
        (Some(token), Some(secret)) => Ok((token, secret)),
        _ => Err(AuthError::TokenResponse {
            message: body.chars().take(200).collect(),
        }),
    }
}

async fn signed_post(
    transport: &dyn Transport,
    url: &str,
    consumer_key: &str,
    consumer_secret: &str,
    token: Option<(&str, &str)>,
    extra: &[(String, String)],
) -> Result<(String, String), AuthError> {
    let mut request = HttpRequest::post(url, Vec::new());
    let header = authorization_header(
        &request,
        consumer_key,
        consumer_secret,
        token.map(|t| t.0),
        token.map(|t| t.1),
        extra,
    );
    request = request.header("Authorization", header);

    let res = transport.execute(request).await?;
    if res.status == 401 || res.status == 403 {
        return Err(AuthError::InvalidLogin);
    }
    let status = res.status;
    let body = res.text().await?;
    if status >= 400 {
        return Err(AuthError::TokenResponse { message: body });
    }
    parse_token_body(&body)
}

/// Advances the handshake as far as the configured credentials allow.
///
/// Configured access tokens are used as is. Otherwise a request token is obtained and kept
/// as pending until `credentials.verifier` is set, at which point it is exchanged for an
/// access token.
pub async fn acquire(
    transport: &dyn Transport,
    creds: &Credentials,
    current: AuthSession,
    request_token_url: &str,
    access_token_url: &str,
) -> Result<AuthSession, AuthError> {
    if let (Some(token), Some(secret)) = (&creds.access_token, &creds.token_secret) {
        return Ok(AuthSession {
            token: Some(token.clone()),
            token_secret: Some(secret.clone()),
            ..Default::default()
        });
    }

    let consumer_key = Credentials::require(&creds.consumer_key, "consumer_key")?;
    let consumer_secret = Credentials::require(&creds.consumer_secret, "consumer_secret")?;

    let (pending_token, pending_secret) = match current.pending {
        Some(pending) => pending,
        None => {
            debug!("Requesting OAuth1 request token");
            signed_post(
                transport,
                request_token_url,
                consumer_key,
                consumer_secret,
                None,
                &[("oauth_callback".to_string(), "oob".to_string())],
            )
            .await?
        }
    };

    let Some(verifier) = &creds.verifier else {
        return Ok(AuthSession {
            pending: Some((pending_token, pending_secret)),
            ..Default::default()
        });
    };

    debug!("Exchanging OAuth1 request token for an access token");
    let (token, token_secret) = signed_post(
        transport,
        access_token_url,
        consumer_key,
        consumer_secret,
        Some((&pending_token, &pending_secret)),
        &[("oauth_verifier".to_string(), verifier.clone())],
    )
    .await?;

    Ok(AuthSession {
        token: Some(token),
        token_secret: Some(token_secret),
        ..Default::default()
    })
}
