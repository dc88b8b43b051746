//! Url template expansion.
//!
//! | Placeholder  | Value                                         |
//! |--------------|-----------------------------------------------|
//! | `{tags}`     | url-encoded tags joined with `+`              |
//! | `{page}`     | 1-based page index                            |
//! | `{page0}`    | 0-based page index                            |
//! | `{pid}`      | offset of the first result, `(page-1)*limit`  |
//! | `{limit}`    | images per page                               |
//! | `{id}`/`{md5}`/`{ext}`/`{url}` | fields of the targeted record |
//! | `{login}`/`{password}`/`{api_key}` | configured credentials    |
use crate::macros::join_tags;

use super::auth::Credentials;

/// Values available to a template. Absent values expand to an empty string.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    pub tags: &'a [String],
    pub page: u32,
    pub limit: u32,
    pub id: Option<u64>,
    pub md5: Option<&'a str>,
    pub ext: Option<&'a str>,
    pub url: Option<&'a str>,
    pub credentials: Option<&'a Credentials>,
}

pub fn expand(template: &str, vars: &TemplateVars) -> String {
    let page0 = vars.page.saturating_sub(1);
    let creds = vars.credentials;
    let enc = |v: Option<&str>| urlencoding::encode(v.unwrap_or_default()).into_owned();

    let pairs: [(&str, String); 11] = [
        ("{tags}", join_tags!(vars.tags)),
        ("{page}", vars.page.to_string()),
        ("{page0}", page0.to_string()),
        ("{pid}", (page0 * vars.limit).to_string()),
        ("{limit}", vars.limit.to_string()),
        ("{id}", vars.id.map(|i| i.to_string()).unwrap_or_default()),
        ("{md5}", vars.md5.unwrap_or_default().to_string()),
        ("{ext}", vars.ext.unwrap_or_default().to_string()),
        ("{login}", enc(creds.and_then(|c| c.login.as_deref()))),
        ("{password}", enc(creds.and_then(|c| c.password.as_deref()))),
        ("{api_key}", enc(creds.and_then(|c| c.api_key.as_deref()))),
    ];

    let mut out = template.to_string();
    for (key, value) in pairs {
        if out.contains(key) {
            out = out.replace(key, &value);
        }
    }
    // Full urls are substituted last so their own braces are left untouched
    if let Some(url) = vars.url {
        out = out.replace("{url}", url);
    }
    out
}

/// Appends query parameters, picking the right separator.
pub fn append_query(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, sep, query)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expand_search_template() {
        let tags = vec!["cat".to_string(), "rating:safe".to_string()];
        let vars = TemplateVars {
            tags: &tags,
            page: 3,
            limit: 42,
            ..Default::default()
        };
        assert_eq!(
            expand(
                "https://g.com/index.php?limit={limit}&pid={page0}&off={pid}&tags={tags}",
                &vars
            ),
            "https://g.com/index.php?limit=42&pid=2&off=84&tags=cat+rating%3Asafe"
        );
    }

    #[test]
    fn record_and_credentials() {
        let creds = Credentials {
            login: Some("me".into()),
            api_key: Some("k&y".into()),
            ..Default::default()
        };
        let vars = TemplateVars {
            id: Some(5),
            url: Some("https://cdn/{weird}.png"),
            credentials: Some(&creds),
            ..Default::default()
        };
        assert_eq!(
            expand("{url}?id={id}&u={login}&k={api_key}", &vars),
            "https://cdn/{weird}.png?id=5&u=me&k=k%26y"
        );
        assert_eq!(
            append_query("https://x/a?b=1", &[("c".into(), "d e".into())]),
            "https://x/a?b=1&c=d%20e"
        );
    }
}
