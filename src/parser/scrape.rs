//! Regex scraping for sites without a usable API.
use log::debug;
use regex::Regex;

use super::{ExtractionMap, ParseError, RawParse};
use crate::record::RecordDraft;

fn compile(pattern: &str) -> Result<Regex, ParseError> {
    Regex::new(pattern).map_err(|e| ParseError::Malformed(format!("invalid pattern: {}", e)))
}

/// First capture of `pattern` in `text`, preferring a group named `value`.
fn capture_one(pattern: &Regex, text: &str) -> Option<String> {
    let caps = pattern.captures(text)?;
    caps.name("value")
        .or_else(|| caps.get(1))
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().to_string())
}

pub(crate) fn parse(map: &ExtractionMap, body: &str) -> Result<RawParse, ParseError> {
    let item = map
        .item
        .as_deref()
        .ok_or_else(|| ParseError::Malformed("regex source without an item pattern".into()))?;
    let item = compile(item)?;

    if let Some(error) = &map.error {
        if let Some(message) = capture_one(&compile(error)?, body) {
            return Err(ParseError::Malformed(format!("site error: {}", message)));
        }
    }

    let fields = map
        .fields
        .iter()
        .map(|(field, pattern)| Ok((field.as_str(), compile(pattern)?)))
        .collect::<Result<Vec<_>, ParseError>>()?;

    let group_names: Vec<&str> = item.capture_names().flatten().collect();
    let mut drafts = Vec::new();

    for caps in item.captures_iter(body) {
        let mut draft = RecordDraft::new();
        for name in &group_names {
            if let Some(m) = caps.name(name) {
                // Scraped attributes are usually html-escaped
                draft.set(name, m.as_str().replace("&amp;", "&"));
            }
        }

        let Some(whole) = caps.get(0) else {
            continue;
        };
        for (field, pattern) in &fields {
            // Repeated matches of a field pattern build a list, as for tag lists
            let values: Vec<String> = pattern
                .captures_iter(whole.as_str())
                .filter_map(|c| {
                    c.name("value")
                        .or_else(|| c.get(1))
                        .map(|m| m.as_str().to_string())
                })
                .collect();
            if !values.is_empty() {
                draft.set(field, values.join(" "));
            }
        }
        drafts.push(draft);
    }

    let total = match &map.count {
        Some(pattern) => capture_one(&compile(pattern)?, body)
            .and_then(|c| c.replace([',', '.'], "").parse::<u64>().ok()),
        None => None,
    };

    let next = match &map.next {
        Some(pattern) => Some(compile(pattern)?.is_match(body)),
        None => None,
    };

    debug!("Regex parser found {} items", drafts.len());

    if drafts.is_empty() && total.is_none() && next.is_none() && body.trim().is_empty() {
        return Err(ParseError::Malformed("empty body".into()));
    }

    Ok(RawParse {
        drafts,
        total,
        next,
    })
}
