use log::debug;
use serde_json::Value;

use super::{ExtractionMap, ParseError, RawParse, TagListMap};
use crate::record::{
    tags::{Tag, TagType},
    RecordDraft,
};

/// Follows a dot separated path. Numeric segments index arrays.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(list) => segment.parse::<usize>().ok().and_then(|i| list.get(i)),
        _ => None,
    })
}

/// Flattens scalars and arrays of scalars into the string form drafts store.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(as_text).collect();
            Some(parts.join(" "))
        }
        Value::Object(_) => None,
    }
}

fn read_tag_list(item: &Value, spec: &TagListMap, draft: &mut RecordDraft) {
    let Some(Value::Array(entries)) = lookup(item, &spec.path) else {
        return;
    };
    for entry in entries {
        let (name, kind) = match entry {
            Value::String(name) => (Some(name.clone()), None),
            _ => (
                lookup(entry, &spec.name).and_then(as_text),
                spec.kind
                    .as_deref()
                    .and_then(|k| lookup(entry, k))
                    .and_then(as_text),
            ),
        };
        if let Some(name) = name {
            let kind = kind
                .map(|k| TagType::from_type_str(&k))
                .unwrap_or(TagType::General);
            draft.push_tag(Tag::new(&name, kind));
        }
    }
}

pub(crate) fn parse(map: &ExtractionMap, body: &str) -> Result<RawParse, ParseError> {
    let root: Value =
        serde_json::from_str(body).map_err(|e| ParseError::Malformed(e.to_string()))?;

    if let Some(error_path) = &map.error {
        if let Some(err) = lookup(&root, error_path) {
            let is_error = match err {
                Value::Bool(b) => *b,
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                _ => true,
            };
            if is_error {
                return Err(ParseError::Malformed(format!(
                    "API error: {}",
                    as_text(err).unwrap_or_else(|| err.to_string())
                )));
            }
        }
    }

    let total = map
        .count
        .as_deref()
        .and_then(|path| lookup(&root, path))
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });

    let next = map
        .next
        .as_deref()
        .map(|path| match lookup(&root, path) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        });

    let items: &[Value] = match lookup(&root, map.item.as_deref().unwrap_or_default()) {
        Some(Value::Array(items)) => items.as_slice(),
        // Single post endpoints answer with a bare object
        Some(obj @ Value::Object(_)) if map.item.is_none() => std::slice::from_ref(obj),
        Some(_) => {
            return Err(ParseError::Malformed(
                "result location does not hold a list".to_string(),
            ))
        }
        // Gelbooru drops the list key entirely when a search has no results
        None if total == Some(0) => &[],
        None => {
            return Err(ParseError::Malformed(format!(
                "missing result list at '{}'",
                map.item.as_deref().unwrap_or_default()
            )))
        }
    };

    let drafts = items
        .iter()
        .map(|item| {
            let mut draft = RecordDraft::new();
            for (field, path) in &map.fields {
                if let Some(text) = lookup(item, path).and_then(as_text) {
                    draft.set(field, text);
                }
            }
            if let Some(spec) = &map.tag_list {
                read_tag_list(item, spec, &mut draft);
            }
            draft
        })
        .collect::<Vec<_>>();

    debug!("JSON parser found {} items", drafts.len());

    Ok(RawParse {
        drafts,
        total,
        next,
    })
}
