use log::debug;
use roxmltree::{Document, Node};

use super::{ExtractionMap, ParseError, RawParse};
use crate::record::RecordDraft;

const DEFAULT_ITEM: &str = "post";

/// Reads a location relative to `node`: `@attr`, `child` or `child@attr`.
fn read_location(node: Node, location: &str) -> Option<String> {
    if let Some(attr) = location.strip_prefix('@') {
        return node.attribute(attr).map(str::to_string);
    }

    let (child_name, attr) = match location.split_once('@') {
        Some((child, attr)) => (child, Some(attr)),
        None => (location, None),
    };

    let child = node
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == child_name)?;

    match attr {
        Some(attr) => child.attribute(attr).map(str::to_string),
        None => {
            // Elements holding a list of sub elements, e.g. <tags><tag>a</tag><tag>b</tag></tags>
            let nested: Vec<&str> = child
                .children()
                .filter(|c| c.is_element())
                .filter_map(|c| c.text())
                .collect();
            if nested.is_empty() {
                child.text().map(str::to_string)
            } else {
                Some(nested.join(" "))
            }
        }
    }
}

pub(crate) fn parse(map: &ExtractionMap, body: &str) -> Result<RawParse, ParseError> {
    let doc = Document::parse(body).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let root = doc.root_element();

    if let Some(error) = &map.error {
        let hit = if root.tag_name().name() == error {
            Some(root)
        } else {
            root.descendants()
                .find(|n| n.is_element() && n.tag_name().name() == error)
        };
        if let Some(node) = hit {
            let message = node
                .text()
                .or_else(|| node.attribute("reason"))
                .unwrap_or("unknown error");
            return Err(ParseError::Malformed(format!("API error: {}", message)));
        }
    }

    let item = map.item.as_deref().unwrap_or(DEFAULT_ITEM);
    let mut drafts = Vec::new();

    for node in root
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == item)
    {
        let mut draft = RecordDraft::new();
        for (field, location) in &map.fields {
            if let Some(value) = read_location(node, location) {
                draft.set(field, value);
            }
        }
        drafts.push(draft);
    }

    let total = map
        .count
        .as_deref()
        .and_then(|loc| read_location(root, loc))
        .and_then(|c| c.trim().parse::<u64>().ok());

    let next = map.next.as_deref().map(|loc| {
        read_location(root, loc).is_some_and(|v| !v.is_empty() && v != "0" && v != "false")
    });

    debug!("XML parser found {} items", drafts.len());

    if drafts.is_empty() && total.is_none() && root.tag_name().name() != item {
        // A well formed document with none of the expected structure is most likely an
        // error page, unless it is a plain empty list
        if root.children().any(|c| c.is_element()) {
            return Err(ParseError::Malformed(format!(
                "no <{}> elements in <{}>",
                item,
                root.tag_name().name()
            )));
        }
    }

    Ok(RawParse {
        drafts,
        total,
        next,
    })
}
