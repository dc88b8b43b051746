//! RSS feeds only expose a reduced view of each post: no typed tags, no scores.
use log::debug;
use roxmltree::{Document, Node};

use super::{ParseError, RawParse};
use crate::record::RecordDraft;

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn child_text(node: Node, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
}

/// Feeds have no numeric id field, so take the last run of digits in the guid or link.
fn id_from(text: &str) -> Option<String> {
    let digits: String = text
        .chars()
        .rev()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits.chars().rev().collect())
    }
}

pub(crate) fn parse(body: &str) -> Result<RawParse, ParseError> {
    let doc = Document::parse(body).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "rss" {
        return Err(ParseError::Malformed(format!(
            "expected an <rss> document, got <{}>",
            root.tag_name().name()
        )));
    }

    let mut drafts = Vec::new();
    for item in root
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "item")
    {
        let mut draft = RecordDraft::new();
        let link = child_text(item, "link");
        let guid = child_text(item, "guid");

        if let Some(id) = guid.as_deref().and_then(id_from).or_else(|| link.as_deref().and_then(id_from)) {
            draft.set("id", id);
        }
        if let Some(link) = link {
            draft.set("page_url", link);
        }
        if let Some(date) = child_text(item, "pubDate") {
            draft.set("created_at", date);
        }
        if let Some(author) = child_text(item, "author").or_else(|| child_text(item, "creator")) {
            draft.set("author", author);
        }
        if let Some(url) = child(item, "enclosure").and_then(|e| e.attribute("url")) {
            draft.set("file_url", url);
        }
        if let Some(url) = child(item, "thumbnail").and_then(|e| e.attribute("url")) {
            draft.set("preview_url", url);
        }
        // Titles are the only text feeds carry; booru feeds put the tag string there
        if let Some(title) = child_text(item, "title") {
            draft.set("tags", title);
        }
        drafts.push(draft);
    }

    debug!("RSS parser found {} items", drafts.len());

    Ok(RawParse {
        drafts,
        total: None,
        next: None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feed_items() {
        let body = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
<channel><title>Latest</title>
<item>
  <title>cat sky</title>
  <link>https://booru.example/post/show/9876</link>
  <pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate>
  <enclosure url="https://booru.example/image/abc.png" type="image/png"/>
  <media:thumbnail url="https://booru.example/thumb/abc.jpg"/>
</item>
</channel></rss>"#;
        let raw = parse(body).unwrap();
        assert_eq!(raw.drafts.len(), 1);
        let draft = &raw.drafts[0];
        assert_eq!(draft.get("id"), Some("9876"));
        assert_eq!(draft.get("file_url"), Some("https://booru.example/image/abc.png"));
        assert_eq!(draft.get("preview_url"), Some("https://booru.example/thumb/abc.jpg"));
        assert_eq!(draft.get("tags"), Some("cat sky"));
    }

    #[test]
    fn not_a_feed() {
        assert!(parse("<posts/>").is_err());
    }
}
