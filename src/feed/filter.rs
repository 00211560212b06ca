//! Feed detection and item filtering.
//!
//! XML feeds are filtered in place: item elements are located textually and
//! either copied through, dropped, or copied with their author replaced, so
//! everything the filter does not touch (namespaces, extensions, formatting)
//! reaches the client exactly as the upstream sent it.

use std::ops::Range;

use serde_json::{Value, json};

use super::{Feed, FeedError, FeedKind, FilterRules};

/// Location of one element inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    start: usize,
    inner: Range<usize>,
    end: usize,
}

/// Finds the next `<tag ...>` at or after `from`, returning its start and the
/// index of its closing `>`.
fn find_open(doc: &str, tag: &str, from: usize) -> Option<(usize, usize)> {
    let open = format!("<{tag}");
    let mut cursor = from;
    loop {
        let start = cursor + doc.get(cursor..)?.find(&open)?;
        let after = start + open.len();
        let boundary = doc[after..]
            .chars()
            .next()
            .is_some_and(|c| c == '>' || c == '/' || c.is_whitespace());
        if boundary {
            let gt = after + doc[after..].find('>')?;
            return Some((start, gt));
        }
        cursor = after;
    }
}

fn find_element(doc: &str, tag: &str, from: usize) -> Option<Element> {
    let (start, gt) = find_open(doc, tag, from)?;
    if doc[..gt].ends_with('/') {
        return Some(Element {
            start,
            inner: gt + 1..gt + 1,
            end: gt + 1,
        });
    }
    let close = format!("</{tag}>");
    let inner_start = gt + 1;
    let inner_end = inner_start + doc[inner_start..].find(&close)?;
    Some(Element {
        start,
        inner: inner_start..inner_end,
        end: inner_end + close.len(),
    })
}

/// Text content of the first `tag` element, CDATA unwrapped and entities
/// decoded.
fn element_text(doc: &str, tag: &str) -> Option<String> {
    let element = find_element(doc, tag, 0)?;
    let raw = doc[element.inner].trim();
    let raw = raw
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .map_or_else(|| unescape_xml(raw), str::to_owned);
    Some(raw)
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Detects the kind of `body`, `None` when it is not a feed at all.
pub fn detect(body: &str) -> Option<FeedKind> {
    let doc = body.trim_start_matches('\u{feff}').trim_start();
    if doc.starts_with('{') {
        let value: Value = serde_json::from_str(doc).ok()?;
        let version = value.get("version").and_then(Value::as_str)?;
        return version.contains("jsonfeed.org").then_some(FeedKind::Json);
    }
    if find_open(doc, "rss", 0).is_some() || find_open(doc, "rdf:RDF", 0).is_some() {
        return Some(FeedKind::Rss);
    }
    if find_open(doc, "feed", 0).is_some() {
        return Some(FeedKind::Atom);
    }
    None
}

/// Detects the kind of `body` and filters it.
pub fn apply(body: &str, rules: &FilterRules) -> Result<Feed, FeedError> {
    let kind = detect(body).ok_or(FeedError::UndetectedFeedType)?;
    let body = match kind {
        FeedKind::Rss => filter_xml(body, "item", &["description"], rules, rewrite_rss_author),
        FeedKind::Atom => filter_xml(body, "entry", &["summary", "content"], rules, rewrite_atom_author),
        FeedKind::Json => filter_json(body, rules)?,
    };
    Ok(Feed { kind, body })
}

fn filter_xml(
    doc: &str,
    item_tag: &str,
    description_tags: &[&str],
    rules: &FilterRules,
    rewrite_author: fn(&str, &str) -> String,
) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut cursor = 0;

    while let Some(item) = find_element(doc, item_tag, cursor) {
        out.push_str(&doc[cursor..item.start]);
        let block = &doc[item.start..item.end];
        let inner = &doc[item.inner.clone()];

        let title = element_text(inner, "title");
        let description = description_tags
            .iter()
            .find_map(|tag| element_text(inner, tag));

        if !rules.matches(title.as_deref(), description.as_deref()) {
            out.push_str(block);
        } else if let Some(name) = &rules.rewrite_author {
            out.push_str(&rewrite_author(block, name));
        }
        cursor = item.end;
    }

    out.push_str(&doc[cursor..]);
    out
}

fn replace_element(block: &str, element: &Element, replacement: &str) -> String {
    let mut out = String::with_capacity(block.len() + replacement.len());
    out.push_str(&block[..element.start]);
    out.push_str(replacement);
    out.push_str(&block[element.end..]);
    out
}

fn insert_before_close(block: &str, close: &str, insertion: &str) -> String {
    match block.rfind(close) {
        Some(at) => {
            let mut out = String::with_capacity(block.len() + insertion.len());
            out.push_str(&block[..at]);
            out.push_str(insertion);
            out.push_str(&block[at..]);
            out
        }
        None => block.to_owned(),
    }
}

fn rewrite_rss_author(block: &str, name: &str) -> String {
    let name = escape_xml(name);
    if let Some(author) = find_element(block, "author", 0) {
        return replace_element(block, &author, &format!("<author>{name}</author>"));
    }
    if let Some(creator) = find_element(block, "dc:creator", 0) {
        return replace_element(block, &creator, &format!("<dc:creator>{name}</dc:creator>"));
    }
    insert_before_close(block, "</item>", &format!("<author>{name}</author>"))
}

fn rewrite_atom_author(block: &str, name: &str) -> String {
    let author = format!("<author><name>{}</name></author>", escape_xml(name));
    match find_element(block, "author", 0) {
        Some(existing) => replace_element(block, &existing, &author),
        None => insert_before_close(block, "</entry>", &author),
    }
}

fn filter_json(body: &str, rules: &FilterRules) -> Result<String, FeedError> {
    let mut feed: Value = serde_json::from_str(body).map_err(|_| FeedError::UndetectedFeedType)?;

    if let Some(items) = feed.get_mut("items").and_then(Value::as_array_mut) {
        let mut kept = Vec::with_capacity(items.len());
        for mut item in items.drain(..) {
            let matched = {
                let title = item.get("title").and_then(Value::as_str);
                let description = ["summary", "content_text", "content_html"]
                    .iter()
                    .find_map(|key| item.get(*key).and_then(Value::as_str));
                rules.matches(title, description)
            };
            if !matched {
                kept.push(item);
                continue;
            }
            let Some(name) = &rules.rewrite_author else {
                continue;
            };
            if let Some(fields) = item.as_object_mut() {
                fields.insert("authors".to_owned(), json!([{ "name": name }]));
                if fields.contains_key("author") {
                    fields.insert("author".to_owned(), json!({ "name": name }));
                }
            }
            kept.push(item);
        }
        *items = kept;
    }

    serde_json::to_string(&feed).map_err(|e| FeedError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
<channel>
<title>News</title>
<item><title>Sponsored: buy now</title><description>ad</description><author>ads@example.com</author></item>
<item><title>Real story</title><description><![CDATA[<p>text</p>]]></description></item>
<item><title>Weekly &amp; sponsored</title><dc:creator>Bot</dc:creator></item>
</channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
<title>Blog</title>
<entry><title>Hello</title><summary>first post</summary></entry>
<entry><title type="text">Spam</title><content>buy</content><author><name>x</name></author></entry>
</feed>"#;

    const JSON: &str = r#"{"version":"https://jsonfeed.org/version/1.1","title":"J","items":[
        {"id":"1","title":"keep","content_text":"fine"},
        {"id":"2","title":"drop me","summary":"sponsored"}
    ]}"#;

    fn rules(title: &str, author: Option<&str>) -> FilterRules {
        FilterRules {
            title: Some(Regex::new(title).unwrap()),
            description: None,
            rewrite_author: author.map(str::to_owned),
        }
    }

    #[test]
    fn detection() {
        assert_eq!(detect(RSS), Some(FeedKind::Rss));
        assert_eq!(detect(ATOM), Some(FeedKind::Atom));
        assert_eq!(detect(JSON), Some(FeedKind::Json));
        assert_eq!(detect("<html><body/></html>"), None);
        assert_eq!(detect(r#"{"hello":"world"}"#), None);
        assert_eq!(detect("<rdf:RDF xmlns:rdf=\"x\"></rdf:RDF>"), Some(FeedKind::Rss));
    }

    #[test]
    fn open_tag_needs_boundary() {
        assert!(find_open("<items>", "item", 0).is_none());
        assert_eq!(find_open("<a><item id=\"1\">", "item", 0), Some((3, 15)));
    }

    #[test]
    fn element_text_decodes() {
        assert_eq!(element_text("<title>A &amp; B</title>", "title").as_deref(), Some("A & B"));
        assert_eq!(
            element_text("<d><![CDATA[<b>x</b>]]></d>", "d").as_deref(),
            Some("<b>x</b>")
        );
        assert_eq!(element_text("<x/>", "x").as_deref(), Some(""));
    }

    #[test]
    fn rss_matching_items_dropped() {
        let feed = apply(RSS, &rules("(?i)sponsored", None)).unwrap();
        assert_eq!(feed.kind, FeedKind::Rss);
        assert!(!feed.body.contains("buy now"));
        assert!(!feed.body.contains("Weekly"));
        assert!(feed.body.contains("Real story"));
        assert!(feed.body.ends_with("</rss>"));
    }

    #[test]
    fn rss_matching_items_rewritten() {
        let feed = apply(RSS, &rules("(?i)sponsored", Some("Muted <bot>"))).unwrap();
        assert!(feed.body.contains("<author>Muted &lt;bot&gt;</author>"));
        assert!(!feed.body.contains("ads@example.com"));
        assert!(feed.body.contains("<dc:creator>Muted &lt;bot&gt;</dc:creator>"));
        assert_eq!(feed.body.matches("<item>").count(), 3);
    }

    #[test]
    fn rss_description_rule() {
        let rules = FilterRules {
            title: None,
            description: Some(Regex::new("<p>text</p>").unwrap()),
            rewrite_author: None,
        };
        let feed = apply(RSS, &rules).unwrap();
        assert!(!feed.body.contains("Real story"));
        assert_eq!(feed.body.matches("<item>").count(), 2);
    }

    #[test]
    fn atom_rewrite_and_insert() {
        let feed = apply(ATOM, &rules("^(Hello|Spam)$", Some("me"))).unwrap();
        assert_eq!(feed.kind, FeedKind::Atom);
        assert_eq!(feed.body.matches("<author><name>me</name></author>").count(), 2);
        assert!(!feed.body.contains("<name>x</name>"));
    }

    #[test]
    fn json_drop_and_rewrite() {
        let dropped = apply(JSON, &rules("drop", None)).unwrap();
        let value: Value = serde_json::from_str(&dropped.body).unwrap();
        assert_eq!(value["items"].as_array().unwrap().len(), 1);
        assert_eq!(value["items"][0]["id"], "1");

        let rewritten = apply(JSON, &rules("drop", Some("me"))).unwrap();
        let value: Value = serde_json::from_str(&rewritten.body).unwrap();
        assert_eq!(value["items"][1]["authors"][0]["name"], "me");
    }

    #[test]
    fn not_a_feed() {
        assert!(matches!(
            apply("plain text", &FilterRules::default()),
            Err(FeedError::UndetectedFeedType)
        ));
    }
}
