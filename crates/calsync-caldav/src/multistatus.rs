use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn response_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(?:[a-z0-9_-]+:)?response[\s>](.*?)</(?:[a-z0-9_-]+:)?response>")
            .expect("valid multistatus response regex")
    })
}

/// Split a WebDAV multistatus body into its `<response>` blocks.
pub(crate) fn response_blocks(body: &str) -> Vec<&str> {
    response_re()
        .captures_iter(body)
        .filter_map(|capture| capture.get(1).map(|m| m.as_str()))
        .collect()
}

/// Extract the text content of the first namespaced tag with the given local
/// name inside a block.
pub(crate) fn tag_text(block: &str, local_name: &str) -> Option<String> {
    let pattern = format!(
        r"(?is)<(?:[a-z0-9_-]+:)?{local_name}[^>]*>(.*?)</(?:[a-z0-9_-]+:)?{local_name}>"
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(block)
        .and_then(|capture| capture.get(1))
        .map(|m| unescape_xml_entities(m.as_str().trim()))
        .filter(|value| !value.is_empty())
}

/// Whether a block declares the calendar resource type.
pub(crate) fn is_calendar_resource(block: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?is)<(?:[a-z0-9_-]+:)?calendar\s*/?>").expect("valid resourcetype regex")
    });
    re.is_match(block)
}

pub(crate) fn unescape_xml_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn escape_xml_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// DAV getlastmodified values are HTTP dates; some servers hand out ISO
/// timestamps instead. Both are promoted to UTC.
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
