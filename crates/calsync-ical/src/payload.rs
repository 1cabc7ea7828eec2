use calsync_core::ResponseStatus;

/// Undo RFC 5545 line folding: continuation lines start with a space or tab.
pub fn unfold_lines(payload: &str) -> Vec<String> {
    let normalized = payload.replace("\r\n", "\n").replace('\r', "\n");
    let mut unfolded: Vec<String> = Vec::new();
    for raw_line in normalized.lines() {
        if let Some(last) = unfolded.last_mut() {
            if raw_line.starts_with(' ') || raw_line.starts_with('\t') {
                last.push_str(raw_line.trim_start());
                continue;
            }
        }
        unfolded.push(raw_line.to_string());
    }
    unfolded
}

fn property_name(line: &str) -> &str {
    let end = line
        .find(|ch| ch == ';' || ch == ':')
        .unwrap_or(line.len());
    &line[..end]
}

fn is_begin_vevent(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("BEGIN:VEVENT")
}

fn is_end_vevent(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("END:VEVENT")
}

/// Index ranges (inclusive) of every VEVENT block in an unfolded line list.
pub(crate) fn vevent_blocks(lines: &[String]) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut begin: Option<usize> = None;
    for (index, line) in lines.iter().enumerate() {
        if is_begin_vevent(line) {
            begin = Some(index);
        } else if is_end_vevent(line) {
            if let Some(start) = begin.take() {
                blocks.push((start, index));
            }
        }
    }
    blocks
}

/// Wrap one VEVENT block into a standalone VCALENDAR payload, preserving the
/// event lines verbatim.
pub(crate) fn wrap_vevent(method: Option<&str>, block: &[String]) -> String {
    let mut out = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//CalSync//EN\r\n");
    if let Some(method) = method {
        out.push_str(&format!("METHOD:{method}\r\n"));
    }
    for line in block {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}

/// Stamp the local participation status onto every VEVENT as
/// `X-CALSYNC-RESPONSE`. Existing occurrences are replaced; everything else
/// in the payload is left untouched.
pub fn embed_response_property(payload: &str, response: ResponseStatus) -> String {
    let lines = unfold_lines(payload);
    let value = response.as_str().to_ascii_uppercase();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    let mut in_event = false;

    for line in lines {
        if is_begin_vevent(&line) {
            in_event = true;
            out.push(line);
            continue;
        }
        if is_end_vevent(&line) {
            if in_event {
                out.push(format!("X-CALSYNC-RESPONSE:{value}"));
            }
            in_event = false;
            out.push(line);
            continue;
        }
        if in_event && property_name(&line).eq_ignore_ascii_case("X-CALSYNC-RESPONSE") {
            continue;
        }
        out.push(line);
    }

    let mut joined = out.join("\r\n");
    joined.push_str("\r\n");
    joined
}

/// Replace (or remove) a single-valued property on every VEVENT in the
/// payload. Used when rebuilding a payload from a merge selection.
pub fn set_vevent_property(payload: &str, name: &str, value: Option<&str>) -> String {
    let lines = unfold_lines(payload);
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    let mut in_event = false;

    for line in lines {
        if is_begin_vevent(&line) {
            in_event = true;
            out.push(line);
            continue;
        }
        if is_end_vevent(&line) {
            if in_event {
                if let Some(value) = value {
                    out.push(format!("{}:{}", name.to_ascii_uppercase(), value));
                }
            }
            in_event = false;
            out.push(line);
            continue;
        }
        if in_event && property_name(&line).eq_ignore_ascii_case(name) {
            continue;
        }
        out.push(line);
    }

    let mut joined = out.join("\r\n");
    joined.push_str("\r\n");
    joined
}

pub(crate) fn unescape_ical_text(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(current) = chars.next() {
        if current != '\\' {
            result.push(current);
            continue;
        }

        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some('\\') => result.push('\\'),
            Some(';') => result.push(';'),
            Some(',') => result.push(','),
            Some(other) => result.push(other),
            None => {}
        }
    }
    result
}

pub fn escape_ical_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace(';', "\\;")
        .replace(',', "\\,")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:u1\r\nSUMMARY:Kickoff\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn unfolds_continuation_lines() {
        let lines = unfold_lines("SUMMARY:first part\r\n  second part\r\nUID:u1\r\n");
        assert_eq!(lines[0], "SUMMARY:first partsecond part");
        assert_eq!(lines[1], "UID:u1");
    }

    #[test]
    fn embeds_response_before_end_of_event() {
        let result = embed_response_property(SAMPLE, ResponseStatus::Accepted);
        assert!(result.contains("X-CALSYNC-RESPONSE:ACCEPTED\r\nEND:VEVENT"));
    }

    #[test]
    fn embedding_twice_keeps_a_single_property() {
        let once = embed_response_property(SAMPLE, ResponseStatus::Accepted);
        let twice = embed_response_property(&once, ResponseStatus::Declined);
        assert_eq!(twice.matches("X-CALSYNC-RESPONSE").count(), 1);
        assert!(twice.contains("X-CALSYNC-RESPONSE:DECLINED"));
    }

    #[test]
    fn replaces_vevent_property() {
        let result = set_vevent_property(SAMPLE, "SUMMARY", Some("Planning"));
        assert!(result.contains("SUMMARY:Planning"));
        assert!(!result.contains("SUMMARY:Kickoff"));
    }
}
