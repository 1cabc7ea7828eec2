use calsync_core::HistoryEntry;
use serde_json::Value;
use tracing::warn;

/// Coerce a stored history blob into the canonical entry list.
///
/// Legacy rows carried double-encoded JSON strings or free-form values; the
/// second return value reports whether the stored form differed from the
/// canonical one and needs to be written back.
pub fn normalize_history(raw: &Value) -> (Vec<HistoryEntry>, bool) {
    let mut changed = false;

    let candidate = match raw {
        Value::String(inner) => match serde_json::from_str::<Value>(inner) {
            Ok(parsed) => {
                changed = true;
                parsed
            }
            Err(_) => {
                warn!("History blob is not valid JSON, dropping");
                return (Vec::new(), true);
            }
        },
        other => other.clone(),
    };

    let entries = match candidate {
        Value::Null => return (Vec::new(), changed),
        Value::Array(entries) => entries,
        other => {
            warn!("History has unexpected type {}, resetting", type_name(&other));
            return (Vec::new(), true);
        }
    };

    let total = entries.len();
    let mut normalized = Vec::with_capacity(total);
    for entry in entries {
        let Value::Object(map) = entry else {
            warn!("Skipping non-object history entry");
            changed = true;
            continue;
        };
        let timestamp = map.get("timestamp").and_then(Value::as_str);
        let action = map.get("action").and_then(Value::as_str);
        let description = map.get("description").and_then(Value::as_str);
        match (timestamp, action, description) {
            (Some(timestamp), Some(action), Some(description)) => {
                normalized.push(HistoryEntry {
                    timestamp: timestamp.to_string(),
                    action: action.to_string(),
                    description: description.to_string(),
                });
            }
            _ => {
                warn!("Skipping malformed history entry");
                changed = true;
            }
        }
    }

    if normalized.len() != total {
        changed = true;
    }

    (normalized, changed)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_history;
    use serde_json::json;

    #[test]
    fn canonical_history_is_unchanged() {
        let raw = json!([
            {"timestamp": "2024-01-01T09:00:00+00:00", "action": "new", "description": "Event processed from message 1"}
        ]);
        let (entries, changed) = normalize_history(&raw);
        assert_eq!(entries.len(), 1);
        assert!(!changed);
    }

    #[test]
    fn double_encoded_history_is_coerced() {
        let raw = json!("[{\"timestamp\": \"t\", \"action\": \"new\", \"description\": \"d\"}]");
        let (entries, changed) = normalize_history(&raw);
        assert_eq!(entries.len(), 1);
        assert!(changed);
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let raw = json!([
            {"timestamp": "t", "action": "new", "description": "ok"},
            {"timestamp": 42, "action": "new"},
            "free text",
        ]);
        let (entries, changed) = normalize_history(&raw);
        assert_eq!(entries.len(), 1);
        assert!(changed);
    }

    #[test]
    fn unexpected_types_reset_history() {
        let (entries, changed) = normalize_history(&json!({"not": "a list"}));
        assert!(entries.is_empty());
        assert!(changed);

        let (entries, changed) = normalize_history(&json!(null));
        assert!(entries.is_empty());
        assert!(!changed);
    }
}
