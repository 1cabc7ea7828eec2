use crate::datetime::property_datetime;
use crate::error::IcalError;
use crate::payload::unescape_ical_text;
use calsync_core::EventSnapshot;
use ical::property::Property;
use std::io::Cursor;

/// Reduce a payload to the snapshot used for diff rendering and conflict
/// capture. Picks the VEVENT matching `uid` when given, the first otherwise.
pub fn extract_event_snapshot(payload: &str, uid: Option<&str>) -> Result<EventSnapshot, IcalError> {
    let parser = ical::IcalParser::new(Cursor::new(payload.as_bytes()));
    let mut first: Option<EventSnapshot> = None;

    for calendar in parser {
        let calendar = calendar.map_err(|err| IcalError::Parse(err.to_string()))?;
        for event in &calendar.events {
            let snapshot = snapshot_from_properties(&event.properties);
            if let Some(wanted) = uid {
                if snapshot.uid.as_deref() == Some(wanted) {
                    return Ok(snapshot);
                }
            }
            if first.is_none() {
                first = Some(snapshot);
            }
        }
    }

    first.ok_or_else(|| IcalError::Data("payload contains no VEVENT".to_string()))
}

fn snapshot_from_properties(properties: &[Property]) -> EventSnapshot {
    EventSnapshot {
        uid: property_value(properties, "UID"),
        summary: property_value(properties, "SUMMARY").map(|value| unescape_ical_text(&value)),
        organizer: property_value(properties, "ORGANIZER").map(|value| {
            let trimmed = value.trim();
            if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("mailto:") {
                trimmed[7..].to_string()
            } else {
                trimmed.to_string()
            }
        }),
        start: property(properties, "DTSTART")
            .and_then(property_datetime)
            .map(|value| value.to_rfc3339()),
        end: property(properties, "DTEND")
            .and_then(property_datetime)
            .map(|value| value.to_rfc3339()),
        location: property_value(properties, "LOCATION").map(|value| unescape_ical_text(&value)),
        description: property_value(properties, "DESCRIPTION")
            .map(|value| unescape_ical_text(&value)),
        response_status: property_value(properties, "X-CALSYNC-RESPONSE")
            .map(|value| value.trim().to_ascii_lowercase()),
    }
}

fn property<'a>(properties: &'a [Property], key: &str) -> Option<&'a Property> {
    properties
        .iter()
        .find(|property| property.name.eq_ignore_ascii_case(key))
}

fn property_value(properties: &[Property], key: &str) -> Option<String> {
    property(properties, key).and_then(|property| property.value.clone())
}

#[cfg(test)]
mod tests {
    use super::extract_event_snapshot;

    const PAYLOAD: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:a1\r\nSUMMARY:First\r\nDTSTART:20240101T090000Z\r\nDTEND:20240101T100000Z\r\nLOCATION:Raum 2\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:b2\r\nSUMMARY:Second\r\nDTSTART:20240202T090000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn selects_component_by_uid() {
        let snapshot = extract_event_snapshot(PAYLOAD, Some("b2")).expect("snapshot");
        assert_eq!(snapshot.summary.as_deref(), Some("Second"));
    }

    #[test]
    fn falls_back_to_first_component() {
        let snapshot = extract_event_snapshot(PAYLOAD, Some("missing")).expect("snapshot");
        assert_eq!(snapshot.uid.as_deref(), Some("a1"));
        assert_eq!(snapshot.location.as_deref(), Some("Raum 2"));
    }

    #[test]
    fn snapshot_is_stable_across_reparses() {
        let first = extract_event_snapshot(PAYLOAD, Some("a1")).expect("snapshot");
        let second = extract_event_snapshot(PAYLOAD, Some("a1")).expect("snapshot");
        assert_eq!(first, second);
    }
}
