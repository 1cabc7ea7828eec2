use crate::datetime::{param_value, property_datetime};
use crate::error::IcalError;
use crate::payload::{unescape_ical_text, unfold_lines, vevent_blocks, wrap_vevent};
use calsync_core::{EventStatus, ResponseStatus};
use chrono::{DateTime, Utc};
use ical::property::Property;
use std::io::Cursor;
use tracing::{debug, warn};

/// Attendee metadata extracted from a VEVENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub name: Option<String>,
    pub address: Option<String>,
    pub participation: Option<String>,
    pub role: Option<String>,
    pub cutype: Option<String>,
    pub rsvp: Option<bool>,
}

/// One calendar object decoded from a mail attachment. `raw` is the
/// standalone VCALENDAR serialization stored as the event payload.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub uid: String,
    pub summary: Option<String>,
    pub organizer: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub method: Option<String>,
    pub response_status: Option<ResponseStatus>,
    pub attendees: Vec<Attendee>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedCalendar {
    pub method: Option<String>,
    pub events: Vec<ParsedEvent>,
}

/// Parse an ICS payload into the ordered list of events it contains plus the
/// calendar-level METHOD.
pub fn parse_ics_payload(payload: &[u8]) -> Result<DecodedCalendar, IcalError> {
    let text = String::from_utf8_lossy(payload).into_owned();
    let lines = unfold_lines(&text);
    let blocks = vevent_blocks(&lines);

    let parser = ical::IcalParser::new(Cursor::new(text.as_bytes()));
    let mut decoded = DecodedCalendar::default();
    let mut block_index = 0;

    for calendar in parser {
        let calendar = calendar.map_err(|err| IcalError::Parse(err.to_string()))?;
        let method = property_value(&calendar.properties, "METHOD")
            .map(|value| value.trim().to_ascii_uppercase());
        if decoded.method.is_none() {
            decoded.method = method.clone();
        }

        for event in &calendar.events {
            let block = blocks
                .get(block_index)
                .ok_or_else(|| IcalError::Parse("inconsistent VEVENT structure".to_string()))?;
            block_index += 1;

            let Some(uid) = property_value(&event.properties, "UID") else {
                warn!("Skipping VEVENT without UID");
                continue;
            };

            let status = match property_value(&event.properties, "STATUS")
                .map(|value| value.to_ascii_uppercase())
                .as_deref()
            {
                Some("CANCELLED") => EventStatus::Cancelled,
                _ => EventStatus::New,
            };

            let attendees = parse_attendees(&event.properties);
            let response_status = if method.as_deref() == Some("REPLY") {
                reply_response(&attendees)
            } else {
                None
            };

            decoded.events.push(ParsedEvent {
                uid,
                summary: property_value(&event.properties, "SUMMARY")
                    .map(|value| unescape_ical_text(&value)),
                organizer: property_value(&event.properties, "ORGANIZER")
                    .map(|value| strip_mailto(&value)),
                start: property(&event.properties, "DTSTART").and_then(property_datetime),
                end: property(&event.properties, "DTEND").and_then(property_datetime),
                status,
                method: method.clone(),
                response_status,
                attendees,
                location: property_value(&event.properties, "LOCATION")
                    .map(|value| unescape_ical_text(&value)),
                description: property_value(&event.properties, "DESCRIPTION")
                    .map(|value| unescape_ical_text(&value)),
                raw: wrap_vevent(method.as_deref(), &lines[block.0..=block.1]),
            });
        }
    }

    debug!("Parsed {} events from ICS payload", decoded.events.len());
    Ok(decoded)
}

fn parse_attendees(properties: &[Property]) -> Vec<Attendee> {
    properties
        .iter()
        .filter(|property| property.name.eq_ignore_ascii_case("ATTENDEE"))
        .map(|property| Attendee {
            name: param_value(property, "CN"),
            address: property
                .value
                .as_deref()
                .map(strip_mailto)
                .filter(|address| !address.is_empty()),
            participation: param_value(property, "PARTSTAT")
                .map(|value| value.to_ascii_uppercase()),
            role: param_value(property, "ROLE").map(|value| value.to_ascii_uppercase()),
            cutype: param_value(property, "CUTYPE").map(|value| value.to_ascii_uppercase()),
            rsvp: param_value(property, "RSVP").map(|value| value.eq_ignore_ascii_case("TRUE")),
        })
        .collect()
}

/// For a REPLY, the first attendee with a definitive PARTSTAT carries the
/// participation answer.
fn reply_response(attendees: &[Attendee]) -> Option<ResponseStatus> {
    attendees
        .iter()
        .filter_map(|attendee| attendee.participation.as_deref())
        .find_map(|participation| match participation {
            "ACCEPTED" => Some(ResponseStatus::Accepted),
            "TENTATIVE" => Some(ResponseStatus::Tentative),
            "DECLINED" => Some(ResponseStatus::Declined),
            _ => None,
        })
}

fn property<'a>(properties: &'a [Property], key: &str) -> Option<&'a Property> {
    properties
        .iter()
        .find(|property| property.name.eq_ignore_ascii_case(key))
}

fn property_value(properties: &[Property], key: &str) -> Option<String> {
    property(properties, key).and_then(|property| property.value.clone())
}

fn strip_mailto(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("mailto:") {
        trimmed[7..].to_string()
    } else {
        trimmed.to_string()
    }
}
