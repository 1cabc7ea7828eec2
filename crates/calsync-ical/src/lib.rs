mod datetime;
mod decoder;
mod error;
mod payload;
mod snapshot;

pub use datetime::{format_utc_datetime, parse_ical_datetime};
pub use decoder::{parse_ics_payload, Attendee, DecodedCalendar, ParsedEvent};
pub use error::IcalError;
pub use payload::{embed_response_property, escape_ical_text, set_vevent_property, unfold_lines};
pub use snapshot::extract_event_snapshot;
