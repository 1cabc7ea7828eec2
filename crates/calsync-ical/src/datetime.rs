use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use ical::property::Property;

/// Parse an iCalendar date or datetime value into UTC.
///
/// Date-only values ("YYYYMMDD") become midnight of that day. Floating
/// datetimes without a TZID are treated as UTC.
pub fn parse_ical_datetime(value: &str, tzid: Option<&str>) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
        return Some(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&midnight));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M"))
        .ok()?;

    if let Some(zone_name) = tzid {
        if let Ok(zone) = zone_name.parse::<Tz>() {
            return match zone.from_local_datetime(&naive) {
                LocalResult::Single(datetime) => Some(datetime.with_timezone(&Utc)),
                LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
                LocalResult::None => Some(Utc.from_utc_datetime(&naive)),
            };
        }
    }

    Some(Utc.from_utc_datetime(&naive))
}

pub fn format_utc_datetime(value: &DateTime<Utc>) -> String {
    value.format("%Y%m%dT%H%M%SZ").to_string()
}

pub(crate) fn property_datetime(property: &Property) -> Option<DateTime<Utc>> {
    let value = property.value.as_deref()?;
    parse_ical_datetime(value.trim(), param_value(property, "TZID").as_deref())
}

pub(crate) fn param_value(property: &Property, key: &str) -> Option<String> {
    let params = property.params.as_ref()?;
    params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .and_then(|(_, values)| values.first())
        .map(|value| value.trim_matches('"').to_string())
}
