use crate::error::CalDavError;
use crate::multistatus::{
    escape_xml_text, is_calendar_resource, parse_http_date, response_blocks, tag_text,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

/// Credentials and endpoint of one CalDAV account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalDavSettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// The remote side of a tracked event: ETag, LAST-MODIFIED and raw payload.
#[derive(Debug, Clone, Default)]
pub struct RemoteEventState {
    pub uid: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub payload: Option<String>,
}

/// Condensed remote event used for overlap visualization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEventSummary {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub url: String,
    pub name: String,
}

/// Remote operations the reconciliation engine depends on.
#[async_trait]
pub trait CalDav: Send + Sync {
    /// Create or overwrite the calendar object for `uid`. Returns refreshed
    /// remote state when the server provides (or a follow-up fetch finds) one.
    async fn upload(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        uid: &str,
        ical: &str,
    ) -> Result<Option<RemoteEventState>, CalDavError>;

    /// Best-effort removal; reports whether something was deleted.
    async fn delete_by_uid(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        uid: &str,
    ) -> Result<bool, CalDavError>;

    async fn get_event_state(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        uid: &str,
    ) -> Result<Option<RemoteEventState>, CalDavError>;

    async fn search_overlapping(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RemoteEventSummary>, CalDavError>;

    async fn list_calendars(
        &self,
        settings: &CalDavSettings,
    ) -> Result<Vec<CalendarInfo>, CalDavError>;
}

#[derive(Debug, Default)]
pub struct CalDavClient {
    http: reqwest::Client,
}

impl CalDavClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        settings: &CalDavSettings,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(username) = &settings.username {
            request = request.basic_auth(username, settings.password.as_deref());
        }
        request
    }

    async fn report(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        body: String,
    ) -> Result<String, CalDavError> {
        let response = self
            .request(
                Method::from_bytes(b"REPORT").expect("valid method"),
                calendar_url,
                settings,
            )
            .header("Depth", "1")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CalDavError::Status(format!(
                "CalDAV REPORT failed with status {status}"
            )));
        }
        Ok(response.text().await?)
    }

    /// PROPFIND for `getetag` on the event resource, used when the REPORT did
    /// not hand back an ETag.
    async fn propfind_etag(
        &self,
        settings: &CalDavSettings,
        event_url: &str,
    ) -> Result<Option<String>, CalDavError> {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:getetag /></D:prop></D:propfind>"#;

        let response = self
            .request(
                Method::from_bytes(b"PROPFIND").expect("valid method"),
                event_url,
                settings,
            )
            .header("Depth", "0")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CalDavError::Status(format!(
                "CalDAV PROPFIND failed with status {}",
                response.status()
            )));
        }

        let text = response.text().await?;
        Ok(response_blocks(&text)
            .first()
            .and_then(|block| tag_text(block, "getetag")))
    }
}

fn event_url(calendar_url: &str, uid: &str) -> String {
    format!("{}/{uid}.ics", calendar_url.trim_end_matches('/'))
}

fn state_from_block(uid: &str, block: &str) -> RemoteEventState {
    RemoteEventState {
        uid: uid.to_string(),
        etag: tag_text(block, "getetag"),
        last_modified: tag_text(block, "getlastmodified")
            .as_deref()
            .and_then(parse_http_date),
        payload: tag_text(block, "calendar-data"),
    }
}

#[async_trait]
impl CalDav for CalDavClient {
    async fn upload(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        uid: &str,
        ical: &str,
    ) -> Result<Option<RemoteEventState>, CalDavError> {
        let target = event_url(calendar_url, uid);
        info!("Uploading event {uid} to {calendar_url}");

        let response = self
            .request(Method::PUT, &target, settings)
            .header("Content-Type", "text/calendar; charset=utf-8")
            .body(ical.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CalDavError::Status(format!(
                "CalDAV upload failed with status {status}"
            )));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        match etag {
            Some(etag) => Ok(Some(RemoteEventState {
                uid: uid.to_string(),
                etag: Some(etag),
                last_modified: None,
                payload: None,
            })),
            // No state in the PUT response; refresh it with a follow-up fetch.
            None => self.get_event_state(settings, calendar_url, uid).await,
        }
    }

    async fn delete_by_uid(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        uid: &str,
    ) -> Result<bool, CalDavError> {
        let target = event_url(calendar_url, uid);
        debug!("Deleting event {uid} from {calendar_url}");

        let response = self.request(Method::DELETE, &target, settings).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(CalDavError::Status(format!(
                "CalDAV delete failed with status {status}"
            )));
        }
        Ok(true)
    }

    async fn get_event_state(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        uid: &str,
    ) -> Result<Option<RemoteEventState>, CalDavError> {
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag />
    <D:getlastmodified />
    <C:calendar-data />
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:prop-filter name="UID">
          <C:text-match collation="i;octet">{}</C:text-match>
        </C:prop-filter>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
            escape_xml_text(uid)
        );

        let text = self.report(settings, calendar_url, body).await?;
        let blocks = response_blocks(&text);
        let Some(block) = blocks.first() else {
            return Ok(None);
        };

        let mut state = state_from_block(uid, block);
        if state.etag.is_none() {
            state.etag = self
                .propfind_etag(settings, &event_url(calendar_url, uid))
                .await?;
        }
        Ok(Some(state))
    }

    async fn search_overlapping(
        &self,
        settings: &CalDavSettings,
        calendar_url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RemoteEventSummary>, CalDavError> {
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag />
    <C:calendar-data />
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="{}" end="{}" />
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
            start.format("%Y%m%dT%H%M%SZ"),
            end.format("%Y%m%dT%H%M%SZ")
        );

        let text = self.report(settings, calendar_url, body).await?;
        let mut summaries = Vec::new();
        for block in response_blocks(&text) {
            let Some(data) = tag_text(block, "calendar-data") else {
                continue;
            };
            match calsync_ical::extract_event_snapshot(&data, None) {
                Ok(snapshot) => summaries.push(RemoteEventSummary {
                    uid: snapshot.uid,
                    summary: snapshot.summary,
                    start: snapshot.start,
                    end: snapshot.end,
                }),
                Err(err) => debug!("Skipping unparsable calendar-data block: {err}"),
            }
        }
        Ok(summaries)
    }

    async fn list_calendars(
        &self,
        settings: &CalDavSettings,
    ) -> Result<Vec<CalendarInfo>, CalDavError> {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:displayname />
    <D:resourcetype />
  </D:prop>
</D:propfind>"#;

        let response = self
            .request(
                Method::from_bytes(b"PROPFIND").expect("valid method"),
                &settings.url,
                settings,
            )
            .header("Depth", "1")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CalDavError::Status(format!(
                "CalDAV calendar listing failed with status {}",
                response.status()
            )));
        }

        let base = Url::parse(&settings.url)
            .map_err(|err| CalDavError::Data(format!("invalid CalDAV url: {err}")))?;
        let text = response.text().await?;

        let mut calendars = Vec::new();
        for block in response_blocks(&text) {
            if !is_calendar_resource(block) {
                continue;
            }
            let Some(href) = tag_text(block, "href") else {
                continue;
            };
            let absolute = base
                .join(&href)
                .map(|joined| joined.to_string())
                .unwrap_or(href.clone());
            let name = tag_text(block, "displayname").unwrap_or_else(|| absolute.clone());
            calendars.push(CalendarInfo {
                url: absolute,
                name,
            });
        }
        Ok(calendars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_url_joins_without_double_slash() {
        assert_eq!(
            event_url("https://dav.example.com/cal/", "u1"),
            "https://dav.example.com/cal/u1.ics"
        );
        assert_eq!(
            event_url("https://dav.example.com/cal", "u1"),
            "https://dav.example.com/cal/u1.ics"
        );
    }

    #[test]
    fn state_from_block_reads_etag_and_last_modified() {
        let block = r#"
          <d:getetag>"v2"</d:getetag>
          <d:getlastmodified>Mon, 01 Jan 2024 10:00:00 GMT</d:getlastmodified>
          <cal:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:u1
END:VEVENT
END:VCALENDAR</cal:calendar-data>
        "#;
        let state = state_from_block("u1", block);
        assert_eq!(state.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            state.last_modified.map(|value| value.to_rfc3339()),
            Some("2024-01-01T10:00:00+00:00".to_string())
        );
        assert!(state.payload.unwrap().contains("UID:u1"));
    }
}
