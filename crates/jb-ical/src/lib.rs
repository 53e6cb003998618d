//! iCalendar feed adapter.
//!
//! Fetches a feed over HTTP and reads its `VEVENT` components into
//! [`FeedEvent`]s. Recurrence rules are not expanded; each `VEVENT` is one
//! event at its `DTSTART`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use jb_core::{domain::FeedEvent, errors::Error, feeds::FeedSource, Result};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct IcalFeedSource {
    http: reqwest::Client,
    timeout: Duration,
}

impl IcalFeedSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self { http, timeout })
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Fetch(e.to_string())
        }
    }
}

#[async_trait]
impl FeedSource for IcalFeedSource {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEvent>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(Error::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(Error::Fetch(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            // Client errors will not fix themselves on retry.
            return Err(Error::Invalid(format!("{url} returned {status}")));
        }

        let body = resp.text().await.map_err(|e| self.map_send_error(e))?;
        let events = parse_calendar(&body)?;
        tracing::debug!(url, events = events.len(), "calendar fetched");
        Ok(events)
    }
}

/// Read every `VEVENT` in an iCalendar document.
///
/// Events without a usable `DTSTART` are skipped.
pub fn parse_calendar(text: &str) -> Result<Vec<FeedEvent>> {
    let lines = unfold(text);
    if !lines
        .iter()
        .any(|l| l.eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(Error::Invalid("not an iCalendar document".to_string()));
    }

    let mut events = Vec::new();
    let mut current: Option<EventBuilder> = None;
    // Depth of components nested inside the current VEVENT (VALARM and friends).
    let mut nested = 0usize;

    for line in &lines {
        let Some(prop) = ContentLine::parse(line) else {
            continue;
        };
        let in_event = current.is_some();
        match prop.name.as_str() {
            "BEGIN" if !in_event => {
                if prop.value.eq_ignore_ascii_case("VEVENT") {
                    current = Some(EventBuilder::default());
                    nested = 0;
                }
            }
            "BEGIN" => nested += 1,
            "END" if in_event && nested > 0 => nested -= 1,
            "END" if in_event && prop.value.eq_ignore_ascii_case("VEVENT") => {
                if let Some(event) = current.take().and_then(EventBuilder::build) {
                    events.push(event);
                }
            }
            _ if nested == 0 => {
                if let Some(builder) = current.as_mut() {
                    builder.set(&prop);
                }
            }
            _ => {}
        }
    }
    Ok(events)
}

/// Join folded continuation lines (RFC 5545 section 3.1).
fn unfold(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in text.lines() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(prev) = out.last_mut() {
                prev.push_str(rest);
                continue;
            }
        }
        if !raw.is_empty() {
            out.push(raw.to_string());
        }
    }
    out
}

struct ContentLine {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl ContentLine {
    fn parse(line: &str) -> Option<Self> {
        // The value starts at the first colon outside a quoted parameter value.
        let mut in_quotes = false;
        let split = line.char_indices().find_map(|(i, c)| match c {
            '"' => {
                in_quotes = !in_quotes;
                None
            }
            ':' if !in_quotes => Some(i),
            _ => None,
        })?;
        let (head, value) = (&line[..split], &line[split + 1..]);

        let mut parts = head.split(';');
        let name = parts.next()?.trim().to_ascii_uppercase();
        if name.is_empty() {
            return None;
        }
        let params = parts
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                Some((k.trim().to_ascii_uppercase(), v.trim_matches('"').to_string()))
            })
            .collect();
        Some(Self {
            name,
            params,
            value: value.to_string(),
        })
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct EventBuilder {
    uid: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    url: Option<String>,
    start: Option<(DateTime<Utc>, bool)>,
    end: Option<DateTime<Utc>>,
}

impl EventBuilder {
    fn set(&mut self, prop: &ContentLine) {
        match prop.name.as_str() {
            "UID" => self.uid = non_empty(prop.value.trim().to_string()),
            "SUMMARY" => self.summary = non_empty(unescape(&prop.value)),
            "DESCRIPTION" => self.description = non_empty(unescape(&prop.value)),
            "LOCATION" => self.location = non_empty(unescape(&prop.value)),
            "URL" => self.url = non_empty(prop.value.trim().to_string()),
            "DTSTART" => self.start = parse_when(prop),
            "DTEND" => self.end = parse_when(prop).map(|(at, _)| at),
            _ => {}
        }
    }

    fn build(self) -> Option<FeedEvent> {
        let Some((start, all_day)) = self.start else {
            tracing::debug!(uid = ?self.uid, "skipping VEVENT without DTSTART");
            return None;
        };
        let summary = self.summary.unwrap_or_else(|| "No Title".to_string());
        // Feeds without UIDs still need a stable identity for de-duplication.
        let uid = self
            .uid
            .unwrap_or_else(|| format!("{}-{}", start.format("%Y%m%dT%H%M%SZ"), summary));
        Some(FeedEvent {
            uid,
            summary,
            description: self.description,
            location: self.location,
            start,
            end: self.end,
            url: self.url,
            all_day,
        })
    }
}

/// Returns the instant and whether it was a plain DATE.
///
/// Floating and `TZID` times are read as UTC.
fn parse_when(prop: &ContentLine) -> Option<(DateTime<Utc>, bool)> {
    let value = prop.value.trim();
    let is_date = prop
        .param("VALUE")
        .is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
        || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));

    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some((Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?), true));
    }

    let naive = value.strip_suffix('Z').unwrap_or(value);
    let at = NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S").ok()?;
    if !value.ends_with('Z') {
        if let Some(tz) = prop.param("TZID") {
            tracing::debug!(tzid = tz, "treating zoned time as UTC");
        }
    }
    Some((Utc.from_utc_datetime(&at), false))
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out.trim().to_string()
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const SAMPLE: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//Club//Events//EN\r\n\
BEGIN:VEVENT\r\n\
UID:evt-1@club\r\n\
DTSTART:20300105T180000Z\r\n\
DTEND:20300105T200000Z\r\n\
SUMMARY:Board game night\r\n\
DESCRIPTION:Bring snacks\\, games\\nand friends\r\n\
LOCATION:Room 4\\; 2nd floor\r\n\
URL:https://example.org/e/1\r\n\
BEGIN:VALARM\r\n\
ACTION:DISPLAY\r\n\
DESCRIPTION:alarm text\r\n\
END:VALARM\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:evt-2@club\r\n\
DTSTART;VALUE=DATE:20300110\r\n\
SUMMARY:Clean-up \r\n\
\x20day\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:no-start@club\r\n\
SUMMARY:Broken\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn parses_timed_and_all_day_events() {
        let events = parse_calendar(SAMPLE).unwrap();
        assert_eq!(events.len(), 2);

        let night = &events[0];
        assert_eq!(night.uid, "evt-1@club");
        assert_eq!(night.summary, "Board game night");
        assert_eq!(night.description.as_deref(), Some("Bring snacks, games\nand friends"));
        assert_eq!(night.location.as_deref(), Some("Room 4; 2nd floor"));
        assert_eq!(night.url.as_deref(), Some("https://example.org/e/1"));
        assert_eq!(night.start, utc(2030, 1, 5, 18));
        assert_eq!(night.end, Some(utc(2030, 1, 5, 20)));
        assert!(!night.all_day);

        let cleanup = &events[1];
        assert_eq!(cleanup.summary, "Clean-up day");
        assert_eq!(cleanup.start, utc(2030, 1, 10, 0));
        assert!(cleanup.all_day);
        assert_eq!(cleanup.end, None);
    }

    #[test]
    fn missing_uid_gets_a_stable_fallback() {
        let text = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nDTSTART;TZID=\"Europe/Berlin\":20300105T180000\nEND:VEVENT\nEND:VCALENDAR\n";
        let first = parse_calendar(text).unwrap();
        let second = parse_calendar(text).unwrap();
        assert_eq!(first[0].uid, "20300105T180000Z-No Title");
        assert_eq!(first[0].uid, second[0].uid);
    }

    #[test]
    fn rejects_non_calendar_bodies() {
        let err = parse_calendar("<html>login required</html>").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn fetch_reads_events_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/club.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE))
            .mount(&server)
            .await;

        let source = IcalFeedSource::new(Duration::from_secs(5)).unwrap();
        let events = source
            .fetch(&format!("{}/club.ics", server.uri()))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn status_codes_map_to_retry_classes() {
        let server = MockServer::start().await;
        Mock::given(path("/gone.ics"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/busy.ics"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;
        Mock::given(path("/down.ics"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = IcalFeedSource::new(Duration::from_secs(5)).unwrap();
        let base = server.uri();

        let gone = source.fetch(&format!("{base}/gone.ics")).await.unwrap_err();
        assert!(!gone.is_transient());

        let busy = source.fetch(&format!("{base}/busy.ics")).await.unwrap_err();
        assert_eq!(busy.retry_after(), Some(Duration::from_secs(7)));

        let down = source.fetch(&format!("{base}/down.ics")).await.unwrap_err();
        assert!(matches!(down, Error::Fetch(_)));
        assert!(down.is_transient());
    }

    #[tokio::test]
    async fn slow_feeds_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(SAMPLE)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let source = IcalFeedSource::new(Duration::from_millis(200)).unwrap();
        let err = source.fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
