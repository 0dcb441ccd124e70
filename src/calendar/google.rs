//! Google Calendar REST adapter.
//!
//! Takes a ready OAuth bearer token; token minting and service-account setup
//! happen outside this process.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::calendar::{BookingRequest, CalendarProvider};
use crate::error::CalendarError;
use crate::pipeline::types::TimeRange;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Google Calendar client for one owner calendar.
pub struct GoogleCalendar {
    token: SecretString,
    owner_calendar: String,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleCalendar {
    pub fn new(token: SecretString, owner_calendar: impl Into<String>) -> Self {
        Self {
            token,
            owner_calendar: owner_calendar.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different API root (used for proxies and tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// `calendars/{owner}/events`, with the calendar id percent-encoded as
    /// one path segment (group and resource ids contain `#`).
    fn events_url(&self) -> Result<reqwest::Url, CalendarError> {
        let invalid = |reason: String| CalendarError::InvalidResponse {
            provider: "google".into(),
            reason,
        };
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("bad base url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| invalid(format!("base url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("calendars")
            .push(&self.owner_calendar)
            .push("events");
        Ok(url)
    }

    fn unreachable(e: reqwest::Error) -> CalendarError {
        CalendarError::Unreachable {
            provider: "google".into(),
            reason: e.to_string(),
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FreeBusyResponse {
    #[serde(default)]
    calendars: BTreeMap<String, FreeBusyCalendar>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyCalendar {
    #[serde(default)]
    busy: Vec<BusyPeriod>,
    #[serde(default)]
    errors: Vec<FreeBusyError>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyError {
    #[serde(default)]
    reason: String,
}

/// The only per-calendar error that still means "no busy time we can see".
const NOT_FOUND: &str = "notFound";

#[derive(Debug, Deserialize)]
struct BusyPeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    id: String,
}

fn freebusy_body(participants: &BTreeSet<String>, window: &TimeRange) -> serde_json::Value {
    let items: Vec<serde_json::Value> = participants
        .iter()
        .map(|id| serde_json::json!({ "id": id }))
        .collect();
    serde_json::json!({
        "timeMin": window.start().to_rfc3339(),
        "timeMax": window.end().to_rfc3339(),
        "timeZone": "UTC",
        "items": items,
    })
}

fn event_body(request: &BookingRequest) -> serde_json::Value {
    let attendees: Vec<serde_json::Value> = request
        .participants
        .iter()
        .map(|email| serde_json::json!({ "email": email }))
        .collect();
    serde_json::json!({
        "summary": request.subject,
        "description": request.description,
        "start": { "dateTime": request.range.start().to_rfc3339(), "timeZone": "UTC" },
        "end": { "dateTime": request.range.end().to_rfc3339(), "timeZone": "UTC" },
        "attendees": attendees,
    })
}

/// Busy ranges per calendar. A calendar that reported errors was never
/// read, so it fails the lookup, except an external participant's
/// `notFound` (no shared calendar), which counts as free.
fn parse_freebusy(
    response: FreeBusyResponse,
    owner: &str,
) -> Result<BTreeMap<String, Vec<TimeRange>>, CalendarError> {
    let owner = owner.to_lowercase();
    let mut out = BTreeMap::new();
    for (id, calendar) in response.calendars {
        let id = id.to_lowercase();
        if !calendar.errors.is_empty() {
            let reasons: Vec<&str> = calendar.errors.iter().map(|e| e.reason.as_str()).collect();
            if id == owner || reasons.iter().any(|r| *r != NOT_FOUND) {
                return Err(CalendarError::Unreachable {
                    provider: "google".into(),
                    reason: format!("free/busy for {id} failed: {}", reasons.join(", ")),
                });
            }
            warn!(calendar = %id, "Participant calendar not found, treating as free");
        }
        let mut busy = Vec::with_capacity(calendar.busy.len());
        for period in calendar.busy {
            let range = TimeRange::new(period.start, period.end).map_err(|e| {
                CalendarError::InvalidResponse {
                    provider: "google".into(),
                    reason: e.to_string(),
                }
            })?;
            busy.push(range);
        }
        out.insert(id, busy);
    }
    if !out.contains_key(&owner) {
        return Err(CalendarError::InvalidResponse {
            provider: "google".into(),
            reason: format!("free/busy response has no entry for {owner}"),
        });
    }
    Ok(out)
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    fn name(&self) -> &str {
        "google"
    }

    async fn free_busy(
        &self,
        participants: &BTreeSet<String>,
        window: &TimeRange,
    ) -> Result<BTreeMap<String, Vec<TimeRange>>, CalendarError> {
        let resp = self
            .client
            .post(self.api_url("freeBusy"))
            .bearer_auth(self.token.expose_secret())
            .json(&freebusy_body(participants, window))
            .send()
            .await
            .map_err(Self::unreachable)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CalendarError::RequestFailed {
                provider: "google".into(),
                status: status.as_u16(),
                reason: body,
            });
        }

        let parsed: FreeBusyResponse =
            resp.json().await.map_err(|e| CalendarError::InvalidResponse {
                provider: "google".into(),
                reason: e.to_string(),
            })?;
        let busy = parse_freebusy(parsed, &self.owner_calendar)?;
        debug!(calendars = busy.len(), window = %window, "Fetched free/busy");
        Ok(busy)
    }

    async fn book(&self, request: &BookingRequest) -> Result<String, CalendarError> {
        let resp = self
            .client
            .post(self.events_url()?)
            .query(&[("sendUpdates", "all")])
            .bearer_auth(self.token.expose_secret())
            .json(&event_body(request))
            .send()
            .await
            .map_err(Self::unreachable)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CalendarError::RequestFailed {
                provider: "google".into(),
                status: status.as_u16(),
                reason: body,
            });
        }

        let event: EventResponse =
            resp.json().await.map_err(|e| CalendarError::InvalidResponse {
                provider: "google".into(),
                reason: e.to_string(),
            })?;
        Ok(event.id)
    }
}
