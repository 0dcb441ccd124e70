//! Calendar provider abstraction.
//!
//! The resolver pulls free/busy data per request; nothing is cached between
//! messages.

mod google;

pub use google::GoogleCalendar;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::error::CalendarError;
use crate::pipeline::types::TimeRange;

/// A confirmed meeting to put on the calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingRequest {
    pub participants: BTreeSet<String>,
    pub range: TimeRange,
    pub subject: String,
    pub description: String,
}

/// External calendar with free/busy lookup and event creation.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Provider name, for logging.
    fn name(&self) -> &str;

    /// Busy intervals per participant within `window`. Participants with no
    /// busy time may be absent from the map.
    async fn free_busy(
        &self,
        participants: &BTreeSet<String>,
        window: &TimeRange,
    ) -> Result<BTreeMap<String, Vec<TimeRange>>, CalendarError>;

    /// Create an event and invite the participants. Returns the event id.
    async fn book(&self, request: &BookingRequest) -> Result<String, CalendarError>;
}
