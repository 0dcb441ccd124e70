//! Availability resolver: turns an intent plus calendar free/busy data into
//! ranked candidate slots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::calendar::CalendarProvider;
use crate::config::{AssistantConfig, BusinessHours};
use crate::error::PipelineError;
use crate::pipeline::types::{AvailabilitySlot, MeetingIntent, SlotRank, TimeRange, merge_ranges};

/// Queries free/busy and ranks slots where every attendee is free.
pub struct AvailabilityResolver {
    calendar: Arc<dyn CalendarProvider>,
    timeout: Duration,
    granularity_minutes: u32,
    max_slots: usize,
    horizon_business_days: u32,
    max_search_days: u32,
    business_hours: BusinessHours,
    owner: String,
}

/// Where candidates are searched and how they are anchored for ranking.
struct SearchPlan {
    windows: Vec<TimeRange>,
    anchor: DateTime<Utc>,
    preferred: bool,
}

impl AvailabilityResolver {
    pub fn new(calendar: Arc<dyn CalendarProvider>, config: &AssistantConfig) -> Self {
        Self {
            calendar,
            timeout: config.calendar_timeout,
            granularity_minutes: config.slot_granularity_minutes.max(1),
            max_slots: config.max_slots,
            horizon_business_days: config.horizon_business_days,
            max_search_days: config.max_search_days.max(1),
            business_hours: config.business_hours,
            owner: config.calendar_owner.clone(),
        }
    }

    /// Ranked slots, best first, at most `max_slots`. An empty list means
    /// nobody-is-free-together, not an error.
    pub async fn resolve(
        &self,
        intent: &MeetingIntent,
        now: DateTime<Utc>,
    ) -> Result<Vec<AvailabilitySlot>, PipelineError> {
        let plan = self.search_plan(intent, now);
        if plan.windows.is_empty() {
            debug!("No search window remains after clipping to now");
            return Ok(Vec::new());
        }

        let attendees = self.attendees(&intent.participants);
        // Windows are disjoint and sorted, and every candidate starts at or
        // after the anchor, so rank order is start order: the first
        // `max_slots` free candidates are the best ones.
        let mut slots = Vec::with_capacity(self.max_slots);
        'windows: for window in &plan.windows {
            let busy = self.fetch_busy(&attendees, window).await?;
            for range in self.candidates(window, intent.duration_minutes) {
                if !plan.preferred && !self.business_hours.contains(range.start(), range.end()) {
                    continue;
                }
                if is_busy(&busy, &range) {
                    continue;
                }
                slots.push(AvailabilitySlot {
                    range,
                    attendees_free: attendees.clone(),
                    rank: self.rank(&range, &plan),
                });
                if slots.len() >= self.max_slots {
                    break 'windows;
                }
            }
        }

        slots.sort_by(|a, b| (a.rank, a.range.start()).cmp(&(b.rank, b.range.start())));
        info!(
            windows = plan.windows.len(),
            attendees = attendees.len(),
            slots = slots.len(),
            "Resolved availability"
        );
        Ok(slots)
    }

    /// Re-check that every attendee is still free for `range`.
    pub async fn verify_free(
        &self,
        participants: &BTreeSet<String>,
        range: &TimeRange,
    ) -> Result<bool, PipelineError> {
        let attendees = self.attendees(participants);
        let busy = self.fetch_busy(&attendees, range).await?;
        let free = !is_busy(&busy, range);
        if !free {
            warn!(range = %range, "Slot no longer free at booking time");
        }
        Ok(free)
    }

    /// Calendar timeout, shared with the booking step.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn attendees(&self, participants: &BTreeSet<String>) -> BTreeSet<String> {
        let mut attendees: BTreeSet<String> =
            participants.iter().map(|p| p.to_lowercase()).collect();
        attendees.insert(self.owner.to_lowercase());
        attendees
    }

    async fn fetch_busy(
        &self,
        attendees: &BTreeSet<String>,
        window: &TimeRange,
    ) -> Result<BTreeMap<String, Vec<TimeRange>>, PipelineError> {
        match tokio::time::timeout(self.timeout, self.calendar.free_busy(attendees, window)).await
        {
            Ok(Ok(busy)) => Ok(busy),
            Ok(Err(e)) => Err(PipelineError::CalendarUnavailable(e.to_string())),
            Err(_) => Err(PipelineError::CalendarUnavailable(format!(
                "{} free/busy timed out after {:?}",
                self.calendar.name(),
                self.timeout
            ))),
        }
    }

    /// Longest span searched, counted from `now`.
    pub fn max_search_span(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_search_days))
    }

    fn search_plan(&self, intent: &MeetingIntent, now: DateTime<Utc>) -> SearchPlan {
        if !intent.preferred_windows.is_empty() {
            let limit = now + self.max_search_span();
            let clipped: Vec<TimeRange> = intent
                .preferred_windows
                .iter()
                .filter_map(|w| w.clip_start(now))
                .filter_map(|w| w.clip_end(limit))
                .collect();
            let anchor = intent
                .preferred_windows
                .iter()
                .map(|w| w.start())
                .min()
                .unwrap_or(now)
                .max(now);
            return SearchPlan {
                windows: merge_ranges(&clipped),
                anchor,
                preferred: true,
            };
        }

        let days = intent.urgency.horizon_days(self.horizon_business_days);
        let windows = horizon_end(&self.business_hours, now, days)
            .and_then(|end| TimeRange::new(now, end).ok())
            .into_iter()
            .collect();
        SearchPlan {
            windows,
            anchor: now,
            preferred: false,
        }
    }

    /// Aligned candidate ranges of `duration_minutes` inside `window`, in
    /// start order. Lazy, so callers that stop early pay only for what they
    /// consume.
    fn candidates(
        &self,
        window: &TimeRange,
        duration_minutes: u32,
    ) -> impl Iterator<Item = TimeRange> + use<> {
        let step = i64::from(self.granularity_minutes) * 60;
        let length = chrono::Duration::minutes(i64::from(duration_minutes));
        let first = window.start().timestamp().div_euclid(step) * step;
        let first = if first < window.start().timestamp() {
            first + step
        } else {
            first
        };
        let window = *window;

        (0_i64..)
            .map_while(move |i| Utc.timestamp_opt(first + i * step, 0).single())
            .map_while(move |start| TimeRange::new(start, start + length).ok())
            .take_while(move |range| window.contains_range(range))
    }

    fn rank(&self, range: &TimeRange, plan: &SearchPlan) -> SlotRank {
        SlotRank {
            outside_preferred: u8::from(!plan.preferred),
            distance_secs: (range.start() - plan.anchor).num_seconds().abs(),
            off_hours: u8::from(!self.business_hours.contains(range.start(), range.end())),
        }
    }
}

fn is_busy(busy: &BTreeMap<String, Vec<TimeRange>>, range: &TimeRange) -> bool {
    busy.values().flatten().any(|b| b.overlaps(range))
}

/// Closing time of the `days`-th business day counted from `now` (today
/// counts while still open).
fn horizon_end(hours: &BusinessHours, now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    let mut date = now.with_timezone(&hours.offset).date_naive();
    let mut counted = 0;
    // Weekends at most double the span; the extra slack covers the start day.
    for _ in 0..(days * 2 + 7) {
        let noon = hours
            .offset
            .from_local_datetime(&date.and_hms_opt(12, 0, 0)?)
            .single()?
            .with_timezone(&Utc);
        if hours.is_business_day(noon)
            && let Some((_, close)) = hours.day_window(noon)
            && close > now
        {
            counted += 1;
            if counted >= days {
                return Some(close);
            }
        }
        date = date.succ_opt()?;
    }
    None
}
