//! Decision engine: pure mapping from (intent, availability) to a decision,
//! plus drafting of the reply text.
//!
//! Nothing here performs I/O. Equal inputs always produce equal decisions.

use crate::config::{AssistantConfig, BusinessHours};
use crate::error::PipelineError;
use crate::mail::OutboundEmail;
use crate::pipeline::types::{AvailabilitySlot, Decision, DecisionKind, MeetingIntent, TimeRange};

/// What the resolver stage produced for this message.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Slots(Vec<AvailabilitySlot>),
    CalendarUnavailable(String),
    Contradictory(String),
    /// The calendar was not consulted (low confidence).
    NotChecked,
}

impl Availability {
    /// Map a resolver result onto an availability outcome.
    pub fn from_resolution(result: Result<Vec<AvailabilitySlot>, PipelineError>) -> Self {
        match result {
            Ok(slots) => Self::Slots(slots),
            Err(PipelineError::ContradictoryConstraints(reason)) => Self::Contradictory(reason),
            Err(e) => Self::CalendarUnavailable(e.to_string()),
        }
    }
}

/// Threshold-driven decision rules.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    low_threshold: f64,
    high_threshold: f64,
    business_hours: BusinessHours,
}

impl DecisionEngine {
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            low_threshold: config.low_threshold,
            high_threshold: config.high_threshold,
            business_hours: config.business_hours,
        }
    }

    /// Reject intents that no calendar could satisfy, before any lookup.
    pub fn check_constraints(&self, intent: &MeetingIntent) -> Result<(), PipelineError> {
        let duration = i64::from(intent.duration_minutes);
        let day = self.business_hours.day_minutes();
        if duration > day {
            return Err(PipelineError::ContradictoryConstraints(format!(
                "a {duration}-minute meeting does not fit in a {day}-minute working day"
            )));
        }
        if !intent.preferred_windows.is_empty()
            && intent
                .preferred_windows
                .iter()
                .all(|w| w.duration().num_minutes() < duration)
        {
            return Err(PipelineError::ContradictoryConstraints(format!(
                "none of the proposed times is long enough for a {duration}-minute meeting"
            )));
        }
        Ok(())
    }

    /// Decide how to respond. Rules apply in order; the first match wins.
    pub fn decide(&self, intent: &MeetingIntent, availability: &Availability) -> Decision {
        if intent.confidence < self.low_threshold {
            return Decision::clarify(
                "I couldn't tell exactly what meeting you have in mind. \
                 Could you confirm the attendees, how long it should be, and a few times that suit you?",
            );
        }

        let slots = match availability {
            Availability::Contradictory(reason) => {
                return Decision::decline(format!(
                    "Unfortunately this request can't be scheduled: {reason}."
                ));
            }
            Availability::CalendarUnavailable(_) => {
                return Decision::clarify(
                    "Apologies, I couldn't reach the calendar to check availability just now. \
                     Could you reply with a couple of times that work for you and I'll confirm?",
                );
            }
            Availability::NotChecked => {
                return Decision::clarify(
                    "Could you share a few times that work for you so I can check availability?",
                );
            }
            Availability::Slots(slots) => slots,
        };

        if slots.is_empty() {
            return Decision::clarify(
                "There is no availability that works for everyone in the requested time frame. \
                 Could you suggest some other times?",
            );
        }

        let mut ordered: Vec<&AvailabilitySlot> = slots.iter().collect();
        ordered.sort_by(|a, b| (a.rank, a.range.start()).cmp(&(b.rank, b.range.start())));
        let ranges: Vec<TimeRange> = ordered.iter().map(|s| s.range).collect();

        if intent.confidence >= self.high_threshold
            && intent.auto_book
            && let Some((chosen, rest)) = ranges.split_first()
        {
            return Decision {
                kind: DecisionKind::Book,
                chosen_slot: Some(*chosen),
                alternative_slots: rest.to_vec(),
                rationale: format!("Booked {chosen}, the best slot where everyone is free."),
            };
        }

        Decision {
            kind: DecisionKind::Propose,
            chosen_slot: None,
            rationale: format!(
                "Proposed {} time{} where everyone is free.",
                ranges.len(),
                if ranges.len() == 1 { "" } else { "s" }
            ),
            alternative_slots: ranges,
        }
    }

    /// Compose the outbound reply for a decision. Pure.
    pub fn draft_reply(
        &self,
        intent: &MeetingIntent,
        decision: &Decision,
        recipient: &str,
    ) -> OutboundEmail {
        let title = intent.title();
        let mut body = String::from("Hi,\n\n");

        match decision.kind {
            DecisionKind::Book => {
                if let Some(slot) = decision.chosen_slot {
                    body.push_str(&format!("I've scheduled \"{title}\" for {slot}.\n"));
                    let others: Vec<&str> = intent
                        .participants
                        .iter()
                        .map(String::as_str)
                        .filter(|p| *p != recipient)
                        .collect();
                    if others.is_empty() {
                        body.push_str("A calendar invitation is on its way.\n");
                    } else {
                        body.push_str(&format!(
                            "A calendar invitation is on its way to you and {}.\n",
                            others.join(", ")
                        ));
                    }
                }
                if !intent.agenda_items.is_empty() {
                    body.push_str("\nAgenda:\n");
                    for item in &intent.agenda_items {
                        body.push_str(&format!("- {item}\n"));
                    }
                }
            }
            DecisionKind::Propose => {
                body.push_str(&format!(
                    "Thanks for reaching out about \"{title}\". The following {}-minute times are available:\n\n",
                    intent.duration_minutes
                ));
                for (i, slot) in decision.alternative_slots.iter().enumerate() {
                    body.push_str(&format!("{}. {slot}\n", i + 1));
                }
                body.push_str("\nLet me know which one works best and I'll send an invitation.\n");
            }
            DecisionKind::Clarify | DecisionKind::Decline => {
                body.push_str(&decision.rationale);
                body.push('\n');
            }
        }
        body.push_str("\nBest regards,\nExecutive Assistant");

        OutboundEmail {
            to: recipient.to_string(),
            subject: format!("Re: {title}"),
            body,
            in_reply_to: None,
        }
    }
}
