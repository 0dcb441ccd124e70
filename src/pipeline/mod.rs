//! Inbound email pipeline.
//!
//! Every inbound email flows through:
//! 1. `normalize()`: canonical text
//! 2. `EmailClassifier::classify()`: rules first, then the LLM
//! 3. `route()`: meeting requests continue below; urgent, auto-reply,
//!    bulk and informational mail are settled here
//! 4. `IntentExtractor::extract()`: LLM reading, validated
//! 5. `AvailabilityResolver::resolve()`: free/busy → ranked slots
//! 6. `DecisionEngine::decide()`: book, propose, clarify or decline
//! 7. `ActivityRecorder::record()`: append-only audit entry
//!
//! `MeetingProcessor` wires the stages together.

pub mod decision;
pub mod extract;
pub mod normalize;
pub mod processor;
pub mod recorder;
pub mod resolver;
pub mod retry;
pub mod triage;
pub mod types;

pub use decision::{Availability, DecisionEngine};
pub use extract::{Extraction, IntentExtractor};
pub use normalize::normalize;
pub use processor::{MeetingProcessor, ProcessingOutcome};
pub use recorder::{ActivityRecorder, RecordStatus};
pub use resolver::AvailabilityResolver;
pub use triage::{AutoResponder, EmailClassifier, Route, TriageRules, route};
