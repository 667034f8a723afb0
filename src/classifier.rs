//! Turns a snapshot of the marker directory into a plan of transitions.
//!
//! Classification happens in two explicit phases. Every event that already
//! has an `Ended` marker is resolved first; only then are events with a bare
//! `Started` marker announced. A start and an end that appear between two
//! polls therefore merge into one notification instead of racing a freshly
//! written `Sent` marker.

use std::collections::BTreeMap;

use crate::store::parse_sent;
use crate::types::{EventId, Marker, MarkerKind, SentRefs};

/// Everything known about one event id at snapshot time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMarkers {
    pub start_text: Option<String>,
    pub end_text: Option<String>,
    pub sent: Option<SentRefs>,
    pub staging: bool,
}

/// Marker payloads grouped by event id
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    events: BTreeMap<EventId, EventMarkers>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one marker. `payload` is ignored for staging files.
    pub fn insert(&mut self, marker: &Marker, payload: &str) {
        let entry = self.events.entry(marker.event.clone()).or_default();
        match marker.kind {
            MarkerKind::Started => entry.start_text = Some(payload.trim_end().to_string()),
            MarkerKind::Ended => entry.end_text = Some(payload.trim_end().to_string()),
            MarkerKind::Sent => entry.sent = Some(parse_sent(payload)),
            MarkerKind::SentTemp => entry.staging = true,
        }
    }

    /// Drop an event whose markers could not all be read
    pub fn remove(&mut self, event: &EventId) {
        self.events.remove(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventId, &EventMarkers)> {
        self.events.iter()
    }
}

/// What happened before an anomaly ended
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    /// Start notifications were delivered and recorded
    Notified {
        refs: SentRefs,
        lingering_start: bool,
    },
    /// The start marker was never consumed
    Unreported { start_text: String },
    /// Neither a start nor a record of one is left
    Unknown,
}

/// Lifecycle position of one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventState {
    /// Started, not yet ended. `recorded` holds destinations already reached.
    Active { start_text: String, recorded: SentRefs },
    /// Announced and waiting for the end marker
    NotifiedPending { refs: SentRefs },
    Resolved { end_text: String, prior: Prior },
    /// Only an abandoned staging file is left
    Staging,
}

impl EventMarkers {
    pub fn state(&self) -> EventState {
        if let Some(end_text) = &self.end_text {
            let prior = match (&self.sent, &self.start_text) {
                (Some(refs), start) => Prior::Notified {
                    refs: refs.clone(),
                    lingering_start: start.is_some(),
                },
                (None, Some(start_text)) => Prior::Unreported {
                    start_text: start_text.clone(),
                },
                (None, None) => Prior::Unknown,
            };
            return EventState::Resolved {
                end_text: end_text.clone(),
                prior,
            };
        }

        match (&self.start_text, &self.sent) {
            (Some(start_text), sent) => EventState::Active {
                start_text: start_text.clone(),
                recorded: sent.clone().unwrap_or_default(),
            },
            (None, Some(refs)) => EventState::NotifiedPending { refs: refs.clone() },
            (None, None) => EventState::Staging,
        }
    }
}

/// A single step the dispatcher must apply for one event
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Reply in the thread of every recorded start notification
    ReplyResolved {
        event: EventId,
        refs: SentRefs,
        end_text: String,
        lingering_start: bool,
    },
    /// The end arrived with no trace of a start
    BroadcastResolved { event: EventId, end_text: String },
    /// Start and end both arrived before the start was announced
    BroadcastMerged {
        event: EventId,
        start_text: String,
        end_text: String,
    },
    /// Announce a new anomaly to every destination not yet in `recorded`
    Announce {
        event: EventId,
        start_text: String,
        recorded: SentRefs,
    },
    /// Remove a staging file left behind by an interrupted write
    DiscardStaging { event: EventId },
}

impl Transition {
    pub fn event(&self) -> &EventId {
        match self {
            Transition::ReplyResolved { event, .. }
            | Transition::BroadcastResolved { event, .. }
            | Transition::BroadcastMerged { event, .. }
            | Transition::Announce { event, .. }
            | Transition::DiscardStaging { event } => event,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::ReplyResolved { .. } => "reply-resolved",
            Transition::BroadcastResolved { .. } => "broadcast-resolved",
            Transition::BroadcastMerged { .. } => "broadcast-merged",
            Transition::Announce { .. } => "announce",
            Transition::DiscardStaging { .. } => "discard-staging",
        }
    }
}

/// Transitions for one poll, in the order they must be applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Phase one: every event with an `Ended` marker
    pub resolutions: Vec<Transition>,
    /// Phase two: started-only events and housekeeping
    pub announcements: Vec<Transition>,
    /// Events notified and still waiting for their end
    pub pending: usize,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.resolutions.is_empty() && self.announcements.is_empty()
    }
}

pub fn classify(snapshot: &Snapshot) -> Plan {
    let mut plan = Plan::default();

    for (event, markers) in snapshot.iter() {
        match markers.state() {
            EventState::Resolved { end_text, prior } => {
                let transition = match prior {
                    Prior::Notified { refs, lingering_start } => Transition::ReplyResolved {
                        event: event.clone(),
                        refs,
                        end_text,
                        lingering_start,
                    },
                    Prior::Unknown => Transition::BroadcastResolved {
                        event: event.clone(),
                        end_text,
                    },
                    Prior::Unreported { start_text } => Transition::BroadcastMerged {
                        event: event.clone(),
                        start_text,
                        end_text,
                    },
                };
                plan.resolutions.push(transition);
            }
            EventState::Active { start_text, recorded } => {
                plan.announcements.push(Transition::Announce {
                    event: event.clone(),
                    start_text,
                    recorded,
                });
            }
            EventState::NotifiedPending { .. } => plan.pending += 1,
            EventState::Staging => {}
        }

        // a staging file next to a live start is overwritten by the next write
        if markers.staging && markers.start_text.is_none() {
            plan.announcements.push(Transition::DiscardStaging {
                event: event.clone(),
            });
        }
    }

    plan
}
