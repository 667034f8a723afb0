use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, Snapshot, Transition};
use crate::error::{DeliveryError, DispatchError, StoreError};
use crate::notifier::NotificationSender;
use crate::store::{format_sent, MarkerStore};
use crate::types::{DestinationId, EventId, Marker, MarkerKind, Message, SentRef, SentRefs};

/// Polls the marker store and turns lifecycle changes into notifications
pub struct Dispatcher {
    store: Arc<dyn MarkerStore>,
    sender: Arc<dyn NotificationSender>,
    destinations: Vec<DestinationId>,
    max_concurrent: usize,
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Distinct event ids in the snapshot
    pub events: usize,
    /// Events notified and waiting for their end marker
    pub pending: usize,
    /// Events left out because a marker could not be read
    pub unreadable: usize,
    pub applied: usize,
    pub failed: usize,
    /// Notifications delivered during the cycle
    pub messages: usize,
}

impl PollReport {
    pub fn is_quiet(&self) -> bool {
        self.applied == 0 && self.failed == 0 && self.unreadable == 0
    }
}

#[derive(Default)]
struct Tally {
    applied: AtomicUsize,
    failed: AtomicUsize,
    messages: AtomicUsize,
}

impl Tally {
    fn delivered(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }
}

/// First failure of a multi-destination send, plus how many failed
#[derive(Default)]
struct Failures {
    first: Option<(DestinationId, DeliveryError)>,
    count: usize,
}

impl Failures {
    fn record(&mut self, destination: &DestinationId, err: DeliveryError) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some((destination.clone(), err));
        }
    }

    fn into_result(self, attempted: usize) -> Result<(), DispatchError> {
        match self.first {
            Some((destination, source)) => Err(DispatchError::Delivery {
                destination,
                attempted,
                failed: self.count,
                source,
            }),
            None => Ok(()),
        }
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MarkerStore>,
        sender: Arc<dyn NotificationSender>,
        destinations: Vec<DestinationId>,
    ) -> Self {
        Self {
            store,
            sender,
            destinations,
            max_concurrent: 4,
        }
    }

    /// Bound on transitions in flight within one phase
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn destinations(&self) -> &[DestinationId] {
        &self.destinations
    }

    /// Poll, then sleep `interval`, until `shutdown` resolves.
    ///
    /// A cycle always runs to completion; shutdown is only observed between
    /// cycles, so two cycles never overlap.
    pub async fn run<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            interval_secs = interval.as_secs(),
            destinations = self.destinations.len(),
            transport = self.sender.name(),
            "Dispatcher started"
        );

        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Poll failed, retrying next cycle");
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Dispatcher stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Run one cycle: snapshot, classify, apply both phases
    pub async fn poll_once(&self) -> Result<PollReport, StoreError> {
        let (snapshot, unreadable) = self.load_snapshot().await?;
        let plan = classify(&snapshot);
        let tally = Tally::default();

        // every end marker is settled before any start is announced
        self.apply_phase(&plan.resolutions, &tally).await;
        self.apply_phase(&plan.announcements, &tally).await;

        let report = PollReport {
            events: snapshot.len(),
            pending: plan.pending,
            unreadable,
            applied: tally.applied.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            messages: tally.messages.load(Ordering::Relaxed),
        };

        if report.is_quiet() {
            debug!(events = report.events, pending = report.pending, "Poll complete");
        } else {
            info!(
                events = report.events,
                applied = report.applied,
                failed = report.failed,
                unreadable = report.unreadable,
                messages = report.messages,
                "Poll complete"
            );
        }

        Ok(report)
    }

    /// Read every marker. Events with an unreadable marker are dropped
    /// from the snapshot so they cannot be misclassified.
    async fn load_snapshot(&self) -> Result<(Snapshot, usize), StoreError> {
        let markers = self.store.list().await?;
        let mut snapshot = Snapshot::new();
        let mut unreadable = BTreeSet::new();

        for marker in &markers {
            if marker.kind == MarkerKind::SentTemp {
                snapshot.insert(marker, "");
                continue;
            }

            match self.store.read_payload(marker).await {
                Ok(payload) => snapshot.insert(marker, &payload),
                Err(StoreError::Missing { .. }) => {
                    debug!(event = %marker.event, kind = %marker.kind, "Marker vanished before it was read");
                }
                Err(e) => {
                    warn!(event = %marker.event, error = %e, "Skipping event this cycle");
                    unreadable.insert(marker.event.clone());
                }
            }
        }

        for event in &unreadable {
            snapshot.remove(event);
        }

        Ok((snapshot, unreadable.len()))
    }

    async fn apply_phase(&self, transitions: &[Transition], tally: &Tally) {
        futures_util::stream::iter(transitions)
            .for_each_concurrent(self.max_concurrent, |transition| async move {
                match self.apply(transition, tally).await {
                    Ok(()) => {
                        tally.applied.fetch_add(1, Ordering::Relaxed);
                        debug!(event = %transition.event(), transition = transition.name(), "Transition applied");
                    }
                    Err(e) => {
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            event = %transition.event(),
                            transition = transition.name(),
                            error = %e,
                            "Transition failed, will retry next poll"
                        );
                    }
                }
            })
            .await;
    }

    async fn apply(&self, transition: &Transition, tally: &Tally) -> Result<(), DispatchError> {
        match transition {
            Transition::ReplyResolved { event, refs, end_text, lingering_start } => {
                self.reply_resolved(event, refs, end_text, *lingering_start, tally).await
            }
            Transition::BroadcastResolved { event, end_text } => {
                self.broadcast(&Message::resolved(end_text.as_str()), tally).await?;
                self.store.delete(&Marker::new(event.clone(), MarkerKind::Ended)).await?;
                Ok(())
            }
            Transition::BroadcastMerged { event, start_text, end_text } => {
                self.broadcast(&Message::merged(start_text, end_text), tally).await?;
                // start first: a lone end marker resolves harmlessly on retry
                self.store.delete(&Marker::new(event.clone(), MarkerKind::Started)).await?;
                self.store.delete(&Marker::new(event.clone(), MarkerKind::Ended)).await?;
                Ok(())
            }
            Transition::Announce { event, start_text, recorded } => {
                self.announce(event, start_text, recorded, tally).await
            }
            Transition::DiscardStaging { event } => {
                self.store.delete(&Marker::new(event.clone(), MarkerKind::SentTemp)).await?;
                debug!(event = %event, "Removed abandoned staging file");
                Ok(())
            }
        }
    }

    async fn broadcast(&self, message: &Message, tally: &Tally) -> Result<(), DispatchError> {
        let mut failures = Failures::default();

        for destination in &self.destinations {
            match self.sender.send_new(destination, message).await {
                Ok(id) => {
                    tally.delivered();
                    debug!(destination = %destination, message_id = %id, "Broadcast delivered");
                }
                Err(e) => {
                    warn!(destination = %destination, error = %e, "Broadcast delivery failed");
                    failures.record(destination, e);
                }
            }
        }

        failures.into_result(self.destinations.len())
    }

    async fn reply_resolved(
        &self,
        event: &EventId,
        refs: &SentRefs,
        end_text: &str,
        lingering_start: bool,
        tally: &Tally,
    ) -> Result<(), DispatchError> {
        if lingering_start {
            // the sent record is authoritative; the start was already announced
            info!(event = %event, "Dropping start marker already recorded as sent");
            self.store.delete(&Marker::new(event.clone(), MarkerKind::Started)).await?;
        }

        let message = Message::resolved(end_text);
        let mut unanswered = SentRefs::new();
        let mut failures = Failures::default();

        for sent in refs {
            match self.sender.send_reply(&sent.destination, &message, &sent.message_id).await {
                Ok(id) => {
                    tally.delivered();
                    debug!(event = %event, destination = %sent.destination, message_id = %id, "Resolution threaded");
                }
                Err(e) => {
                    warn!(event = %event, destination = %sent.destination, error = %e, "Threaded reply failed");
                    unanswered.push(sent.clone());
                    failures.record(&sent.destination, e);
                }
            }
        }

        if failures.count > 0 {
            // keep only the threads still owed a reply
            self.store
                .write_atomic(event, MarkerKind::Sent, &format_sent(&unanswered))
                .await?;
            return failures.into_result(refs.len());
        }

        self.store.delete(&Marker::new(event.clone(), MarkerKind::Ended)).await?;
        self.store.delete(&Marker::new(event.clone(), MarkerKind::Sent)).await?;
        Ok(())
    }

    async fn announce(
        &self,
        event: &EventId,
        start_text: &str,
        recorded: &SentRefs,
        tally: &Tally,
    ) -> Result<(), DispatchError> {
        let message = Message::active(start_text);
        let missing: Vec<&DestinationId> = self
            .destinations
            .iter()
            .filter(|d| !recorded.iter().any(|r| &r.destination == *d))
            .collect();

        let mut refs = recorded.clone();
        let mut failures = Failures::default();

        for destination in &missing {
            match self.sender.send_new(destination, &message).await {
                Ok(message_id) => {
                    tally.delivered();
                    debug!(event = %event, destination = %destination, message_id = %message_id, "Anomaly announced");
                    refs.push(SentRef {
                        destination: (*destination).clone(),
                        message_id,
                    });
                }
                Err(e) => {
                    warn!(event = %event, destination = %destination, error = %e, "Announcement failed");
                    failures.record(destination, e);
                }
            }
        }

        if refs.len() > recorded.len() {
            if let Err(e) = self
                .store
                .write_atomic(event, MarkerKind::Sent, &format_sent(&refs))
                .await
            {
                error!(event = %event, error = %e, "Announced but could not record it; next poll will repeat the announcement");
                return Err(e.into());
            }
        } else if missing.is_empty() && !recorded.is_empty() {
            info!(event = %event, "Start already recorded as sent, dropping redundant start marker");
        }

        // the start marker stays until every destination is reached
        failures.into_result(missing.len())?;

        self.store.delete(&Marker::new(event.clone(), MarkerKind::Started)).await?;
        Ok(())
    }
}
