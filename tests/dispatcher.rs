use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use telemsg_dispatcher::dispatcher::Dispatcher;
use telemsg_dispatcher::error::{DeliveryError, StoreError};
use telemsg_dispatcher::notifier::NotificationSender;
use telemsg_dispatcher::store::{FsMarkerStore, MarkerStore, MemoryMarkerStore};
use telemsg_dispatcher::types::{
    DestinationId, EventId, Marker, MarkerKind, Message, MessageId, Tone,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    New { dest: String, tone: Tone, text: String },
    Reply { dest: String, tone: Tone, text: String, parent: String },
}

/// Records every call and hands out `m1`, `m2`, ... as message ids
#[derive(Default)]
struct RecordingSender {
    calls: Mutex<Vec<Call>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingSender {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn set_unreachable(&self, dest: &str, down: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if down {
            set.insert(dest.to_string());
        } else {
            set.remove(dest);
        }
    }

    fn record(&self, dest: &DestinationId, call: Call) -> Result<MessageId, DeliveryError> {
        if self.unreachable.lock().unwrap().contains(&dest.0) {
            return Err(DeliveryError::Transport(format!("{} unreachable", dest)));
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        Ok(MessageId(format!("m{}", calls.len())))
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    fn name(&self) -> &str { "recording" }

    async fn send_new(
        &self,
        destination: &DestinationId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError> {
        self.record(
            destination,
            Call::New {
                dest: destination.0.clone(),
                tone: message.tone,
                text: message.text.clone(),
            },
        )
    }

    async fn send_reply(
        &self,
        destination: &DestinationId,
        message: &Message,
        in_reply_to: &MessageId,
    ) -> Result<MessageId, DeliveryError> {
        self.record(
            destination,
            Call::Reply {
                dest: destination.0.clone(),
                tone: message.tone,
                text: message.text.clone(),
                parent: in_reply_to.0.clone(),
            },
        )
    }
}

fn new_call(dest: &str, tone: Tone, text: &str) -> Call {
    Call::New { dest: dest.into(), tone, text: text.into() }
}

fn reply_call(dest: &str, text: &str, parent: &str) -> Call {
    Call::Reply {
        dest: dest.into(),
        tone: Tone::Resolved,
        text: text.into(),
        parent: parent.into(),
    }
}

struct Harness {
    dir: tempfile::TempDir,
    sender: Arc<RecordingSender>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(destinations: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = Dispatcher::new(
            Arc::new(FsMarkerStore::new(dir.path())),
            sender.clone(),
            destinations.iter().map(|d| DestinationId::from(*d)).collect(),
        );
        Self { dir, sender, dispatcher }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.path().join(name), content).unwrap();
    }

    fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.path().join(name)).ok()
    }

    fn exists(&self, name: &str) -> bool {
        self.path().join(name).exists()
    }

    fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

#[tokio::test]
async fn new_anomaly_is_announced_and_recorded() {
    let h = Harness::new(&["d1", "d2"]);
    h.write("evt1.n", "spike");

    let report = h.dispatcher.poll_once().await.unwrap();

    assert_eq!(
        h.sender.calls(),
        vec![
            new_call("d1", Tone::Active, "spike"),
            new_call("d2", Tone::Active, "spike"),
        ]
    );
    assert_eq!(h.read("evt1.p").as_deref(), Some("d1:m1\nd2:m2\n"));
    assert!(!h.exists("evt1.n"));
    assert_eq!(h.files(), vec!["evt1.p"]);
    assert_eq!(report.applied, 1);
    assert_eq!(report.messages, 2);
}

#[tokio::test]
async fn latin1_start_text_is_still_announced() {
    let h = Harness::new(&["d1"]);
    std::fs::write(h.path().join("evt1.n"), b"spike on caf\xe9 link").unwrap();

    let report = h.dispatcher.poll_once().await.unwrap();

    assert_eq!(report.unreadable, 0);
    assert_eq!(report.applied, 1);
    assert_eq!(
        h.sender.calls(),
        vec![new_call("d1", Tone::Active, "spike on caf\u{FFFD} link")]
    );
    assert_eq!(h.files(), vec!["evt1.p"]);

    h.dispatcher.poll_once().await.unwrap();
    assert_eq!(h.sender.calls().len(), 1);
}

#[tokio::test]
async fn resolution_replies_in_each_thread() {
    let h = Harness::new(&["d1", "d2"]);
    h.write("evt1.n", "spike");
    h.dispatcher.poll_once().await.unwrap();
    h.sender.clear();

    h.write("evt1.s", "cleared");
    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(
        h.sender.calls(),
        vec![reply_call("d1", "cleared", "m1"), reply_call("d2", "cleared", "m2")]
    );
    assert!(h.files().is_empty());
}

#[tokio::test]
async fn start_and_end_in_one_poll_merge() {
    let h = Harness::new(&["d1", "d2"]);
    h.write("evt2.n", "flood");
    h.write("evt2.s", "resolved");

    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(
        h.sender.calls(),
        vec![
            new_call("d1", Tone::Merged, "flood\nresolved"),
            new_call("d2", Tone::Merged, "flood\nresolved"),
        ]
    );
    assert!(h.files().is_empty());

    // nothing left to become a threaded reply later
    h.dispatcher.poll_once().await.unwrap();
    assert_eq!(h.sender.calls().len(), 2);
}

#[tokio::test]
async fn end_without_start_broadcasts_green() {
    let h = Harness::new(&["d1", "d2"]);
    h.write("evt3.s", "gone\n");

    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(
        h.sender.calls(),
        vec![
            new_call("d1", Tone::Resolved, "gone"),
            new_call("d2", Tone::Resolved, "gone"),
        ]
    );
    assert!(h.files().is_empty());
}

#[tokio::test]
async fn repeated_poll_is_idempotent() {
    let h = Harness::new(&["d1"]);
    h.write("evt1.n", "spike");

    h.dispatcher.poll_once().await.unwrap();
    let after_first = h.sender.calls();
    let report = h.dispatcher.poll_once().await.unwrap();

    assert_eq!(h.sender.calls(), after_first);
    assert_eq!(report.messages, 0);
    assert_eq!(report.pending, 1);
    assert!(report.is_quiet());
}

#[tokio::test]
async fn crash_after_sent_record_does_not_resend() {
    let h = Harness::new(&["d1", "d2"]);
    // process died between writing the record and deleting the start marker
    h.write("evt1.n", "spike");
    h.write("evt1.p", "d1:m1\nd2:m2\n");

    h.dispatcher.poll_once().await.unwrap();

    assert!(h.sender.calls().is_empty());
    assert_eq!(h.files(), vec!["evt1.p"]);
    assert_eq!(h.read("evt1.p").as_deref(), Some("d1:m1\nd2:m2\n"));
}

#[tokio::test]
async fn crash_window_then_end_replies_without_reannouncing() {
    let h = Harness::new(&["d1"]);
    h.write("evt1.n", "spike");
    h.write("evt1.p", "d1:m7\n");
    h.write("evt1.s", "cleared");

    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(h.sender.calls(), vec![reply_call("d1", "cleared", "m7")]);
    assert!(h.files().is_empty());
}

#[tokio::test]
async fn abandoned_staging_file_is_rewritten() {
    let h = Harness::new(&["d1"]);
    h.write("evt1.n", "spike");
    h.write("evt1.p.tmp", "d1:");

    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(h.sender.calls(), vec![new_call("d1", Tone::Active, "spike")]);
    assert_eq!(h.files(), vec!["evt1.p"]);
    assert_eq!(h.read("evt1.p").as_deref(), Some("d1:m1\n"));
}

#[tokio::test]
async fn orphan_staging_file_is_removed() {
    let h = Harness::new(&["d1"]);
    h.write("evt9.p.tmp", "d1:m1\n");

    let report = h.dispatcher.poll_once().await.unwrap();

    assert!(h.sender.calls().is_empty());
    assert!(h.files().is_empty());
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn partial_announcement_resumes_with_missing_destinations() {
    let h = Harness::new(&["d1", "d2"]);
    h.write("evt1.n", "spike");
    h.sender.set_unreachable("d2", true);

    let report = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.sender.calls(), vec![new_call("d1", Tone::Active, "spike")]);
    assert!(h.exists("evt1.n"));
    assert_eq!(h.read("evt1.p").as_deref(), Some("d1:m1\n"));

    h.sender.set_unreachable("d2", false);
    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(
        h.sender.calls(),
        vec![
            new_call("d1", Tone::Active, "spike"),
            new_call("d2", Tone::Active, "spike"),
        ]
    );
    assert!(!h.exists("evt1.n"));
    assert_eq!(h.read("evt1.p").as_deref(), Some("d1:m1\nd2:m2\n"));
}

#[tokio::test]
async fn failed_replies_are_retried_only_where_missing() {
    let h = Harness::new(&["d1", "d2"]);
    h.write("evt1.p", "d1:m1\nd2:m2\n");
    h.write("evt1.s", "cleared");
    h.sender.set_unreachable("d1", true);

    let report = h.dispatcher.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.sender.calls(), vec![reply_call("d2", "cleared", "m2")]);
    assert_eq!(h.read("evt1.p").as_deref(), Some("d1:m1\n"));
    assert!(h.exists("evt1.s"));

    h.sender.set_unreachable("d1", false);
    h.dispatcher.poll_once().await.unwrap();

    assert_eq!(
        h.sender.calls(),
        vec![reply_call("d2", "cleared", "m2"), reply_call("d1", "cleared", "m1")]
    );
    assert!(h.files().is_empty());
}

#[tokio::test]
async fn failed_broadcast_keeps_markers() {
    let h = Harness::new(&["d1"]);
    h.write("evt2.n", "flood");
    h.write("evt2.s", "resolved");
    h.sender.set_unreachable("d1", true);

    let report = h.dispatcher.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(h.exists("evt2.n"));
    assert!(h.exists("evt2.s"));
    assert!(!h.exists("evt2.p"));
}

#[tokio::test]
async fn no_destinations_consumes_start_without_record() {
    let h = Harness::new(&[]);
    h.write("evt1.n", "spike");

    h.dispatcher.poll_once().await.unwrap();

    assert!(h.sender.calls().is_empty());
    assert!(h.files().is_empty());
}

#[tokio::test]
async fn unrelated_files_are_left_alone() {
    let h = Harness::new(&["d1"]);
    h.write("README", "not a marker");
    h.write("evt1.json", "{}");

    let report = h.dispatcher.poll_once().await.unwrap();

    assert_eq!(report.events, 0);
    assert_eq!(h.files(), vec!["README", "evt1.json"]);
}

#[tokio::test]
async fn many_events_in_one_poll() {
    let h = Harness::new(&["d1"]);
    for i in 0..10 {
        h.write(&format!("evt{}.n", i), &format!("spike {}", i));
    }

    let report = h.dispatcher.poll_once().await.unwrap();

    assert_eq!(report.applied, 10);
    assert_eq!(h.sender.calls().len(), 10);
    let files = h.files();
    assert_eq!(files.len(), 10);
    assert!(files.iter().all(|f| f.ends_with(".p")));
}

/// Store whose reads of one event always fail
struct FlakyStore {
    inner: MemoryMarkerStore,
    broken: EventId,
}

#[async_trait]
impl MarkerStore for FlakyStore {
    async fn list(&self) -> Result<Vec<Marker>, StoreError> {
        self.inner.list().await
    }

    async fn read_payload(&self, marker: &Marker) -> Result<String, StoreError> {
        if marker.event == self.broken {
            return Err(StoreError::Read {
                event: marker.event.clone(),
                kind: marker.kind,
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            });
        }
        self.inner.read_payload(marker).await
    }

    async fn write_atomic(
        &self,
        event: &EventId,
        kind: MarkerKind,
        payload: &str,
    ) -> Result<Marker, StoreError> {
        self.inner.write_atomic(event, kind, payload).await
    }

    async fn delete(&self, marker: &Marker) -> Result<(), StoreError> {
        self.inner.delete(marker).await
    }
}

#[tokio::test]
async fn unreadable_event_is_skipped_not_misclassified() {
    let memory = MemoryMarkerStore::new();
    // with the sent record unreadable, the end must not look like rule two
    memory.insert("bad", MarkerKind::Sent, "d1:m1\n");
    memory.insert("bad", MarkerKind::Ended, "cleared");
    memory.insert("good", MarkerKind::Started, "spike");

    let sender = Arc::new(RecordingSender::default());
    let dispatcher = Dispatcher::new(
        Arc::new(FlakyStore { inner: memory.clone(), broken: EventId::from("bad") }),
        sender.clone(),
        vec![DestinationId::from("d1")],
    );

    let report = dispatcher.poll_once().await.unwrap();

    assert_eq!(report.unreadable, 1);
    assert_eq!(sender.calls(), vec![new_call("d1", Tone::Active, "spike")]);
    assert!(memory.get("bad", MarkerKind::Ended).is_some());
    assert!(memory.get("bad", MarkerKind::Sent).is_some());
    assert_eq!(memory.get("good", MarkerKind::Sent).as_deref(), Some("d1:m1\n"));
    assert!(memory.get("good", MarkerKind::Started).is_none());
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = Harness::new(&["d1"]);
    h.write("evt1.n", "spike");

    // first cycle runs immediately, then shutdown is observed
    h.dispatcher
        .run(std::time::Duration::from_secs(3600), async {})
        .await;

    assert_eq!(h.sender.calls(), vec![new_call("d1", Tone::Active, "spike")]);
    assert_eq!(h.files(), vec!["evt1.p"]);
}
