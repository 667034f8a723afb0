pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod store;

/// Common types used across modules
pub mod types {
    use smallvec::SmallVec;

    /// Identifier shared by every marker of one anomaly occurrence
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EventId(pub String);

    /// A chat or channel that receives broadcasts
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct DestinationId(pub String);

    /// Transport-assigned id of a delivered message
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct MessageId(pub String);

    /// Lifecycle fact encoded by a marker's file extension
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MarkerKind {
        /// `.n`, written by the detector when an anomaly starts
        Started,
        /// `.s`, written by the detector when an anomaly ends
        Ended,
        /// `.p`, the record of start notifications already delivered
        Sent,
        /// `.p.tmp`, staging file for the atomic write of `Sent`
        SentTemp,
    }

    /// One file in the marker directory
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Marker {
        pub event: EventId,
        pub kind: MarkerKind,
    }

    /// A start notification delivered to one destination
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentRef {
        pub destination: DestinationId,
        pub message_id: MessageId,
    }

    /// Refs recorded in a `Sent` marker, one per notified destination
    pub type SentRefs = SmallVec<[SentRef; 4]>;

    /// Colour of a notification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Tone {
        /// New anomaly (red)
        Active,
        /// Ended before its start was ever reported (yellow)
        Merged,
        /// Anomaly is gone (green)
        Resolved,
    }

    /// A notification body, independent of transport formatting
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Message {
        pub tone: Tone,
        pub text: String,
    }

    impl Tone {
        pub fn indicator(&self) -> &'static str {
            match self {
                Tone::Active => "🔴",
                Tone::Merged => "🟡",
                Tone::Resolved => "🟢",
            }
        }
    }

    impl Message {
        pub fn active(text: impl Into<String>) -> Self {
            Self { tone: Tone::Active, text: text.into() }
        }

        pub fn resolved(text: impl Into<String>) -> Self {
            Self { tone: Tone::Resolved, text: text.into() }
        }

        /// Start and end descriptions folded into one notification
        pub fn merged(start: &str, end: &str) -> Self {
            Self { tone: Tone::Merged, text: format!("{}\n{}", start, end) }
        }

        /// Text with the tone indicator in front, as chat users see it
        pub fn render(&self) -> String {
            format!("{} {}", self.tone.indicator(), self.text)
        }
    }

    impl From<&str> for EventId {
        fn from(s: &str) -> Self {
            EventId(s.to_string())
        }
    }

    impl From<String> for EventId {
        fn from(s: String) -> Self {
            EventId(s)
        }
    }

    impl From<&str> for DestinationId {
        fn from(s: &str) -> Self {
            DestinationId(s.to_string())
        }
    }

    impl From<&str> for MessageId {
        fn from(s: &str) -> Self {
            MessageId(s.to_string())
        }
    }

    impl std::fmt::Display for EventId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::fmt::Display for DestinationId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::fmt::Display for MessageId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::fmt::Display for MarkerKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                MarkerKind::Started => write!(f, "started"),
                MarkerKind::Ended => write!(f, "ended"),
                MarkerKind::Sent => write!(f, "sent"),
                MarkerKind::SentTemp => write!(f, "sent-tmp"),
            }
        }
    }
}
