use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{DestinationId, EventId, Marker, MarkerKind, MessageId, SentRef, SentRefs};

/// Suffix appended to a marker's final name while it is being written
const STAGING_SUFFIX: &str = ".tmp";

/// Durable event log shared with the external detector.
///
/// Every operation is idempotent from the caller's point of view: deleting a
/// marker that is already gone succeeds, and an interrupted `write_atomic`
/// leaves either the previous content or the new one, never a partial file.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Snapshot of the markers currently present, in no particular order
    async fn list(&self) -> Result<Vec<Marker>, StoreError>;

    async fn read_payload(&self, marker: &Marker) -> Result<String, StoreError>;

    /// Stage `payload` under a temporary name, then rename it into place
    async fn write_atomic(
        &self,
        event: &EventId,
        kind: MarkerKind,
        payload: &str,
    ) -> Result<Marker, StoreError>;

    async fn delete(&self, marker: &Marker) -> Result<(), StoreError>;
}

impl MarkerKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            MarkerKind::Started => ".n",
            MarkerKind::Ended => ".s",
            MarkerKind::Sent => ".p",
            MarkerKind::SentTemp => ".p.tmp",
        }
    }
}

impl Marker {
    pub fn new(event: impl Into<EventId>, kind: MarkerKind) -> Self {
        Self { event: event.into(), kind }
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.event.0, self.kind.suffix())
    }

    /// Decode `<event-id>.<ext>`; returns `None` for names that are not markers
    pub fn parse_file_name(name: &str) -> Option<Marker> {
        // `.p.tmp` must be tried before `.p` would ever see it as an id ending in `.p`
        let kinds = [
            MarkerKind::SentTemp,
            MarkerKind::Started,
            MarkerKind::Ended,
            MarkerKind::Sent,
        ];
        kinds.iter().find_map(|kind| {
            let id = name.strip_suffix(kind.suffix())?;
            if id.is_empty() {
                return None;
            }
            Some(Marker::new(EventId(id.to_string()), *kind))
        })
    }
}

/// Decode the `destinationId:messageId` lines of a `Sent` marker
pub fn parse_sent(payload: &str) -> SentRefs {
    let mut refs = SentRefs::new();
    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // destination ids may contain ':', message ids never do
        match line.rsplit_once(':') {
            Some((dest, msg)) if !dest.is_empty() && !msg.trim().is_empty() => {
                refs.push(SentRef {
                    destination: DestinationId(dest.to_string()),
                    message_id: MessageId(msg.trim().to_string()),
                });
            }
            _ => warn!(line = line, "Skipping malformed sent-record line"),
        }
    }
    refs
}

pub fn format_sent(refs: &[SentRef]) -> String {
    refs.iter()
        .map(|r| format!("{}:{}\n", r.destination, r.message_id))
        .collect()
}

/// Marker store backed by a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    dir: PathBuf,
}

impl FsMarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, marker: &Marker) -> PathBuf {
        self.dir.join(marker.file_name())
    }

    /// Make the rename itself durable. Not every platform allows opening a
    /// directory, so failures are only logged.
    async fn sync_dir(&self) {
        match tokio::fs::File::open(&self.dir).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!(dir = %self.dir.display(), error = %e, "Directory fsync failed");
                }
            }
            Err(e) => debug!(dir = %self.dir.display(), error = %e, "Cannot open directory for fsync"),
        }
    }
}

#[async_trait]
impl MarkerStore for FsMarkerStore {
    async fn list(&self) -> Result<Vec<Marker>, StoreError> {
        let list_err = |source| StoreError::List {
            dir: self.dir.display().to_string(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(list_err)?;
        let mut markers = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let path = entry.path();
            // follows symlinks, like the detector's own checks do
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!(file = %path.display(), error = %e, "Entry vanished during listing");
                    continue;
                }
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(file = %path.display(), "Ignoring non UTF-8 file name");
                continue;
            };

            match Marker::parse_file_name(name) {
                Some(marker) => markers.push(marker),
                None => debug!(file = name, "Ignoring unrecognised file"),
            }
        }

        Ok(markers)
    }

    async fn read_payload(&self, marker: &Marker) -> Result<String, StoreError> {
        // detector text is not guaranteed UTF-8; a stray byte must not wedge the event
        tokio::fs::read(self.path_of(marker))
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => StoreError::Missing {
                    event: marker.event.clone(),
                    kind: marker.kind,
                },
                _ => StoreError::Read {
                    event: marker.event.clone(),
                    kind: marker.kind,
                    source,
                },
            })
    }

    async fn write_atomic(
        &self,
        event: &EventId,
        kind: MarkerKind,
        payload: &str,
    ) -> Result<Marker, StoreError> {
        if kind == MarkerKind::SentTemp {
            return Err(StoreError::NotWritable { kind });
        }

        let marker = Marker::new(event.clone(), kind);
        let final_path = self.path_of(&marker);
        let staging_path = self
            .dir
            .join(format!("{}{}", marker.file_name(), STAGING_SUFFIX));

        let write = async {
            let mut file = tokio::fs::File::create(&staging_path).await?;
            file.write_all(payload.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&staging_path, &final_path).await
        };

        write.await.map_err(|source| StoreError::Write {
            event: event.clone(),
            kind,
            source,
        })?;

        self.sync_dir().await;
        Ok(marker)
    }

    async fn delete(&self, marker: &Marker) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_of(marker)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Delete {
                event: marker.event.clone(),
                kind: marker.kind,
                source,
            }),
        }
    }
}

/// Thread-safe in-memory marker store
#[derive(Clone, Default)]
pub struct MemoryMarkerStore {
    inner: Arc<RwLock<HashMap<Marker, String>>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a marker directly, the way the detector would
    pub fn insert(&self, event: &str, kind: MarkerKind, payload: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(Marker::new(event, kind), payload.to_string());
    }

    pub fn get(&self, event: &str, kind: MarkerKind) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(&Marker::new(event, kind)).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn list(&self) -> Result<Vec<Marker>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.keys().cloned().collect())
    }

    async fn read_payload(&self, marker: &Marker) -> Result<String, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(marker).cloned().ok_or_else(|| StoreError::Missing {
            event: marker.event.clone(),
            kind: marker.kind,
        })
    }

    async fn write_atomic(
        &self,
        event: &EventId,
        kind: MarkerKind,
        payload: &str,
    ) -> Result<Marker, StoreError> {
        if kind == MarkerKind::SentTemp {
            return Err(StoreError::NotWritable { kind });
        }
        let marker = Marker::new(event.clone(), kind);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(marker.clone(), payload.to_string());
        Ok(marker)
    }

    async fn delete(&self, marker: &Marker) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(marker);
        Ok(())
    }
}
