use crate::error::SourceError;
use crate::model::{Play, Snapshot, SourceIdentity};
use crate::polling::SnapshotSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

pub const REPLAY_KIND: &str = "replay";

/// On-disk layout. A bare array of batches, or an object that also carries a backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplayFile {
    Batches(Vec<Vec<Snapshot>>),
    Full {
        batches: Vec<Vec<Snapshot>>,
        #[serde(default)]
        backlog: Vec<Play>,
    },
}

impl ReplayFile {
    fn into_parts(self) -> (Vec<Vec<Snapshot>>, Vec<Play>) {
        match self {
            ReplayFile::Batches(batches) => (batches, Vec::new()),
            ReplayFile::Full { batches, backlog } => (batches, backlog),
        }
    }
}

/// Plays back recorded snapshot batches, one per fetch. Past the end every fetch is empty.
pub struct ReplaySource {
    name: String,
    batches: Vec<Vec<Snapshot>>,
    backlog: Vec<Play>,
    cursor: AtomicUsize,
}

impl ReplaySource {
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file: ReplayFile = serde_json::from_str(&content)?;
        let (batches, backlog) = file.into_parts();

        let name = name.into();
        debug!("{}: loaded {} batches from {}", name, batches.len(), path.display());
        Ok(Self {
            name,
            batches,
            backlog,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn remaining(&self) -> usize {
        self.batches.len().saturating_sub(self.cursor.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl SnapshotSource for ReplaySource {
    fn identity(&self) -> SourceIdentity {
        SourceIdentity::new(self.name.clone(), REPLAY_KIND)
    }

    async fn fetch(&self) -> Result<Vec<Snapshot>, SourceError> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self.batches.get(index).cloned().unwrap_or_default())
    }

    async fn fetch_backlog(&self) -> Result<Vec<Play>, SourceError> {
        Ok(self.backlog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_json(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_batches_served_in_order_then_empty() {
        let file = write_json(
            r#"[
                [{"platform": {"device_id": "desk", "user_id": "alice"}, "status": "playing",
                  "play": {"data": {"track": "Voyager", "artists": ["Daft Punk"]}}}],
                []
            ]"#,
        );
        let source = ReplaySource::open("recorded", file.path()).unwrap();
        assert_eq!(source.identity(), SourceIdentity::new("recorded", "replay"));
        assert_eq!(source.remaining(), 2);

        let first = source.fetch().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].platform.key(), "desk-alice");
        assert_eq!(first[0].play.as_ref().unwrap().data.track, "Voyager");

        assert!(source.fetch().await.unwrap().is_empty());
        assert!(source.fetch().await.unwrap().is_empty());
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn test_object_form_carries_backlog() {
        let file = write_json(
            r#"{"batches": [[{"status": "paused"}]],
                "backlog": [{"data": {"track": "Digital Love", "play_date": "2024-03-01T11:00:00Z"}}]}"#,
        );
        let source = ReplaySource::open("recorded", file.path()).unwrap();
        let backlog = source.fetch_backlog().await.unwrap();
        assert_eq!(backlog.len(), 1);

        let batch = source.fetch().await.unwrap();
        // no platform means the generic single-user platform
        assert!(batch[0].platform.is_generic());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReplaySource::open("gone", dir.path().join("nope.json"));
        assert!(matches!(result, Err(SourceError::Io(_))));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let file = write_json("{not json");
        assert!(matches!(ReplaySource::open("bad", file.path()), Err(SourceError::Parse(_))));
    }
}
