// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Abandoned-message sink: a local JSON-lines file.
//!
//! The last stop for payloads nothing else could route or process. One
//! writer task owns the file; everything else sends it records over a
//! bounded channel, so appends never interleave. Each record is acknowledged
//! once its line is written, so a caller learns when the file is unusable.
//!
//! Each line is an [`AbandonedRecord`]:
//!
//! ```text
//! {"timestamp":"2026-01-04T10:00:00Z","reason":"channel_decode","topic":"prices",...,"payload":"eyJ4Ijo..."}
//! ```

use crate::config::AbandonedConfig;
use crate::deadletter::{DeadLetter, DeadLetterSink};
use crate::error::{RelayError, Result};
use crate::messaging::BoxFuture;
use crate::metrics;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One line of the abandoned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedRecord {
    /// RFC 3339 time the record was written.
    pub timestamp: String,
    pub reason: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub consumer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Base64 of the raw payload.
    pub payload: String,
}

impl AbandonedRecord {
    pub fn from_dead_letter(letter: &DeadLetter) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            reason: letter.reason.as_str().to_string(),
            topic: letter.topic.clone(),
            group: letter.group.clone(),
            consumer: letter.consumer.clone(),
            origin_id: letter.origin_id.clone(),
            key: letter.key.clone(),
            action: letter.action.map(|a| a.as_str().to_string()),
            error: letter.error.clone(),
            payload: STANDARD.encode(&letter.payload),
        }
    }

    /// Decoded payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.payload)
            .map_err(|e| RelayError::Serialization(format!("abandoned payload: {}", e)))
    }
}

enum Command {
    Record(Box<AbandonedRecord>, oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the abandoned-file writer.
pub struct AbandonedSink {
    tx: mpsc::Sender<Command>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl AbandonedSink {
    /// Start the writer task for `config.path`.
    ///
    /// The file is created on first write and only ever appended to.
    pub fn spawn(config: &AbandonedConfig) -> Self {
        let path = PathBuf::from(&config.path);
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let writer = tokio::spawn(run_writer(path.clone(), rx));
        info!(path = %path.display(), "Abandoned sink started");

        Self {
            tx,
            writer: Mutex::new(Some(writer)),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a dead letter to the file.
    ///
    /// Waits if the queue is full, then until the writer has appended the
    /// line. Fails if the file cannot be opened or written.
    pub async fn record(&self, letter: &DeadLetter) -> Result<()> {
        let record = AbandonedRecord::from_dead_letter(letter);
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Record(Box::new(record), done_tx))
            .await
            .map_err(|_| RelayError::Shutdown)?;
        done_rx.await.map_err(|_| RelayError::Shutdown)??;
        metrics::record_abandoned(letter.reason.as_str());
        Ok(())
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| RelayError::Shutdown)?;
        done_rx.await.map_err(|_| RelayError::Shutdown)
    }

    /// Flush and stop the writer. Later records fail with `Shutdown`.
    pub async fn close(&self) {
        if let Err(e) = self.flush().await {
            debug!(error = %e, "Abandoned sink already closed");
        }
        if let Some(handle) = self.writer.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!(path = %self.path.display(), "Abandoned sink closed");
    }
}

impl DeadLetterSink for AbandonedSink {
    fn name(&self) -> &'static str {
        "abandoned_file"
    }

    fn write<'a>(&'a self, letter: DeadLetter) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.record(&letter).await })
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::Receiver<Command>) {
    let mut file = None;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record, done) => {
                let result = append_record(&path, &mut file, &record).await;
                if let Err(e) = &result {
                    error!(path = %path.display(), error = %e, "Failed to append abandoned record");
                    metrics::record_dead_letter_write_failure("abandoned_file");
                }
                // The caller may have given up waiting.
                let _ = done.send(result);
            }
            Command::Flush(done) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.flush().await {
                        warn!(error = %e, "Failed to flush abandoned file");
                    }
                    if let Err(e) = f.sync_data().await {
                        warn!(error = %e, "Failed to sync abandoned file");
                    }
                }
                let _ = done.send(());
            }
        }
    }
    debug!("Abandoned writer stopped");
}

async fn append_record(path: &Path, file: &mut Option<File>, record: &AbandonedRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut f = match file.take() {
        Some(f) => f,
        None => OpenOptions::new().create(true).append(true).open(path).await?,
    };
    // On a failed write the handle is dropped and the next record reopens.
    f.write_all(&line).await?;
    *file = Some(f);
    Ok(())
}

/// Read every record in an abandoned file.
pub async fn read_abandoned(path: impl AsRef<Path>) -> Result<Vec<AbandonedRecord>> {
    let content = match tokio::fs::read_to_string(path.as_ref()).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(RelayError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::DeadLetterReason;
    use crate::envelope::Action;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(path: &Path) -> AbandonedConfig {
        AbandonedConfig {
            path: path.to_string_lossy().to_string(),
            buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_records_are_appended_as_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abandoned.jsonl");
        let sink = AbandonedSink::spawn(&config(&path));

        let letter = DeadLetter::new(DeadLetterReason::ZeroIdentity, "entity.sync", "", "", b"{\"ID\":0}".to_vec())
            .with_key("model.User")
            .with_action(Action::Save)
            .with_error("identity is zero");
        sink.record(&letter).await.unwrap();
        sink.record(&letter).await.unwrap();
        sink.flush().await.unwrap();

        let records = read_abandoned(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reason, "zero_identity");
        assert_eq!(records[0].key.as_deref(), Some("model.User"));
        assert_eq!(records[0].action.as_deref(), Some("save"));
        assert_eq!(records[0].payload_bytes().unwrap(), b"{\"ID\":0}");
        sink.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abandoned.jsonl");
        let sink = Arc::new(AbandonedSink::spawn(&config(&path)));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let sink = Arc::clone(&sink);
            tasks.push(tokio::spawn(async move {
                let payload = vec![b'x'; 4096 + i];
                let letter = DeadLetter::new(DeadLetterReason::ChannelDecode, "t", "g", format!("{}-0", i), payload);
                sink.write(letter).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        sink.flush().await.unwrap();

        let records = read_abandoned(&path).await.unwrap();
        assert_eq!(records.len(), 20);
        for record in &records {
            let len = record.payload_bytes().unwrap().len();
            assert!((4096..4116).contains(&len));
        }
    }

    #[tokio::test]
    async fn test_record_after_close_fails() {
        let dir = tempdir().unwrap();
        let sink = AbandonedSink::spawn(&config(&dir.path().join("a.jsonl")));
        sink.close().await;

        let letter = DeadLetter::new(DeadLetterReason::Apply, "t", "g", "1-0", vec![]);
        assert!(matches!(sink.record(&letter).await, Err(RelayError::Shutdown)));
    }

    #[tokio::test]
    async fn test_unwritable_file_fails_record() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for appending.
        let sink = AbandonedSink::spawn(&config(dir.path()));

        let letter = DeadLetter::new(DeadLetterReason::Expired, "t", "g", "1-0", b"lost?".to_vec());
        assert!(matches!(sink.record(&letter).await, Err(RelayError::Io(_))));
        sink.close().await;
    }

    #[tokio::test]
    async fn test_fallback_sees_file_failure() {
        use crate::deadletter::{FallbackDeadLetter, MemoryDeadLetter};

        let dir = tempdir().unwrap();
        let memory = MemoryDeadLetter::new();
        let sink = FallbackDeadLetter::new(Arc::new(AbandonedSink::spawn(&config(dir.path()))), memory.clone());

        let letter = DeadLetter::new(DeadLetterReason::Apply, "t", "g", "2-0", vec![1, 2, 3]);
        sink.write(letter.clone()).await.unwrap();
        assert_eq!(memory.letters(), vec![letter]);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(read_abandoned(dir.path().join("none.jsonl")).await.unwrap().is_empty());
    }
}
