//! FsEventLog - `events.jsonl`, one JSON record per line.
//!
//! Appends are serialized by a mutex that also owns the seq counter. The
//! counter only advances after the line is written and synced, and a failed
//! write is truncated away, so seq stays gap-free.
//!
//! On open the file is scanned: an unterminated trailing line (a crash during
//! append) is cut off, and seq must run 1, 2, 3, ... without holes.
//!
//! The counter lives in this process only, so `open` takes `events.lock` and
//! refuses a second process appending to the same file. If a failed write
//! cannot be truncated away either, the log is poisoned and refuses appends
//! until it is reopened.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::dir_lock::DirLock;
use crate::domain::{CollabError, Event, NewEvent};
use crate::ports::{Clock, EventLog};

pub const EVENT_LOG_FILE: &str = "events.jsonl";
pub const EVENT_LOCK_FILE: &str = "events.lock";

struct LogState {
    file: File,
    /// Bytes of complete, synced records.
    len: u64,
    last_seq: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

pub struct FsEventLog {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<LogState>,
    _dir_lock: DirLock,
}

impl FsEventLog {
    /// Open `<dir>/events.jsonl`, repairing a torn tail if present.
    pub async fn open(dir: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, CollabError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .map_err(|e| CollabError::storage(&format!("create {}", dir.display()), e))?;
        let dir_lock = DirLock::acquire(dir, EVENT_LOCK_FILE).await?;
        let path = dir.join(EVENT_LOG_FILE);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CollabError::storage(&format!("read {}", path.display()), e)),
        };
        let (events, valid_len) = parse_complete_lines(&bytes, &path)?;
        let last_seq = events.last().map_or(0, |e| e.seq);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| CollabError::storage(&format!("open {}", path.display()), e))?;

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - valid_len,
                "truncating torn record at end of event log"
            );
            file.set_len(valid_len as u64)
                .await
                .map_err(|e| CollabError::storage("truncate torn event log tail", e))?;
        }

        info!(path = %path.display(), last_seq, "event log opened");
        Ok(Self {
            path,
            clock,
            state: Mutex::new(LogState {
                file,
                len: valid_len as u64,
                last_seq,
                poisoned: false,
            }),
            _dir_lock: dir_lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse every `\n`-terminated line. Returns the events and the byte length of
/// the parsed prefix.
fn parse_complete_lines(bytes: &[u8], path: &Path) -> Result<(Vec<Event>, usize), CollabError> {
    let mut events: Vec<Event> = Vec::new();
    let mut offset = 0;

    while let Some(rel_end) = bytes[offset..].iter().position(|&b| b == b'\n') {
        let line = &bytes[offset..offset + rel_end];
        let event: Event = serde_json::from_slice(line).map_err(|e| {
            error!(path = %path.display(), offset, error = %e, "corrupt event record");
            CollabError::StorageUnavailable(format!(
                "{} has a corrupt record at byte {offset}: {e}",
                path.display()
            ))
        })?;

        let expected = events.last().map_or(1, |prev| prev.seq + 1);
        if event.seq != expected {
            error!(path = %path.display(), expected, found = event.seq, "event log seq gap");
            return Err(CollabError::StorageUnavailable(format!(
                "{} expected seq {expected}, found {}",
                path.display(),
                event.seq
            )));
        }

        events.push(event);
        offset += rel_end + 1;
    }
    Ok((events, offset))
}

async fn append_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl EventLog for FsEventLog {
    async fn append(&self, event: NewEvent) -> Result<Event, CollabError> {
        let mut state = self.state.lock().await;
        if state.poisoned {
            return Err(CollabError::StorageUnavailable(format!(
                "{} holds an unrolled partial record; reopen to repair",
                self.path.display()
            )));
        }
        let event = event.into_event(state.last_seq + 1, self.clock.now());

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        if let Err(e) = append_line(&mut state.file, &line).await {
            error!(seq = event.seq, error = %e, "event append failed");
            let len = state.len;
            if let Err(e) = state.file.set_len(len).await {
                error!(error = %e, "could not roll back partial event record; log poisoned");
                state.poisoned = true;
            }
            return Err(CollabError::storage("append event", e));
        }

        state.len += line.len() as u64;
        state.last_seq = event.seq;
        Ok(event)
    }

    async fn read_since(&self, after: u64) -> Result<Vec<Event>, CollabError> {
        // Only read up to what the log has acknowledged.
        let (len, last_seq) = {
            let state = self.state.lock().await;
            (state.len as usize, state.last_seq)
        };
        if after >= last_seq {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| CollabError::storage(&format!("read {}", self.path.display()), e))?;
        let prefix = &bytes[..len.min(bytes.len())];
        let (events, _) = parse_complete_lines(prefix, &self.path)?;
        Ok(events.into_iter().filter(|e| e.seq > after).collect())
    }

    async fn last_seq(&self) -> Result<u64, CollabError> {
        Ok(self.state.lock().await.last_seq)
    }
}
