//! File-backed message store: one append-only JSON-lines log per peer.
//!
//! Layout: `{dir}/{hex(peer_id)}/backlog.jsonl`. Each line is either a stored
//! message or an ack for an earlier message. Purging rewrites the log without
//! the purged entries. A partial last line left by an interrupted write is cut
//! off when the log is opened; unreadable lines elsewhere are skipped.

use super::{MessageCursor, MessageStore, StoredMessage};
use crate::error::{PersistenceError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ferry::{MessageId, PeerId, TransportMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOG_FILE: &str = "backlog.jsonl";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogRecord {
    Message(StoredMessage),
    Ack {
        message_id: MessageId,
        acked_at: DateTime<Utc>,
    },
}

struct PeerLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl PeerLog {
    fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        repair_torn_tail(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let written = self
            .writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush());
        if let Err(e) = written {
            self.recover_from_failed_write();
            return Err(e.into());
        }
        Ok(())
    }

    /// Discard buffered bytes of the failed record and cut whatever part of
    /// it reached the file, so the next record starts on a fresh line.
    fn recover_from_failed_write(&mut self) {
        let reopened = repair_torn_tail(&self.path).and_then(|()| {
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map_err(PersistenceError::from)
        });
        match reopened {
            Ok(file) => {
                let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
                let _ = failed.into_parts();
            }
            Err(e) => tracing::error!(
                "[STORE] could not recover {} after failed write: {}",
                self.path.display(),
                e
            ),
        }
    }

    /// Committed length of the log; bytes past it may belong to a write
    /// still in progress.
    fn committed_len(&mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.path.metadata()?.len())
    }
}

pub struct FileMessageStore {
    dir: PathBuf,
    logs: DashMap<PeerId, Arc<Mutex<PeerLog>>>,
}

impl FileMessageStore {
    /// Open a store rooted at `dir`, picking up existing peer logs.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let logs = DashMap::new();

        for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
            if !entry.path().join(LOG_FILE).exists() {
                continue;
            }
            let name = entry.file_name();
            let Some(peer_id) = name.to_str().and_then(decode_peer_dir) else {
                tracing::warn!("[STORE] skipping unrecognized directory {:?}", name);
                continue;
            };
            let log = PeerLog::open(&entry.path())?;
            logs.insert(peer_id, Arc::new(Mutex::new(log)));
        }

        tracing::info!(
            "[STORE] opened {} with {} peer backlogs",
            dir.display(),
            logs.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            logs,
        })
    }

    fn peer_dir(&self, peer_id: &PeerId) -> PathBuf {
        self.dir.join(hex::encode(peer_id.as_str()))
    }

    fn log(&self, peer_id: &PeerId) -> Result<Arc<Mutex<PeerLog>>> {
        if let Some(log) = self.logs.get(peer_id) {
            return Ok(Arc::clone(&log));
        }
        let log = Arc::new(Mutex::new(PeerLog::open(&self.peer_dir(peer_id))?));
        Ok(Arc::clone(
            &self.logs.entry(peer_id.clone()).or_insert(log),
        ))
    }
}

fn decode_peer_dir(name: &str) -> Option<PeerId> {
    let bytes = hex::decode(name).ok()?;
    String::from_utf8(bytes).ok().map(PeerId::from)
}

/// Truncate the log after its last complete line.
fn repair_torn_tail(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    let mut buf = [0u8; 4096];
    let mut end = len;
    let mut keep = 0;

    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(());
        }
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }
    if keep == len {
        return Ok(());
    }

    tracing::warn!(
        "[STORE] {} ends in a partial record, truncating {} bytes",
        path.display(),
        len - keep
    );
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(())
}

fn parse_record(path: &Path, line: std::io::Result<String>) -> Result<Option<LogRecord>> {
    let line = line?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&line) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            tracing::warn!(
                "[STORE] skipping unreadable record in {}: {}",
                path.display(),
                e
            );
            Ok(None)
        }
    }
}

fn read_records(path: &Path, len: u64) -> Result<Vec<LogRecord>> {
    let reader = BufReader::new(File::open(path)?.take(len));
    let mut records = Vec::new();
    for line in reader.lines() {
        if let Some(record) = parse_record(path, line)? {
            records.push(record);
        }
    }
    Ok(records)
}

impl MessageStore for FileMessageStore {
    fn append(&self, peer_id: &PeerId, message: &TransportMessage) -> Result<()> {
        let log = self.log(peer_id)?;
        let mut log = log.lock();
        log.write(&LogRecord::Message(StoredMessage::new(
            peer_id.clone(),
            message.clone(),
        )))
    }

    fn mark_acked(&self, peer_id: &PeerId, message_id: MessageId) -> Result<()> {
        let Some(log) = self.logs.get(peer_id).map(|log| Arc::clone(&log)) else {
            return Ok(());
        };
        let mut log = log.lock();
        log.write(&LogRecord::Ack {
            message_id,
            acked_at: Utc::now(),
        })
    }

    fn read_unacked_ordered(&self, peer_id: &PeerId) -> Result<MessageCursor> {
        let Some(log) = self.logs.get(peer_id).map(|log| Arc::clone(&log)) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let (path, len) = {
            let mut log = log.lock();
            let len = log.committed_len()?;
            (log.path.clone(), len)
        };

        let acked: HashSet<MessageId> = read_records(&path, len)?
            .into_iter()
            .filter_map(|record| match record {
                LogRecord::Ack { message_id, .. } => Some(message_id),
                LogRecord::Message(_) => None,
            })
            .collect();

        let reader = BufReader::new(File::open(&path)?.take(len));
        let cursor = reader
            .lines()
            .filter_map(move |line| match parse_record(&path, line) {
                Ok(Some(LogRecord::Message(stored))) if !acked.contains(&stored.message_id) => {
                    Some(Ok(stored))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            });
        Ok(Box::new(cursor))
    }

    fn delete_all_for_peer(&self, peer_id: &PeerId) -> Result<()> {
        if let Some((_, log)) = self.logs.remove(peer_id) {
            let _guard = log.lock();
            let dir = self.peer_dir(peer_id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            tracing::info!("[STORE] deleted backlog for {}", peer_id);
        }
        Ok(())
    }

    fn purge_acknowledged_before(&self, peer_id: &PeerId, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(log) = self.logs.get(peer_id).map(|log| Arc::clone(&log)) else {
            return Ok(0);
        };
        let mut log = log.lock();
        let len = log.committed_len()?;
        let records = read_records(&log.path, len)?;

        let acked: HashSet<MessageId> = records
            .iter()
            .filter_map(|record| match record {
                LogRecord::Ack { message_id, .. } => Some(*message_id),
                LogRecord::Message(_) => None,
            })
            .collect();
        let purged: HashSet<MessageId> = records
            .iter()
            .filter_map(|record| match record {
                LogRecord::Message(stored)
                    if acked.contains(&stored.message_id) && stored.stored_at < cutoff =>
                {
                    Some(stored.message_id)
                }
                _ => None,
            })
            .collect();

        if purged.is_empty() {
            return Ok(0);
        }

        let tmp_path = log.path.with_extension("jsonl.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in &records {
                let keep = match record {
                    LogRecord::Message(stored) => !purged.contains(&stored.message_id),
                    LogRecord::Ack { message_id, .. } => !purged.contains(message_id),
                };
                if keep {
                    serde_json::to_writer(&mut tmp, record)?;
                    tmp.write_all(b"\n")?;
                }
            }
            tmp.flush()?;
        }
        fs::rename(&tmp_path, &log.path)?;

        let file = OpenOptions::new().append(true).open(&log.path)?;
        log.writer = BufWriter::new(file);

        Ok(purged.len())
    }

    fn flush(&self, peer_id: &PeerId) -> Result<()> {
        if let Some(log) = self.logs.get(peer_id).map(|log| Arc::clone(&log)) {
            log.lock().writer.flush()?;
        }
        Ok(())
    }

    fn peer_ids(&self) -> Vec<PeerId> {
        self.logs.iter().map(|entry| entry.key().clone()).collect()
    }
}
