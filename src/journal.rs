//! Append-only, hash-chained record of command dispatches.
//!
//! Each entry hashes the previous entry hash together with the serialized
//! record, so any edit or removal breaks the chain from that point on.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::command::{CommandMessage, CommandType, DispatchResult};
use crate::tracker::TargetId;

const GENESIS: [u8; 32] = [0u8; 32];

/// Hashes an entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub frame_timestamp_ms: u64,
    pub session_id: String,
    pub sequence_number: u64,
    pub command_type: CommandType,
    pub target_ref: Option<TargetId>,
    pub outcome: DispatchOutcome,
}

impl JournalRecord {
    pub fn from_dispatch(
        frame_timestamp_ms: u64,
        message: &CommandMessage,
        result: &DispatchResult,
    ) -> Self {
        let outcome = match result {
            Ok(receipt) => DispatchOutcome::Delivered {
                attempts: receipt.attempts,
            },
            Err(err) => DispatchOutcome::Failed {
                attempts: err.attempts,
                reason: err.to_string(),
            },
        };
        Self {
            frame_timestamp_ms,
            session_id: message.session_id.clone(),
            sequence_number: message.sequence_number,
            command_type: message.command_type,
            target_ref: message.target_ref,
            outcome,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub record: JournalRecord,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// In memory, every entry is kept. Backed by a file, only the chain head and
/// the newest entry stay resident; the file is the record.
pub struct CommandJournal {
    entries: Vec<JournalEntry>,
    last: Option<JournalEntry>,
    len: usize,
    head: [u8; 32],
    sink: Option<JournalFile>,
}

struct JournalFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Default for CommandJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandJournal {
    /// In-memory journal.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last: None,
            len: 0,
            head: GENESIS,
            sink: None,
        }
    }

    /// Journal that also appends each entry as one JSON line to `path`.
    /// The file is truncated; one journal file covers one session.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| anyhow!("cannot open journal {}: {}", path.display(), e))?;
        log::info!("writing command journal to {}", path.display());
        Ok(Self {
            sink: Some(JournalFile {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
            }),
            ..Self::new()
        })
    }

    pub fn record(&mut self, record: JournalRecord) -> Result<&JournalEntry> {
        let payload = serde_json::to_vec(&record)?;
        let entry_hash = hash_entry(&self.head, &payload);
        let entry = JournalEntry {
            record,
            prev_hash: hex::encode(self.head),
            entry_hash: hex::encode(entry_hash),
        };
        match self.sink.as_mut() {
            Some(sink) => {
                serde_json::to_writer(&mut sink.writer, &entry)?;
                sink.writer.write_all(b"\n")?;
                sink.writer.flush()?;
            }
            None => self.entries.push(entry.clone()),
        }
        self.head = entry_hash;
        self.len += 1;
        Ok(&*self.last.insert(entry))
    }

    /// Entries held in memory; empty for a file-backed journal.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&JournalEntry> {
        self.last.as_ref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|sink| sink.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head_hex(&self) -> String {
        hex::encode(self.head)
    }

    /// Re-walk the chain. A file-backed journal is re-read from disk and must
    /// end at the head this journal wrote.
    pub fn verify(&self) -> Result<()> {
        let Some(sink) = self.sink.as_ref() else {
            return verify_chain(&self.entries);
        };
        let entries = read_journal(&sink.path)?;
        verify_chain(&entries)?;
        if entries.len() != self.len {
            return Err(anyhow!(
                "journal {} holds {} entries, expected {}",
                sink.path.display(),
                entries.len(),
                self.len
            ));
        }
        let file_head = entries
            .last()
            .map(|entry| entry.entry_hash.clone())
            .unwrap_or_else(|| hex::encode(GENESIS));
        if file_head != self.head_hex() {
            return Err(anyhow!(
                "journal {} does not end at the recorded head",
                sink.path.display()
            ));
        }
        Ok(())
    }
}

/// Re-walks a chain from genesis, failing at the first broken link.
pub fn verify_chain(entries: &[JournalEntry]) -> Result<()> {
    let mut prev = GENESIS;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.prev_hash != hex::encode(prev) {
            return Err(anyhow!("journal entry {} does not follow its predecessor", idx));
        }
        let payload = serde_json::to_vec(&entry.record)?;
        let expected = hash_entry(&prev, &payload);
        if entry.entry_hash != hex::encode(expected) {
            return Err(anyhow!("journal entry {} hash mismatch", idx));
        }
        prev = expected;
    }
    Ok(())
}

pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
    let path = path.as_ref();
    let file =
        File::open(path).map_err(|e| anyhow!("cannot open journal {}: {}", path.display(), e))?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(&line)
            .map_err(|e| anyhow!("journal line {}: {}", idx + 1, e))?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, outcome: DispatchOutcome) -> JournalRecord {
        JournalRecord {
            frame_timestamp_ms: seq * 100,
            session_id: "s".into(),
            sequence_number: seq,
            command_type: CommandType::ReleasePayload,
            target_ref: Some(1),
            outcome,
        }
    }

    #[test]
    fn chain_links_entries() {
        let mut journal = CommandJournal::new();
        journal
            .record(record(1, DispatchOutcome::Delivered { attempts: 1 }))
            .unwrap();
        journal
            .record(record(
                2,
                DispatchOutcome::Failed {
                    attempts: 3,
                    reason: "timeout".into(),
                },
            ))
            .unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.entries()[1].prev_hash, journal.entries()[0].entry_hash);
        assert_eq!(journal.head_hex(), journal.entries()[1].entry_hash);
        journal.verify().unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let mut journal = CommandJournal::new();
        for seq in 1..=3 {
            journal
                .record(record(seq, DispatchOutcome::Delivered { attempts: 1 }))
                .unwrap();
        }
        let mut entries = journal.entries().to_vec();
        entries[1].record.target_ref = Some(99);
        let err = verify_chain(&entries).unwrap_err();
        assert!(err.to_string().contains("entry 1"));

        let mut entries = journal.entries().to_vec();
        entries.remove(0);
        assert!(verify_chain(&entries).is_err());
    }

    #[test]
    fn file_journal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let mut journal = CommandJournal::create(&path).unwrap();
        journal
            .record(record(1, DispatchOutcome::Delivered { attempts: 2 }))
            .unwrap();
        let loaded = read_journal(&path).unwrap();
        assert_eq!(Some(&loaded[0]), journal.last());
        verify_chain(&loaded).unwrap();
        journal.verify().unwrap();
    }

    #[test]
    fn file_journal_keeps_only_head_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let mut journal = CommandJournal::create(&path).unwrap();
        for seq in 1..=50 {
            journal
                .record(record(seq, DispatchOutcome::Delivered { attempts: 1 }))
                .unwrap();
        }
        assert!(journal.entries().is_empty());
        assert_eq!(journal.len(), 50);
        assert_eq!(journal.last().unwrap().record.sequence_number, 50);
        assert_eq!(journal.path(), Some(path.as_path()));
        journal.verify().unwrap();

        // Truncating the file behind the journal's back is caught.
        let raw = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = raw.lines().take(49).collect();
        std::fs::write(&path, kept.join("\n")).unwrap();
        assert!(journal.verify().is_err());
    }
}
