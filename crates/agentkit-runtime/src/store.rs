//! File-backed Session Store
//!
//! One directory holds every session as three files:
//!
//! - `<id>.meta.json`: identity, timestamps and metadata, replaced atomically
//! - `<id>.jsonl`: the append-only message log, one JSON message per line
//! - `<id>.lease`: present while a run holds the session
//!
//! Appends are flushed with `sync_data` before returning. Lease files are
//! created with `create_new`, so exclusivity also holds between processes
//! sharing the directory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentkit_core::error::{AgentError, Result};
use agentkit_core::message::{Message, MessageLog};
use agentkit_core::session::{Session, SessionId, SessionMetadata, SessionStore};

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    id: SessionId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: SessionMetadata,
}

/// JSON Lines session store rooted at a directory
#[derive(Debug)]
pub struct JsonlSessionStore {
    root: PathBuf,
    /// Next sequence number and expected log length per session. Recounted
    /// when another process has grown the log since.
    next_seq: Mutex<HashMap<SessionId, (u64, u64)>>,
}

impl JsonlSessionStore {
    /// Open (and create if needed) a store directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "Opened session store");
        Ok(Self {
            root,
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove a lease left behind by a process that died mid-run.
    ///
    /// Only call this when no live process can be running the session.
    pub fn break_lease(&self, id: &SessionId) -> Result<bool> {
        let removed = self.remove_lease(id)?;
        if removed {
            tracing::warn!(session_id = %id, "Broke stale run lease");
        }
        Ok(removed)
    }

    fn remove_lease(&self, id: &SessionId) -> Result<bool> {
        match fs::remove_file(self.path(id, "lease")?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn path(&self, id: &SessionId, ext: &str) -> Result<PathBuf> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AgentError::Storage(format!("invalid session id `{raw}`")));
        }
        Ok(self.root.join(format!("{raw}.{ext}")))
    }

    fn read_record(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        match fs::read_to_string(self.path(id, "meta.json")?) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write-then-rename so a crash never leaves a torn record
    fn write_record(&self, record: &SessionRecord) -> Result<()> {
        let path = self.path(&record.id, "meta.json")?;
        let tmp = self.path(&record.id, "meta.json.tmp")?;
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Line count of the log, dropping a torn trailing line from a crashed write
    fn recover_log(path: &Path, id: &SessionId) -> Result<u64> {
        let mut data = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let complete = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if complete < data.len() {
            tracing::warn!(
                session_id = %id,
                dropped_bytes = data.len() - complete,
                "Truncating torn trailing line in session log"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(complete as u64)?;
            file.sync_data()?;
        }

        Ok(data[..complete].iter().filter(|b| **b == b'\n').count() as u64)
    }

    /// Complete lines only. Works on bytes so a write torn inside a
    /// multi-byte character still leaves every earlier line readable.
    fn read_log(path: &Path, id: &SessionId) -> Result<Vec<Message>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let complete = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if complete < data.len() {
            tracing::warn!(
                session_id = %id,
                torn_bytes = data.len() - complete,
                "Ignoring torn trailing line in session log"
            );
        }

        let mut messages = Vec::new();
        for line in data[..complete].split(|b| *b == b'\n') {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            messages.push(serde_json::from_slice(line)?);
        }
        Ok(messages)
    }

    fn last_activity(&self, id: &SessionId) -> SystemTime {
        ["meta.json", "jsonl"]
            .iter()
            .filter_map(|ext| self.path(id, ext).ok())
            .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
            .max()
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    fn lock_seq(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, (u64, u64)>> {
        self.next_seq.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for JsonlSessionStore {
    fn create(&self, session: &Session) -> Result<()> {
        if self.read_record(&session.id)?.is_some() {
            return Err(AgentError::Storage(format!("session {} already exists", session.id)));
        }
        self.write_record(&SessionRecord {
            id: session.id.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            metadata: session.metadata.clone(),
        })?;

        for message in session.messages.messages() {
            self.append(&session.id, message)?;
        }
        Ok(())
    }

    fn append(&self, id: &SessionId, message: &Message) -> Result<u64> {
        if self.read_record(id)?.is_none() {
            return Err(AgentError::SessionNotFound(id.to_string()));
        }
        let path = self.path(id, "jsonl")?;

        // Held across the write so in-process appends keep a total order
        let mut next_seq = self.lock_seq();
        let on_disk = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let seq = match next_seq.get(id) {
            Some((seq, len)) if *len == on_disk => *seq,
            _ => Self::recover_log(&path, id)?,
        };

        let mut stamped = message.clone();
        stamped.seq = seq;
        let mut line = serde_json::to_vec(&stamped)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        file.sync_data()?;

        let len = file.metadata()?.len();
        next_seq.insert(id.clone(), (seq + 1, len));
        Ok(seq)
    }

    fn read(&self, id: &SessionId) -> Result<Option<Session>> {
        let Some(record) = self.read_record(id)? else {
            return Ok(None);
        };
        let messages = Self::read_log(&self.path(id, "jsonl")?, id)?;
        let updated_at = messages
            .last()
            .map_or(record.updated_at, |m| m.timestamp.max(record.updated_at));

        Ok(Some(Session {
            id: record.id,
            created_at: record.created_at,
            updated_at,
            metadata: record.metadata,
            messages: MessageLog::from_messages(messages),
        }))
    }

    fn update_metadata(&self, id: &SessionId, metadata: &SessionMetadata) -> Result<()> {
        let mut record = self
            .read_record(id)?
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;
        record.metadata = metadata.clone();
        record.updated_at = Utc::now();
        self.write_record(&record)
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        let mut existed = false;
        for ext in ["meta.json", "jsonl"] {
            match fs::remove_file(self.path(id, ext)?) {
                Ok(()) => existed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.lock_seq().remove(id);
        Ok(existed)
    }

    fn list(&self, limit: usize) -> Result<Vec<SessionId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".meta.json")) {
                ids.push(SessionId::from_string(id));
            }
        }

        let mut ids: Vec<_> = ids
            .into_iter()
            .map(|id| (self.last_activity(&id), id))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(ids.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    fn lease(&self, id: &SessionId) -> Result<()> {
        let path = self.path(id, "lease")?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(AgentError::SessionBusy(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, id: &SessionId) -> Result<()> {
        self.remove_lease(id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSessionStore::open(dir.path()).unwrap();
        let err = store.read(&SessionId::from_string("../escape")).unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));
    }

    #[test]
    fn test_torn_line_is_truncated_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSessionStore::open(dir.path()).unwrap();
        let session = Session::new();
        store.create(&session).unwrap();
        store.append(&session.id, &Message::user("one")).unwrap();

        // Simulate a crash halfway through writing a line, then a fresh process
        let log = store.path(&session.id, "jsonl").unwrap();
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(br#"{"seq":1,"role":"assis"#).unwrap();
        drop(store);

        let store = JsonlSessionStore::open(dir.path()).unwrap();
        assert_eq!(store.read(&session.id).unwrap().unwrap().message_count(), 1);
        assert_eq!(store.append(&session.id, &Message::assistant("two")).unwrap(), 1);

        let messages = store.read(&session.id).unwrap().unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages.messages()[1].text(), "two");
    }

    #[test]
    fn test_torn_multibyte_character_keeps_session_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSessionStore::open(dir.path()).unwrap();
        let session = Session::new();
        store.create(&session).unwrap();
        store.append(&session.id, &Message::user("café")).unwrap();

        // Crash after the first byte of "é" in the next line
        let log = store.path(&session.id, "jsonl").unwrap();
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"{\"seq\":1,\"role\":\"assistant\",\"content\":\"caf\xC3").unwrap();
        drop(store);

        let store = JsonlSessionStore::open(dir.path()).unwrap();
        let read = store.read(&session.id).unwrap().unwrap();
        assert_eq!(read.message_count(), 1);
        assert_eq!(read.messages.messages()[0].text(), "café");

        // Runs can start again and the torn bytes are gone on the next append
        store.lease(&session.id).unwrap();
        assert_eq!(store.append(&session.id, &Message::assistant("déjà")).unwrap(), 1);
        store.release(&session.id).unwrap();
        let texts: Vec<_> = store
            .read(&session.id)
            .unwrap()
            .unwrap()
            .messages
            .messages()
            .iter()
            .map(Message::text)
            .collect();
        assert_eq!(texts, vec!["café", "déjà"]);
    }
}
