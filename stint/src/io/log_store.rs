//! Append-only session log store.
//!
//! [`FileLogStore`] keeps one JSONL file per session under `.stint/log/`.
//! Every append is a single `write` of one complete line followed by
//! `fdatasync`, so an acknowledged entry survives a restart. A line without a
//! trailing newline is a torn write: readers never yield it, and the next
//! append to that session cuts it off first.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, instrument, warn};

use crate::core::log::{LogEntry, LogKind};
use crate::core::relevance::keywords;
use crate::core::types::{Feature, SessionId};
use crate::error::StoreError;

/// Lazy, finite, sequence-ordered entries of one session.
pub type EntryIter = Box<dyn Iterator<Item = Result<LogEntry, StoreError>> + Send>;

/// Durable memory shared by every session.
pub trait LogStore: Send + Sync {
    /// Persist `entry`. Its sequence number must be exactly one past the
    /// session's last entry.
    fn append(&self, entry: LogEntry) -> Result<LogEntry, StoreError>;

    /// Entries of one session in sequence order. Calling again restarts from
    /// the first entry. An unknown session yields nothing.
    fn read_session(&self, session_id: SessionId) -> Result<EntryIter, StoreError>;

    /// Entries of every session matching `filter`, most recent first.
    fn read_across_sessions(&self, filter: &LogFilter) -> Result<Vec<RecalledEntry>, StoreError>;

    /// Sequence number of the last durable entry, `0` for an unknown session.
    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError>;
}

/// Selection for cross-session retrieval.
///
/// A session matches when its feature shares a keyword or a tag with the
/// filter; with neither set, every session matches.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    /// Entry kinds to keep; empty keeps all.
    pub kinds: Vec<LogKind>,
    pub exclude_session: Option<SessionId>,
    pub limit: Option<usize>,
}

impl LogFilter {
    /// Filter matching sessions related to `feature`.
    pub fn related_to(feature: &Feature) -> Self {
        Self {
            keywords: keywords(&feature.description).into_iter().collect(),
            tags: feature.tags.clone(),
            ..Self::default()
        }
    }

    fn matches_feature(&self, feature: &Feature) -> bool {
        if self.keywords.is_empty() && self.tags.is_empty() {
            return true;
        }
        let words = keywords(&feature.description);
        let keyword_hit = self
            .keywords
            .iter()
            .any(|k| words.contains(&k.to_lowercase()));
        let tag_hit = self
            .tags
            .iter()
            .any(|t| feature.tags.iter().any(|ft| ft.eq_ignore_ascii_case(t)));
        keyword_hit || tag_hit
    }

    fn matches_kind(&self, kind: LogKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// An entry from another session together with that session's feature.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalledEntry {
    pub feature: Feature,
    pub entry: LogEntry,
}

/// A session whose feature matched a cross-session filter.
struct RelatedSession {
    session_id: SessionId,
    feature: Feature,
    modified: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Recall {
    entries: Vec<RecalledEntry>,
    sessions_read: usize,
}

/// JSONL-file-per-session log store.
#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
    ledgers: Mutex<HashMap<SessionId, Arc<Mutex<Ledger>>>>,
}

/// Append handle and tail position of one session file.
///
/// Cached while the session is live and dropped once its terminal entry is
/// written, which closes the file. A `closed` ledger is no longer in the cache;
/// an append racing the close retries with a freshly opened one.
#[derive(Debug)]
struct Ledger {
    path: PathBuf,
    file: File,
    last_sequence: u64,
    len: u64,
    closed: bool,
}

impl FileLogStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self {
            dir,
            ledgers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    fn ledger(&self, session_id: SessionId) -> Result<Arc<Mutex<Ledger>>, StoreError> {
        let mut ledgers = self
            .ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ledger) = ledgers.get(&session_id) {
            return Ok(Arc::clone(ledger));
        }
        let ledger = Arc::new(Mutex::new(Ledger::open(self.session_path(session_id))?));
        ledgers.insert(session_id, Arc::clone(&ledger));
        Ok(ledger)
    }

    /// Drop the cached ledger of a closed session.
    fn forget(&self, session_id: SessionId, ledger: &Arc<Mutex<Ledger>>) {
        let mut ledgers = self
            .ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if ledgers
            .get(&session_id)
            .is_some_and(|cached| Arc::ptr_eq(cached, ledger))
        {
            ledgers.remove(&session_id);
        }
    }

    /// Number of session files currently held open for appending.
    pub fn open_ledgers(&self) -> usize {
        self.ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn modified(&self, session_id: SessionId) -> Option<DateTime<Utc>> {
        fs::metadata(self.session_path(session_id))
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    /// Cross-session retrieval, also reporting how many session logs were
    /// read past their creation entry.
    fn recall(&self, filter: &LogFilter) -> Result<Recall, StoreError> {
        let mut related = Vec::new();
        for session_id in self.session_ids()? {
            if filter.exclude_session == Some(session_id) {
                continue;
            }
            let first = match self.read_session(session_id)?.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    warn!(session = %session_id, err = %err, "skipping unreadable session log");
                    continue;
                }
                None => continue,
            };
            let Some(feature) = first.creation_feature() else {
                continue;
            };
            if filter.matches_feature(&feature) {
                related.push(RelatedSession {
                    session_id,
                    feature,
                    modified: self.modified(session_id),
                });
            }
        }
        // Latest-written first, so a limit can end the scan once no older
        // session could contribute.
        related.sort_by_key(|s| Reverse(s.modified.unwrap_or(DateTime::<Utc>::MAX_UTC)));

        let mut recall = Recall::default();
        for session in related {
            if let (Some(limit), Some(modified)) = (filter.limit, session.modified)
                && recall.entries.len() >= limit
                && recall
                    .entries
                    .last()
                    .is_some_and(|oldest| modified + mtime_slack() < oldest.entry.timestamp)
            {
                break;
            }
            let entries: Result<Vec<LogEntry>, StoreError> =
                self.read_session(session.session_id)?.collect();
            let entries = match entries {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(session = %session.session_id, err = %err, "skipping unreadable session log");
                    continue;
                }
            };
            recall.sessions_read += 1;
            recall.entries.extend(
                entries
                    .into_iter()
                    .filter(|entry| filter.matches_kind(entry.kind))
                    .map(|entry| RecalledEntry {
                        feature: session.feature.clone(),
                        entry,
                    }),
            );
            recall.entries.sort_by(|a, b| {
                b.entry
                    .timestamp
                    .cmp(&a.entry.timestamp)
                    .then(b.entry.sequence_number.cmp(&a.entry.sequence_number))
            });
            if let Some(limit) = filter.limit {
                recall.entries.truncate(limit);
            }
        }
        Ok(recall)
    }

    fn session_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl Ledger {
    /// Open a session file for appending, recovering its tail position.
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| StoreError::io(&path, e))?;

        let mut last_sequence = 0;
        let mut good_len = 0usize;
        for (index, line) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
            if !line.ends_with(b"\n") {
                break;
            }
            let entry = parse_line(&path, index + 1, line)?;
            last_sequence = entry.sequence_number;
            good_len += line.len();
        }
        if good_len < contents.len() {
            warn!(
                path = %path.display(),
                torn_bytes = contents.len() - good_len,
                "dropping torn trailing log line"
            );
            file.set_len(good_len as u64)
                .map_err(|e| StoreError::io(&path, e))?;
            file.sync_data().map_err(|e| StoreError::io(&path, e))?;
        }
        if !existed {
            sync_parent(&path);
        }

        debug!(path = %path.display(), last_sequence, "opened session log");
        Ok(Self {
            path,
            file,
            last_sequence,
            len: good_len as u64,
            closed: false,
        })
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), StoreError> {
        let expected = self.last_sequence + 1;
        if entry.sequence_number != expected {
            return Err(StoreError::SequenceConflict {
                session_id: entry.session_id,
                expected,
                actual: entry.sequence_number,
            });
        }
        let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::Corrupt {
            location: self.path.display().to_string(),
            message: format!("encode entry {}: {e}", entry.sequence_number),
        })?;
        line.push(b'\n');

        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data());
        if let Err(err) = written {
            // Leave no partial line behind for the next append.
            if let Err(trunc) = self.file.set_len(self.len) {
                warn!(path = %self.path.display(), err = %trunc, "failed to roll back torn append");
            }
            return Err(StoreError::io(&self.path, err));
        }
        self.len += line.len() as u64;
        self.last_sequence = entry.sequence_number;
        Ok(())
    }
}

/// Allowance for file timestamps lagging the entry clock.
fn mtime_slack() -> TimeDelta {
    TimeDelta::seconds(1)
}

fn parse_line(path: &Path, line_no: usize, line: &[u8]) -> Result<LogEntry, StoreError> {
    serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
        location: format!("{}:{line_no}", path.display()),
        message: e.to_string(),
    })
}

/// Make a newly created file's directory entry durable. Best effort.
fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!(dir = %parent.display(), err = %err, "directory sync skipped");
    }
}

impl LogStore for FileLogStore {
    #[instrument(skip_all, fields(session = %entry.session_id, seq = entry.sequence_number, kind = entry.kind.as_str()))]
    fn append(&self, entry: LogEntry) -> Result<LogEntry, StoreError> {
        loop {
            let shared = self.ledger(entry.session_id)?;
            let mut ledger = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if ledger.closed {
                continue;
            }
            ledger.append(&entry)?;
            if entry.closes_session() {
                ledger.closed = true;
                self.forget(entry.session_id, &shared);
                debug!("session closed, log handle released");
            }
            debug!("appended log entry");
            return Ok(entry);
        }
    }

    fn read_session(&self, session_id: SessionId) -> Result<EntryIter, StoreError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Box::new(std::iter::empty()));
        }
        let file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Box::new(EntryReader {
            reader: BufReader::new(file),
            path,
            line_no: 0,
            done: false,
        }))
    }

    #[instrument(skip_all, fields(keywords = filter.keywords.len(), tags = filter.tags.len()))]
    fn read_across_sessions(&self, filter: &LogFilter) -> Result<Vec<RecalledEntry>, StoreError> {
        let recall = self.recall(filter)?;
        debug!(
            matched = recall.entries.len(),
            sessions_read = recall.sessions_read,
            "cross-session read"
        );
        Ok(recall.entries)
    }

    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError> {
        let cached = self
            .ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned();
        let ledger = match cached {
            Some(ledger) => ledger,
            None if !self.session_path(session_id).exists() => return Ok(0),
            None => self.ledger(session_id)?,
        };
        let ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ledger.last_sequence)
    }
}

/// Streaming reader over one session file.
struct EntryReader {
    reader: BufReader<File>,
    path: PathBuf,
    line_no: usize,
    done: bool,
}

impl Iterator for EntryReader {
    type Item = Result<LogEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) if !line.ends_with(b"\n") => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.line_no += 1;
                let parsed = parse_line(&self.path, self.line_no, &line);
                if parsed.is_err() {
                    self.done = true;
                }
                Some(parsed)
            }
            Err(err) => {
                self.done = true;
                Some(Err(StoreError::io(&self.path, err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::{AbortPayload, LogRecord, PlanningPayload};
    use crate::core::session::Session;
    use crate::core::types::SessionState;

    fn creation(id: SessionId, feature: &Feature) -> LogEntry {
        LogEntry::new(id, 1, &LogRecord::Transition(Session::creation(feature))).expect("entry")
    }

    fn planning(id: SessionId, seq: u64, summary: &str) -> LogEntry {
        LogEntry::new(
            id,
            seq,
            &LogRecord::Planning(PlanningPayload {
                summary: summary.to_string(),
                ..PlanningPayload::default()
            }),
        )
        .expect("entry")
    }

    fn read_all(store: &FileLogStore, id: SessionId) -> Vec<LogEntry> {
        store
            .read_session(id)
            .expect("read")
            .collect::<Result<_, _>>()
            .expect("entries")
    }

    #[test]
    fn append_requires_contiguous_sequence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::open(temp.path()).expect("open");
        let id = SessionId::generate();

        let err = store.append(planning(id, 2, "skip")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        store
            .append(creation(id, &Feature::new("add jitter")))
            .expect("append 1");
        store.append(planning(id, 2, "plan")).expect("append 2");
        assert!(store.append(planning(id, 2, "dup")).is_err());
        assert_eq!(store.last_sequence(id).expect("last"), 2);
    }

    #[test]
    fn read_session_is_ordered_and_restartable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::open(temp.path()).expect("open");
        let id = SessionId::generate();
        store
            .append(creation(id, &Feature::new("add jitter")))
            .expect("append");
        store.append(planning(id, 2, "a")).expect("append");
        store.append(planning(id, 3, "b")).expect("append");

        let first: Vec<u64> = read_all(&store, id)
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        let again: Vec<u64> = read_all(&store, id)
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(again, first);
        assert!(read_all(&store, SessionId::generate()).is_empty());
    }

    #[test]
    fn entries_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = SessionId::generate();
        {
            let store = FileLogStore::open(temp.path()).expect("open");
            store
                .append(creation(id, &Feature::new("add jitter")))
                .expect("append");
            store.append(planning(id, 2, "plan")).expect("append");
        }
        let reopened = FileLogStore::open(temp.path()).expect("reopen");
        assert_eq!(reopened.last_sequence(id).expect("last"), 2);
        assert_eq!(read_all(&reopened, id).len(), 2);
        reopened.append(planning(id, 3, "next")).expect("append");
    }

    #[test]
    fn torn_tail_is_invisible_and_cut_before_next_append() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = SessionId::generate();
        let store = FileLogStore::open(temp.path()).expect("open");
        store
            .append(creation(id, &Feature::new("add jitter")))
            .expect("append");
        drop(store);

        let path = temp.path().join(format!("{id}.jsonl"));
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(br#"{"session_id":"#).expect("torn write");
        drop(file);

        let store = FileLogStore::open(temp.path()).expect("reopen");
        assert_eq!(read_all(&store, id).len(), 1);
        store.append(planning(id, 2, "after crash")).expect("append");
        let entries = read_all(&store, id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence_number, 2);
    }

    #[test]
    fn cross_session_reads_match_features_and_order_recent_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::open(temp.path()).expect("open");

        let login = SessionId::generate();
        store
            .append(creation(login, &Feature::new("add login endpoint")))
            .expect("append");
        store.append(planning(login, 2, "login plan")).expect("append");

        let charts = SessionId::generate();
        store
            .append(creation(charts, &Feature::new("dashboard charts").with_tag("auth")))
            .expect("append");
        let abort = LogEntry::new(
            charts,
            2,
            &LogRecord::Abort(AbortPayload {
                from: SessionState::Planning,
                reason: "operator".to_string(),
                flagged_for_inspection: false,
            }),
        )
        .expect("entry");
        store.append(abort).expect("append");

        let unrelated = SessionId::generate();
        store
            .append(creation(unrelated, &Feature::new("bump version")))
            .expect("append");

        let filter = LogFilter {
            keywords: vec!["login".to_string()],
            tags: vec!["auth".to_string()],
            ..LogFilter::default()
        };
        let recalled = store.read_across_sessions(&filter).expect("read");
        assert_eq!(recalled.len(), 4);
        assert!(recalled.iter().all(|r| r.entry.session_id != unrelated));
        for pair in recalled.windows(2) {
            assert!(pair[0].entry.timestamp >= pair[1].entry.timestamp);
        }

        let planning_only = LogFilter {
            kinds: vec![LogKind::PlanningDecision],
            exclude_session: Some(charts),
            ..filter
        };
        let recalled = store.read_across_sessions(&planning_only).expect("read");
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].feature.description, "add login endpoint");
    }

    #[test]
    fn concurrent_appends_to_distinct_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileLogStore::open(temp.path()).expect("open"));
        let ids: Vec<SessionId> = (0..4).map(|_| SessionId::generate()).collect();

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .append(creation(id, &Feature::new("parallel work")))
                        .expect("append");
                    for seq in 2..=25 {
                        store.append(planning(id, seq, "step")).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        for id in ids {
            let seqs: Vec<u64> = read_all(&store, id)
                .iter()
                .map(|e| e.sequence_number)
                .collect();
            assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
        }
    }

    fn abort(id: SessionId, seq: u64) -> LogEntry {
        LogEntry::new(
            id,
            seq,
            &LogRecord::Abort(AbortPayload {
                from: SessionState::Planning,
                reason: "operator".to_string(),
                flagged_for_inspection: false,
            }),
        )
        .expect("entry")
    }

    #[test]
    fn closed_sessions_release_their_append_handle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::open(temp.path()).expect("open");

        let mut closed = Vec::new();
        for _ in 0..300 {
            let id = SessionId::generate();
            store
                .append(creation(id, &Feature::new("short lived")))
                .expect("append creation");
            store.append(abort(id, 2)).expect("append abort");
            closed.push(id);
        }
        assert_eq!(store.open_ledgers(), 0);

        let live = SessionId::generate();
        store
            .append(creation(live, &Feature::new("still running")))
            .expect("append");
        assert_eq!(store.open_ledgers(), 1);

        // A closed session reopens with its tail position recovered.
        let id = closed[0];
        assert_eq!(store.last_sequence(id).expect("last"), 2);
        assert!(store.append(planning(id, 2, "stale")).is_err());
        store.append(planning(id, 3, "after close")).expect("append");
        assert_eq!(read_all(&store, id).len(), 3);
    }

    #[test]
    fn unrelated_sessions_are_matched_on_their_first_entry_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::open(temp.path()).expect("open");

        let related = SessionId::generate();
        store
            .append(creation(related, &Feature::new("add login endpoint")))
            .expect("append");
        for seq in 2..=4 {
            let other = SessionId::generate();
            store
                .append(creation(other, &Feature::new("bump version")))
                .expect("append");
            store.append(planning(related, seq, "login step")).expect("append");
        }

        let filter = LogFilter {
            keywords: vec!["login".to_string()],
            ..LogFilter::default()
        };
        let recall = store.recall(&filter).expect("recall");
        assert_eq!(recall.sessions_read, 1);
        assert_eq!(recall.entries.len(), 4);
    }

    #[test]
    fn limit_stops_before_sessions_older_than_the_kept_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::open(temp.path()).expect("open");

        let old = SessionId::generate();
        store
            .append(creation(old, &Feature::new("login retries")))
            .expect("append");
        store.append(planning(old, 2, "old plan")).expect("append");

        let recent = SessionId::generate();
        store
            .append(creation(recent, &Feature::new("login lockout")))
            .expect("append");
        store.append(planning(recent, 2, "plan")).expect("append");
        store.append(planning(recent, 3, "replan")).expect("append");

        let hour_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        OpenOptions::new()
            .write(true)
            .open(temp.path().join(format!("{old}.jsonl")))
            .expect("open old log")
            .set_modified(hour_ago)
            .expect("set mtime");

        let filter = LogFilter {
            keywords: vec!["login".to_string()],
            limit: Some(3),
            ..LogFilter::default()
        };
        let recall = store.recall(&filter).expect("recall");
        assert_eq!(recall.sessions_read, 1);
        assert_eq!(recall.entries.len(), 3);
        assert!(recall.entries.iter().all(|r| r.entry.session_id == recent));

        let unlimited = LogFilter {
            limit: None,
            ..filter
        };
        assert_eq!(store.recall(&unlimited).expect("recall").sessions_read, 2);
    }
}
