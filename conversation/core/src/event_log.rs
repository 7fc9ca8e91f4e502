//! Event Log
//!
//! Append-only, file-backed sequence of [`Event`]s. Each event lives in its
//! own file under the log directory, named after its index and id (see
//! [`persistence`](crate::persistence)).
//!
//! # Invariants
//!
//! - Index `i` maps to exactly one event id and back
//! - Indices are contiguous from 0. A missing file at index `k` found while
//!   scanning truncates the log to length `k`; files past the gap stay on
//!   disk but are invisible until the gap is healed
//! - An id already present in the log is never appended again
//!
//! The in-memory maps sit behind a `RwLock`, so the log can be shared by
//! reference. Writers are expected to be serialized by the conversation lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::events::{Event, EventId};
use crate::file_store::{join, FileStore, FileStoreError};
use crate::persistence::{event_file_name, EventFileName};

/// Errors from [`EventLog`]
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The id is already stored at another index
    #[error("event id {id} already exists at index {existing}, cannot append at {expected}")]
    IdConflict {
        /// Offending id
        id: EventId,
        /// Where the id already lives
        existing: usize,
        /// Where the append would have gone
        expected: usize,
    },

    /// Index outside `[-len, len)`
    #[error("event index {index} out of range for log of length {len}")]
    IndexOutOfRange {
        /// Requested index
        index: isize,
        /// Log length
        len: usize,
    },

    /// Valid index whose backing file is gone
    #[error("event file missing for index {index}: {path}")]
    FileMissing {
        /// Index requested
        index: usize,
        /// Expected file path
        path: String,
    },

    /// Id not present in the log
    #[error("unknown event id: {0}")]
    UnknownEventId(EventId),

    /// Id cannot be used in an event file name
    #[error("invalid event id {0:?}: only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidEventId(EventId),

    /// Backing store failure
    #[error(transparent)]
    Store(#[from] FileStoreError),

    /// Event file could not be (de)serialized
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct LogIndex {
    len: usize,
    paths: HashMap<usize, String>,
    idx_to_id: HashMap<usize, EventId>,
    id_to_idx: HashMap<EventId, usize>,
}

impl LogIndex {
    fn map(&mut self, index: usize, id: EventId) {
        self.id_to_idx.insert(id.clone(), index);
        self.idx_to_id.insert(index, id);
    }
}

/// File-backed event sequence
pub struct EventLog {
    store: Arc<dyn FileStore>,
    dir: String,
    index: RwLock<LogIndex>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("dir", &self.dir)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Open the log stored under `dir`, scanning existing event files.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn open(store: Arc<dyn FileStore>, dir: impl Into<String>) -> Result<Self, EventLogError> {
        let dir = dir.into();
        let mut found: BTreeMap<usize, (String, Option<EventId>)> = BTreeMap::new();

        for name in store.list(&dir)? {
            let Some(parsed) = EventFileName::parse(&name) else {
                continue;
            };
            // A half-finished migration can leave both names; prefer the one with the id
            match found.get(&parsed.index) {
                Some((_, Some(_))) if parsed.is_legacy() => continue,
                _ => {
                    found.insert(parsed.index, (join(&dir, &name), parsed.id));
                }
            }
        }

        let mut index = LogIndex::default();
        while let Some((path, id)) = found.get(&index.len) {
            let position = index.len;
            let id = match id {
                Some(id) => Some(id.clone()),
                None => read_event_id(store.as_ref(), path),
            };
            if let Some(id) = id {
                index.map(position, id);
            }
            index.paths.insert(position, path.clone());
            index.len += 1;
        }

        if let Some((&last, _)) = found.iter().next_back() {
            if last >= index.len {
                tracing::warn!(
                    dir = %dir,
                    len = index.len,
                    beyond = found.range(index.len..).count(),
                    "Event log has a gap; events past it are ignored"
                );
            }
        }

        tracing::debug!(dir = %dir, len = index.len, "Opened event log");
        Ok(Self {
            store,
            dir,
            index: RwLock::new(index),
        })
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an event at the next free index.
    ///
    /// Returns the index the event was stored at.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::IdConflict`] if the id is already in the log
    /// and [`EventLogError::InvalidEventId`] if it cannot name a file. Either
    /// way nothing is written.
    pub fn append(&self, event: &Event) -> Result<usize, EventLogError> {
        if !event.id.is_file_safe() {
            return Err(EventLogError::InvalidEventId(event.id.clone()));
        }

        let mut index = self.index.write();
        let expected = index.len;

        if let Some(&existing) = index.id_to_idx.get(&event.id) {
            return Err(EventLogError::IdConflict {
                id: event.id.clone(),
                existing,
                expected,
            });
        }

        let path = join(&self.dir, &event_file_name(expected, &event.id));
        let payload = serde_json::to_vec(event)?;
        self.store.write(&path, &payload)?;

        index.map(expected, event.id.clone());
        index.paths.insert(expected, path);
        index.len += 1;

        tracing::trace!(index = expected, id = %event.id, kind = event.kind.name(), "Appended event");
        Ok(expected)
    }

    /// Read the event at `index`; negative indices count from the end.
    ///
    /// # Errors
    ///
    /// [`EventLogError::IndexOutOfRange`] if `index` is outside `[-len, len)`,
    /// [`EventLogError::FileMissing`] if its file is gone.
    pub fn get(&self, index: isize) -> Result<Event, EventLogError> {
        let position = self.normalize(index)?;
        self.read_at(position)
    }

    /// Id of the event at `index`; negative indices count from the end.
    ///
    /// # Errors
    ///
    /// Same as [`EventLog::get`] when the id has to be read from disk.
    pub fn get_id(&self, index: isize) -> Result<EventId, EventLogError> {
        let position = self.normalize(index)?;
        if let Some(id) = self.index.read().idx_to_id.get(&position) {
            return Ok(id.clone());
        }
        Ok(self.read_at(position)?.id)
    }

    /// Index of the event with the given id
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::UnknownEventId`] if the id is not in the log.
    pub fn get_index(&self, id: &EventId) -> Result<usize, EventLogError> {
        self.index
            .read()
            .id_to_idx
            .get(id)
            .copied()
            .ok_or_else(|| EventLogError::UnknownEventId(id.clone()))
    }

    /// Whether an event with this id is in the log
    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.index.read().id_to_idx.contains_key(id)
    }

    /// Lazily iterate events in order, one file read per step.
    ///
    /// Missing or corrupt files are skipped with a warning.
    #[must_use]
    pub fn iter(&self) -> EventIter<'_> {
        EventIter {
            log: self,
            next: 0,
            end: self.len(),
        }
    }

    /// Collect every readable event
    #[must_use]
    pub fn to_vec(&self) -> Vec<Event> {
        self.iter().collect()
    }

    /// Collect the last `n` readable events
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<Event> {
        let end = self.len();
        EventIter {
            log: self,
            next: end.saturating_sub(n),
            end,
        }
        .collect()
    }

    /// Delete every event file and reset to empty
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be deleted.
    pub fn clear(&self) -> Result<(), EventLogError> {
        let mut index = self.index.write();
        for position in 0..index.len {
            if let Some(path) = index.paths.get(&position) {
                match self.store.delete(path) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        *index = LogIndex::default();
        tracing::debug!(dir = %self.dir, "Cleared event log");
        Ok(())
    }

    /// Rename legacy `event-NNNNN.json` files to the current format.
    ///
    /// The new file is written before the old one is deleted. Returns how
    /// many files were migrated.
    ///
    /// # Errors
    ///
    /// Returns an error if a legacy file cannot be read or rewritten.
    pub fn migrate_legacy_files(&self) -> Result<usize, EventLogError> {
        let mut index = self.index.write();
        let mut migrated = 0;

        for position in 0..index.len {
            let Some(old_path) = index.paths.get(&position).cloned() else {
                continue;
            };
            let is_legacy = old_path
                .rsplit('/')
                .next()
                .and_then(EventFileName::parse)
                .is_some_and(|name| name.is_legacy());
            if !is_legacy {
                continue;
            }

            let text = self.store.read(&old_path)?;
            let event: Event = serde_json::from_str(&text)?;
            if !event.id.is_file_safe() {
                tracing::warn!(index = position, id = %event.id, "Keeping legacy name for unsafe event id");
                continue;
            }
            let new_path = join(&self.dir, &event_file_name(position, &event.id));
            self.store.write(&new_path, text.as_bytes())?;
            self.store.delete(&old_path)?;

            index.map(position, event.id);
            index.paths.insert(position, new_path);
            migrated += 1;
        }

        if migrated > 0 {
            tracing::info!(dir = %self.dir, migrated, "Migrated legacy event files");
        }
        Ok(migrated)
    }

    fn normalize(&self, index: isize) -> Result<usize, EventLogError> {
        let len = self.len();
        let resolved = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            Some(index.unsigned_abs()).filter(|&i| i < len)
        };
        resolved.ok_or(EventLogError::IndexOutOfRange { index, len })
    }

    fn read_at(&self, position: usize) -> Result<Event, EventLogError> {
        let path = self.index.read().paths.get(&position).cloned();
        let Some(path) = path else {
            return Err(EventLogError::FileMissing {
                index: position,
                path: self.dir.clone(),
            });
        };

        let text = self.store.read(&path).map_err(|e| match e {
            FileStoreError::NotFound(path) => EventLogError::FileMissing {
                index: position,
                path,
            },
            other => other.into(),
        })?;
        let event: Event = serde_json::from_str(&text)?;

        let mut index = self.index.write();
        if !index.idx_to_id.contains_key(&position) {
            index.map(position, event.id.clone());
        }
        Ok(event)
    }
}

/// Lazy in-order iterator over an [`EventLog`]
#[derive(Debug)]
pub struct EventIter<'a> {
    log: &'a EventLog,
    next: usize,
    end: usize,
}

impl Iterator for EventIter<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        while self.next < self.end {
            let position = self.next;
            self.next += 1;
            match self.log.read_at(position) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!(index = position, error = %e, "Skipping unreadable event");
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.next))
    }
}

fn read_event_id(store: &dyn FileStore, path: &str) -> Option<EventId> {
    let parsed = store
        .read(path)
        .map_err(EventLogError::from)
        .and_then(|text| Ok(serde_json::from_str::<Event>(&text)?));
    match parsed {
        Ok(event) => Some(event.id),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Could not recover id of legacy event file");
            None
        }
    }
}
