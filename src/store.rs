//! sled backed [`IncidentRepository`]
//!
//! Everything lives in one tree under prefixed keys:
//!
//! ```text
//! inc/<incident id>                          -> Incident
//! asg/<incident id>/<assigned_at><id>        -> Assignment
//! cmt/<incident id>/<created_at><sequence>   -> Comment
//! evt/<incident id>/<occurred_at><sequence>  -> TimelineEvent
//! ```
//!
//! Timestamps are stored big endian with the sign bit flipped, so the byte
//! order of keys is the `(time, sequence)` order. Commits run in a single
//! sled transaction that re-reads the incident version first.
use crate::assignment::Assignment;
use crate::clock::TimeStamp;
use crate::config::StorageConfig;
use crate::error::RepositoryError;
use crate::incident::Incident;
use crate::repository::{
    CancelToken, Commit, Cursor, CursorKind, IncidentFilter, IncidentRepository, ORDER_KEY_LEN,
    Page,
};
use crate::timeline::{Comment, TimelineEvent};
use sled::transaction::{TransactionError, abort};
use std::ops::Bound;
use std::sync::Arc;

const INCIDENTS: &[u8] = b"inc/";
const ASSIGNMENTS: &[u8] = b"asg/";
const COMMENTS: &[u8] = b"cmt/";
const EVENTS: &[u8] = b"evt/";

pub struct SledRepository {
    db: Arc<sled::Db>,
}

impl SledRepository {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    pub fn open(config: &StorageConfig) -> Result<Self, RepositoryError> {
        let mut builder = sled::Config::new().temporary(config.temporary);
        if !config.temporary {
            builder = builder.path(&config.path);
        }
        let db = builder.open()?;
        tracing::info!(
            path = %config.path.display(),
            temporary = config.temporary,
            "opened incident store"
        );

        Ok(Self::new(Arc::new(db)))
    }

    fn get<T>(&self, key: &[u8]) -> Result<Option<T>, RepositoryError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads up to `limit` values under `prefix` that pass `keep`, starting
    /// after the key suffix held in `cursor`. Next cursors are issued as `kind`.
    fn scan<T, F>(
        &self,
        prefix: &[u8],
        kind: CursorKind,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
        keep: F,
    ) -> Result<Page<T>, RepositoryError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
        F: Fn(&T) -> bool,
    {
        let start = match cursor {
            Some(cursor) => Bound::Excluded([prefix, cursor.position()].concat()),
            None => Bound::Included(prefix.to_vec()),
        };

        let mut items = Vec::new();
        let mut last_suffix: Option<Vec<u8>> = None;
        for entry in self.db.range((start, Bound::Unbounded)) {
            cancel.check()?;
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            let item: T = minicbor::decode(&value)?;
            if !keep(&item) {
                continue;
            }
            if items.len() == limit {
                return Ok(Page {
                    items,
                    next_cursor: last_suffix.map(|suffix| Cursor::new(kind, suffix)),
                });
            }
            items.push(item);
            last_suffix = Some(key[prefix.len()..].to_vec());
        }

        Ok(Page {
            items,
            next_cursor: None,
        })
    }
}

impl IncidentRepository for SledRepository {
    fn load(&self, id: &str, cancel: &CancelToken) -> Result<Option<Incident>, RepositoryError> {
        cancel.check()?;
        self.get(&incident_key(id))
    }

    fn commit(&self, commit: Commit, cancel: &CancelToken) -> Result<u64, RepositoryError> {
        cancel.check()?;
        let Commit {
            expected_version,
            mut incident,
            events,
            assignments,
            comments,
        } = commit;
        let id = incident.id().to_string();
        let new_version = expected_version + 1;
        incident.version = new_version;

        // encode outside the transaction, the closure may run more than once
        let incident_key = incident_key(&id);
        let incident_bytes = minicbor::to_vec(&incident)?;
        let mut rows = Vec::with_capacity(events.len() + assignments.len() + comments.len());
        for event in &events {
            let order = order_bytes(event.occurred_at(), event.sequence());
            let key = child_key(EVENTS, &id, &order);
            rows.push((key, minicbor::to_vec(event)?));
        }
        for comment in &comments {
            let order = order_bytes(comment.created_at(), comment.sequence());
            let key = child_key(COMMENTS, &id, &order);
            rows.push((key, minicbor::to_vec(comment)?));
        }
        for assignment in &assignments {
            rows.push((assignment_key(assignment), minicbor::to_vec(assignment)?));
        }

        // last chance to back out before anything becomes visible
        cancel.check()?;
        let result = self.db.transaction(|tx| {
            let actual = match tx.get(&incident_key)? {
                Some(bytes) => match minicbor::decode::<Incident>(&bytes) {
                    Ok(stored) => stored.version,
                    Err(e) => return abort(RepositoryError::from(e)),
                },
                None => 0,
            };
            if actual != expected_version {
                return abort(RepositoryError::Conflict {
                    id: id.clone(),
                    expected: expected_version,
                    actual,
                });
            }

            tx.insert(incident_key.as_slice(), incident_bytes.as_slice())?;
            for (key, value) in &rows {
                tx.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                tracing::debug!(
                    incident = %id,
                    version = new_version,
                    rows = rows.len(),
                    "committed incident"
                );
                Ok(new_version)
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    fn query(
        &self,
        filter: &IncidentFilter,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<Incident>, RepositoryError> {
        self.scan(
            INCIDENTS,
            CursorKind::Incidents,
            cursor,
            limit,
            cancel,
            |incident: &Incident| filter.matches(incident),
        )
    }

    fn timeline(
        &self,
        incident_id: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<TimelineEvent>, RepositoryError> {
        let prefix = child_key(EVENTS, incident_id, &[]);
        self.scan(
            &prefix,
            CursorKind::Timeline,
            cursor,
            limit,
            cancel,
            |_: &TimelineEvent| true,
        )
    }

    fn comments(
        &self,
        incident_id: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<Comment>, RepositoryError> {
        let prefix = child_key(COMMENTS, incident_id, &[]);
        self.scan(
            &prefix,
            CursorKind::Comments,
            cursor,
            limit,
            cancel,
            |_: &Comment| true,
        )
    }

    fn assignments(
        &self,
        incident_id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<Assignment>, RepositoryError> {
        let prefix = child_key(ASSIGNMENTS, incident_id, &[]);
        let mut assignments = Vec::new();
        for entry in self.db.scan_prefix(&prefix) {
            cancel.check()?;
            let (_, value) = entry?;
            assignments.push(minicbor::decode(&value)?);
        }
        Ok(assignments)
    }
}

fn incident_key(id: &str) -> Vec<u8> {
    [INCIDENTS, id.as_bytes()].concat()
}

fn child_key(kind: &[u8], incident_id: &str, suffix: &[u8]) -> Vec<u8> {
    [kind, incident_id.as_bytes(), b"/", suffix].concat()
}

fn assignment_key(assignment: &Assignment) -> Vec<u8> {
    let mut suffix = time_bytes(assignment.assigned_at()).to_vec();
    suffix.extend_from_slice(assignment.id().as_bytes());
    child_key(ASSIGNMENTS, assignment.incident_id(), &suffix)
}

fn time_bytes(at: TimeStamp) -> [u8; 8] {
    ((at.nanos() as u64) ^ (1 << 63)).to_be_bytes()
}

fn order_bytes(at: TimeStamp, sequence: u64) -> [u8; ORDER_KEY_LEN] {
    let mut bytes = [0u8; ORDER_KEY_LEN];
    bytes[..8].copy_from_slice(&time_bytes(at));
    bytes[8..].copy_from_slice(&sequence.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_bytes_sort_like_timestamps() {
        let before_epoch = TimeStamp::new_with(1960, 1, 1, 0, 0, 0);
        let epoch = TimeStamp::from_nanos(0);
        let later = TimeStamp::new_with(2024, 6, 15, 10, 0, 0);

        assert!(order_bytes(before_epoch, 9) < order_bytes(epoch, 1));
        assert!(order_bytes(epoch, 1) < order_bytes(later, 0));
        assert!(order_bytes(later, 1) < order_bytes(later, 2));
    }

    #[test]
    fn child_prefixes_do_not_overlap() {
        let a = child_key(EVENTS, "inc_1", &[]);
        let b = child_key(EVENTS, "inc_10", &[]);

        assert!(!b.starts_with(&a));
    }
}
