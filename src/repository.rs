//! Persistence capability consumed by the incident service
//!
//! A repository stores the incident aggregate together with its
//! assignments, comments and timeline. Every write goes through
//! [`IncidentRepository::commit`], which must apply the whole [`Commit`]
//! atomically and only if the stored incident is still at
//! `expected_version`. Reads return committed state only.
use crate::assignment::Assignment;
use crate::error::{IncidentError, RepositoryError};
use crate::incident::{Incident, IncidentStatus, Severity};
use crate::timeline::{Comment, TimelineEvent};
use crate::utils::{INCIDENT_PREFIX, is_valid_id};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Caller supplied cancellation: an explicit flag and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires on its own.
    pub fn none() -> Self {
        Self::default()
    }
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|at| Instant::now() >= at)
    }
    pub fn check(&self) -> Result<(), RepositoryError> {
        if self.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        Ok(())
    }
    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// The listing a cursor belongs to. Written as the first cursor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Incidents,
    Timeline,
    Comments,
}

impl CursorKind {
    fn tag(self) -> u8 {
        match self {
            CursorKind::Incidents => b'i',
            CursorKind::Timeline => b't',
            CursorKind::Comments => b'c',
        }
    }
}

/// Opaque position in an ordered listing. Rendered as lowercase hex of the
/// listing tag followed by the position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    kind: CursorKind,
    position: Vec<u8>,
}

impl Cursor {
    pub fn new(kind: CursorKind, position: Vec<u8>) -> Self {
        Self { kind, position }
    }
    pub fn kind(&self) -> CursorKind {
        self.kind
    }
    pub fn position(&self) -> &[u8] {
        &self.position
    }
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(self.position.len() + 1);
        bytes.push(self.kind.tag());
        bytes.extend_from_slice(&self.position);
        hex::encode(bytes)
    }

    /// Decodes `raw` and checks it was issued by a `kind` listing.
    pub fn parse(raw: &str, kind: CursorKind) -> Result<Self, IncidentError> {
        let invalid = |why: &str| IncidentError::InvalidInput(format!("invalid cursor: {why}"));
        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        let bytes = hex::decode(raw).map_err(|e| invalid(&e.to_string()))?;
        let Some((&tag, position)) = bytes.split_first() else {
            return Err(invalid("empty"));
        };
        if tag != kind.tag() {
            return Err(invalid("issued by another listing"));
        }

        let well_formed = match kind {
            CursorKind::Incidents => std::str::from_utf8(position)
                .is_ok_and(|id| is_valid_id(INCIDENT_PREFIX, id)),
            CursorKind::Timeline | CursorKind::Comments => position.len() == ORDER_KEY_LEN,
        };
        if !well_formed {
            return Err(invalid("malformed position"));
        }

        Ok(Self::new(kind, position.to_vec()))
    }
}

/// Length of a `(time, sequence)` position in the timeline and comment
/// listings.
pub const ORDER_KEY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(serialize_with = "serialize_cursor")]
    pub next_cursor: Option<Cursor>,
}

fn serialize_cursor<S: serde::Serializer>(
    cursor: &Option<Cursor>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match cursor {
        Some(cursor) => serializer.serialize_some(&cursor.encode()),
        None => serializer.serialize_none(),
    }
}

/// Listing filter. Unset fields match everything. Soft-deleted incidents
/// never match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub severity: Option<Severity>,
    pub assignee_id: Option<String>,
}

impl IncidentFilter {
    pub fn matches(&self, incident: &Incident) -> bool {
        !incident.is_deleted()
            && self.status.is_none_or(|s| incident.status() == s)
            && self.severity.is_none_or(|s| incident.severity() == s)
            && self
                .assignee_id
                .as_deref()
                .is_none_or(|assignee| incident.current_assignee_id() == Some(assignee))
    }
}

/// One atomic write of an incident and its dependent rows.
#[derive(Debug, Clone)]
pub struct Commit {
    /// 0 when the incident is being created.
    pub expected_version: u64,
    pub incident: Incident,
    pub events: Vec<TimelineEvent>,
    pub assignments: Vec<Assignment>, // inserted or replaced by id
    pub comments: Vec<Comment>,
}

impl Commit {
    pub fn new(expected_version: u64, incident: Incident) -> Self {
        Self {
            expected_version,
            incident,
            events: vec![],
            assignments: vec![],
            comments: vec![],
        }
    }
    pub fn with_events(mut self, events: impl IntoIterator<Item = TimelineEvent>) -> Self {
        self.events.extend(events);
        self
    }
    pub fn with_assignments(mut self, assignments: impl IntoIterator<Item = Assignment>) -> Self {
        self.assignments.extend(assignments);
        self
    }
    pub fn with_comment(mut self, comment: Comment) -> Self {
        self.comments.push(comment);
        self
    }
}

pub trait IncidentRepository: Send + Sync {
    /// Latest committed incident, including soft-deleted ones.
    fn load(&self, id: &str, cancel: &CancelToken) -> Result<Option<Incident>, RepositoryError>;

    /// Applies `commit` atomically if the stored version equals
    /// `commit.expected_version`. Returns the new version.
    fn commit(&self, commit: Commit, cancel: &CancelToken) -> Result<u64, RepositoryError>;

    fn query(
        &self,
        filter: &IncidentFilter,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<Incident>, RepositoryError>;

    /// Events ordered by `(occurred_at, sequence)`, starting after `cursor`.
    fn timeline(
        &self,
        incident_id: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<TimelineEvent>, RepositoryError>;

    /// Comments in timeline order, starting after `cursor`.
    fn comments(
        &self,
        incident_id: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<Comment>, RepositoryError>;

    /// Every assignment of the incident, oldest first.
    fn assignments(
        &self,
        incident_id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<Assignment>, RepositoryError>;
}

impl<R: IncidentRepository + ?Sized> IncidentRepository for Arc<R> {
    fn load(&self, id: &str, cancel: &CancelToken) -> Result<Option<Incident>, RepositoryError> {
        (**self).load(id, cancel)
    }
    fn commit(&self, commit: Commit, cancel: &CancelToken) -> Result<u64, RepositoryError> {
        (**self).commit(commit, cancel)
    }
    fn query(
        &self,
        filter: &IncidentFilter,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<Incident>, RepositoryError> {
        (**self).query(filter, cursor, limit, cancel)
    }
    fn timeline(
        &self,
        incident_id: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<TimelineEvent>, RepositoryError> {
        (**self).timeline(incident_id, cursor, limit, cancel)
    }
    fn comments(
        &self,
        incident_id: &str,
        cursor: Option<&Cursor>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Page<Comment>, RepositoryError> {
        (**self).comments(incident_id, cursor, limit, cancel)
    }
    fn assignments(
        &self,
        incident_id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<Assignment>, RepositoryError> {
        (**self).assignments(incident_id, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_through_its_own_listing() {
        let cursor = Cursor::new(CursorKind::Timeline, vec![7; ORDER_KEY_LEN]);
        let encoded = cursor.encode();
        assert!(encoded.starts_with("74"));
        let parsed = Cursor::parse(&encoded, CursorKind::Timeline).unwrap();
        assert_eq!(parsed, cursor);
        assert_eq!(parsed.kind(), CursorKind::Timeline);

        let id = "inc_0123456789abcdef0123456789abcdef";
        let cursor = Cursor::new(CursorKind::Incidents, id.as_bytes().to_vec());
        assert_eq!(
            Cursor::parse(&cursor.encode(), CursorKind::Incidents).unwrap(),
            cursor
        );
    }

    #[test]
    fn cursor_rejects_garbage_and_foreign_listings() {
        let timeline = Cursor::new(CursorKind::Timeline, vec![0; ORDER_KEY_LEN]).encode();
        let short = Cursor::new(CursorKind::Comments, vec![0; 3]).encode();
        let bad_id = Cursor::new(CursorKind::Incidents, b"inc_zz".to_vec()).encode();

        for (raw, kind) in [
            ("", CursorKind::Incidents),
            ("zz", CursorKind::Incidents),
            ("abc", CursorKind::Incidents),
            ("00", CursorKind::Incidents),
            ("ff", CursorKind::Timeline),
            (timeline.as_str(), CursorKind::Incidents),
            (timeline.as_str(), CursorKind::Comments),
            (short.as_str(), CursorKind::Comments),
            (bad_id.as_str(), CursorKind::Incidents),
        ] {
            let parsed = Cursor::parse(raw, kind);
            assert!(
                matches!(parsed, Err(IncidentError::InvalidInput(_))),
                "{raw:?} accepted as {kind:?}"
            );
        }
    }

    #[test]
    fn cancel_token_fires_on_flag_and_deadline() {
        let token = CancelToken::none();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(matches!(token.check(), Err(RepositoryError::Cancelled)));

        let expired = CancelToken::with_timeout(Duration::ZERO);
        assert!(expired.is_cancelled());
        assert_eq!(expired.remaining(), Some(Duration::ZERO));
    }
}
