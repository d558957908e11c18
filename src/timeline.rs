//! Append-only comment and event log of an incident
//!
//! Every state-mutating operation appends exactly one [`TimelineEvent`]
//! (assignment hand-overs append two, one per side). Events are chained:
//! each digest covers the previous digest and the event body, so a
//! timeline read back from storage can be checked with [`verify_chain`].
//! Ordering is `(occurred_at, sequence)`; the sequence is issued by the
//! incident and never reused.
use crate::clock::TimeStamp;
use crate::error::IncidentError;
use crate::incident::{Incident, IncidentStatus, Severity, require_actor};
use crate::utils::{COMMENT_PREFIX, EVENT_PREFIX, new_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged,
    Assigned,
    Unassigned,
    CommentAdded,
    /// Reserved. Resolving is recorded as a `StatusChanged` into
    /// `resolved`, so no event carries this kind.
    Resolved,
    Updated,
    Deleted,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    #[n(0)]
    Created {
        #[n(0)]
        title: String,
        #[n(1)]
        severity: Severity,
    },
    #[n(1)]
    StatusChanged {
        #[n(0)]
        from: IncidentStatus,
        #[n(1)]
        to: IncidentStatus,
    },
    #[n(3)]
    Assigned {
        #[n(0)]
        assignment_id: String,
        #[n(1)]
        assignee_id: String,
    },
    #[n(4)]
    Unassigned {
        #[n(0)]
        assignment_id: String,
        #[n(1)]
        assignee_id: String,
    },
    #[n(5)]
    CommentAdded {
        #[n(0)]
        comment_id: String,
    },
    #[n(6)]
    Updated {
        #[n(0)]
        title: Option<String>,
        #[n(1)]
        description: Option<String>,
        #[n(2)]
        severity: Option<Severity>,
    },
    #[n(7)]
    Deleted,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Created { .. } => EventKind::Created,
            EventPayload::StatusChanged { .. } => EventKind::StatusChanged,
            EventPayload::Assigned { .. } => EventKind::Assigned,
            EventPayload::Unassigned { .. } => EventKind::Unassigned,
            EventPayload::CommentAdded { .. } => EventKind::CommentAdded,
            EventPayload::Updated { .. } => EventKind::Updated,
            EventPayload::Deleted => EventKind::Deleted,
        }
    }

    /// The status this event leaves the incident in, if it changes it.
    pub fn status_after(&self) -> Option<IncidentStatus> {
        match self {
            EventPayload::Created { .. } => Some(IncidentStatus::Open),
            EventPayload::StatusChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize, Clone)]
pub struct TimelineEvent {
    #[n(0)]
    id: String,
    #[n(1)]
    incident_id: String,
    #[n(2)]
    sequence: u64,
    #[n(3)]
    occurred_at: TimeStamp,
    #[n(4)]
    actor_id: String,
    #[n(5)]
    payload: EventPayload,
    #[n(6)]
    prev_digest: String,
    #[n(7)]
    digest: String,
}

impl TimelineEvent {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn incident_id(&self) -> &str {
        &self.incident_id
    }
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
    pub fn occurred_at(&self) -> TimeStamp {
        self.occurred_at
    }
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }
    pub fn prev_digest(&self) -> &str {
        &self.prev_digest
    }
    pub fn digest(&self) -> &str {
        &self.digest
    }
    /// Total ordering key within one incident.
    pub fn order_key(&self) -> (TimeStamp, u64) {
        (self.occurred_at, self.sequence)
    }

    fn compute_digest(&self) -> Result<String, IncidentError> {
        let body = minicbor::to_vec((
            &self.prev_digest,
            &self.id,
            &self.incident_id,
            self.sequence,
            self.occurred_at.nanos(),
            &self.actor_id,
            &self.payload,
        ))
        .map_err(|e| IncidentError::Internal(format!("event is not encodable: {e}")))?;

        Ok(sha256::digest(&body))
    }
}

/// Immutable note attached to an incident.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize, Clone)]
pub struct Comment {
    #[n(0)]
    id: String,
    #[n(1)]
    incident_id: String,
    #[n(2)]
    author_id: String,
    #[n(3)]
    body: String,
    #[n(4)]
    created_at: TimeStamp,
    #[n(5)]
    sequence: u64, // sequence of the matching CommentAdded event
}

impl Comment {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn incident_id(&self) -> &str {
        &self.incident_id
    }
    pub fn author_id(&self) -> &str {
        &self.author_id
    }
    pub fn body(&self) -> &str {
        &self.body
    }
    pub fn created_at(&self) -> TimeStamp {
        self.created_at
    }
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Issues the next event for `incident` and moves its sequence and chain head forward.
pub(crate) fn append(
    incident: &mut Incident,
    actor_id: &str,
    at: TimeStamp,
    payload: EventPayload,
) -> Result<TimelineEvent, IncidentError> {
    let mut event = TimelineEvent {
        id: new_id(EVENT_PREFIX),
        incident_id: incident.id.clone(),
        sequence: incident.last_sequence + 1,
        occurred_at: at,
        actor_id: actor_id.to_string(),
        payload,
        prev_digest: incident.timeline_head.clone(),
        digest: String::new(),
    };
    event.digest = event.compute_digest()?;

    incident.last_sequence = event.sequence;
    incident.timeline_head = event.digest.clone();

    Ok(event)
}

/// Appends a comment and its `CommentAdded` event, both stamped with `now`.
pub fn add_comment(
    incident: &Incident,
    author_id: &str,
    body: &str,
    now: TimeStamp,
) -> Result<(Incident, Comment, TimelineEvent), IncidentError> {
    if body.trim().is_empty() {
        return Err(IncidentError::InvalidInput("comment body must not be empty".into()));
    }
    require_actor(author_id)?;

    let mut next = incident.clone();
    let comment_id = new_id(COMMENT_PREFIX);
    let event = append(
        &mut next,
        author_id,
        now,
        EventPayload::CommentAdded {
            comment_id: comment_id.clone(),
        },
    )?;
    next.updated_at = now;

    let comment = Comment {
        id: comment_id,
        incident_id: incident.id.clone(),
        author_id: author_id.to_string(),
        body: body.to_string(),
        created_at: now,
        sequence: event.sequence,
    };

    Ok((next, comment, event))
}

/// State rebuilt from nothing but the event log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Replayed {
    pub status: Option<IncidentStatus>,
    pub resolved: bool,
    pub assignee_id: Option<String>,
    pub deleted: bool,
    pub last_sequence: u64,
}

/// Folds an ordered timeline into the incident state it describes.
pub fn replay<'a>(events: impl IntoIterator<Item = &'a TimelineEvent>) -> Replayed {
    let mut state = Replayed::default();
    for event in events {
        if let Some(status) = event.payload.status_after() {
            state.status = Some(status);
            state.resolved = status.is_resolved();
        }
        match &event.payload {
            EventPayload::Assigned { assignee_id, .. } => {
                state.assignee_id = Some(assignee_id.clone())
            }
            EventPayload::Unassigned { .. } => state.assignee_id = None,
            EventPayload::Deleted => state.deleted = true,
            _ => {}
        }
        state.last_sequence = event.sequence;
    }
    state
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("Event {0} is out of order")]
    OutOfOrder(String),
    #[error("Event {0} does not link to its predecessor")]
    BrokenLink(String),
    #[error("Event {0} has been altered")]
    Tampered(String),
}

/// Checks ordering and digests of a complete timeline, oldest first.
pub fn verify_chain(events: &[TimelineEvent]) -> Result<(), ChainError> {
    let mut prev: Option<&TimelineEvent> = None;
    for event in events {
        let expected_link = prev.map(|p| p.digest.as_str()).unwrap_or("");
        if let Some(p) = prev {
            if event.order_key() <= p.order_key() {
                return Err(ChainError::OutOfOrder(event.id.clone()));
            }
        }
        if event.prev_digest != expected_link {
            return Err(ChainError::BrokenLink(event.id.clone()));
        }
        match event.compute_digest() {
            Ok(digest) if digest == event.digest => {}
            _ => return Err(ChainError::Tampered(event.id.clone())),
        }
        prev = Some(event);
    }
    Ok(())
}
