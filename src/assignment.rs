//! Responder assignments of an incident
use crate::clock::TimeStamp;
use crate::error::IncidentError;
use crate::incident::{Incident, require_actor};
use crate::timeline::{self, EventPayload, TimelineEvent};
use crate::utils::{ASSIGNMENT_PREFIX, new_id};

/// A time-bounded responsibility record. Open while `unassigned_at` is `None`.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize, Clone)]
pub struct Assignment {
    #[n(0)]
    id: String,
    #[n(1)]
    incident_id: String,
    #[n(2)]
    assignee_id: String,
    #[n(3)]
    assigned_at: TimeStamp,
    #[n(4)]
    unassigned_at: Option<TimeStamp>,
}

impl Assignment {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn incident_id(&self) -> &str {
        &self.incident_id
    }
    pub fn assignee_id(&self) -> &str {
        &self.assignee_id
    }
    pub fn assigned_at(&self) -> TimeStamp {
        self.assigned_at
    }
    pub fn unassigned_at(&self) -> Option<TimeStamp> {
        self.unassigned_at
    }
    pub fn is_active(&self) -> bool {
        self.unassigned_at.is_none()
    }
}

/// Rows and events produced by a ledger operation, committed together.
#[derive(Debug, Clone)]
pub struct LedgerChange {
    pub incident: Incident,
    pub upserts: Vec<Assignment>, // closed and/or opened rows
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone)]
pub enum AssignOutcome {
    /// The assignee was already active. Nothing to write.
    Unchanged(Assignment),
    Changed {
        assignment: Assignment,
        change: LedgerChange,
    },
}

/// History of assignments of one incident, oldest first.
#[derive(Debug, Clone)]
pub struct AssignmentLedger {
    incident_id: String,
    history: Vec<Assignment>,
}

impl AssignmentLedger {
    pub fn new(incident_id: impl Into<String>, mut history: Vec<Assignment>) -> Self {
        history.sort_by(|a, b| (a.assigned_at, &a.id).cmp(&(b.assigned_at, &b.id)));
        Self {
            incident_id: incident_id.into(),
            history,
        }
    }

    pub fn history(&self) -> &[Assignment] {
        &self.history
    }

    pub fn active(&self) -> Option<&Assignment> {
        self.history.iter().rev().find(|a| a.is_active())
    }

    /// Hands the incident to `assignee_id`, closing any other active assignment.
    pub fn assign(
        &self,
        incident: &Incident,
        assignee_id: &str,
        actor_id: &str,
        now: TimeStamp,
    ) -> Result<AssignOutcome, IncidentError> {
        self.check_incident(incident)?;
        let assignee_id = assignee_id.trim();
        if assignee_id.is_empty() {
            return Err(IncidentError::InvalidInput("assignee id must not be empty".into()));
        }
        require_actor(actor_id)?;

        if let Some(active) = self.active() {
            if active.assignee_id == assignee_id {
                return Ok(AssignOutcome::Unchanged(active.clone()));
            }
        }

        let mut next = incident.clone();
        let mut upserts = Vec::with_capacity(2);
        let mut events = Vec::with_capacity(2);

        if let Some(active) = self.active() {
            let (closed, event) = close(&mut next, active, actor_id, now)?;
            upserts.push(closed);
            events.push(event);
        }

        let assignment = Assignment {
            id: new_id(ASSIGNMENT_PREFIX),
            incident_id: self.incident_id.clone(),
            assignee_id: assignee_id.to_string(),
            assigned_at: now,
            unassigned_at: None,
        };
        events.push(timeline::append(
            &mut next,
            actor_id,
            now,
            EventPayload::Assigned {
                assignment_id: assignment.id.clone(),
                assignee_id: assignment.assignee_id.clone(),
            },
        )?);
        upserts.push(assignment.clone());
        next.current_assignee_id = Some(assignment.assignee_id.clone());
        next.updated_at = now;

        Ok(AssignOutcome::Changed {
            assignment,
            change: LedgerChange {
                incident: next,
                upserts,
                events,
            },
        })
    }

    /// Closes the active assignment.
    pub fn unassign(
        &self,
        incident: &Incident,
        actor_id: &str,
        now: TimeStamp,
    ) -> Result<(Assignment, LedgerChange), IncidentError> {
        self.check_incident(incident)?;
        require_actor(actor_id)?;
        let active = self
            .active()
            .ok_or_else(|| IncidentError::NoActiveAssignment(self.incident_id.clone()))?;

        let mut next = incident.clone();
        let (closed, event) = close(&mut next, active, actor_id, now)?;
        next.current_assignee_id = None;
        next.updated_at = now;

        Ok((
            closed.clone(),
            LedgerChange {
                incident: next,
                upserts: vec![closed],
                events: vec![event],
            },
        ))
    }

    fn check_incident(&self, incident: &Incident) -> Result<(), IncidentError> {
        if incident.id() != self.incident_id {
            return Err(IncidentError::InvalidInput(format!(
                "ledger of {} cannot change incident {}",
                self.incident_id,
                incident.id()
            )));
        }
        if incident.is_closed() {
            return Err(IncidentError::IncidentClosed(self.incident_id.clone()));
        }
        Ok(())
    }
}

fn close(
    incident: &mut Incident,
    active: &Assignment,
    actor_id: &str,
    now: TimeStamp,
) -> Result<(Assignment, TimelineEvent), IncidentError> {
    let mut closed = active.clone();
    closed.unassigned_at = Some(now);
    let event = timeline::append(
        incident,
        actor_id,
        now,
        EventPayload::Unassigned {
            assignment_id: closed.id.clone(),
            assignee_id: closed.assignee_id.clone(),
        },
    )?;
    Ok((closed, event))
}
