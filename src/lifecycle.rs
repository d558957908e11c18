//! Incident status transitions
//!
//! ```text
//! Open         -> Acknowledged | InProgress
//! Acknowledged -> InProgress | Resolved
//! InProgress   -> Resolved
//! Resolved     -> Closed | Open (reopen)
//! Closed       -> Open (reopen)
//! ```
use crate::clock::TimeStamp;
use crate::error::IncidentError;
use crate::incident::{Incident, IncidentStatus, require_actor};
use crate::timeline::{self, EventPayload, TimelineEvent};

impl IncidentStatus {
    /// The directed edges of the state machine.
    pub fn allowed_targets(&self) -> &'static [IncidentStatus] {
        use IncidentStatus::*;
        match self {
            Open => &[Acknowledged, InProgress],
            Acknowledged => &[InProgress, Resolved],
            InProgress => &[Resolved],
            Resolved => &[Closed, Open],
            Closed => &[Open],
        }
    }

    pub fn can_transition_to(&self, target: IncidentStatus) -> bool {
        self.allowed_targets().contains(&target)
    }
}

/// Moves `incident` to `target`. The input is never touched, so a rejected
/// transition leaves no trace.
pub fn transition(
    incident: &Incident,
    target: IncidentStatus,
    actor_id: &str,
    now: TimeStamp,
) -> Result<(Incident, TimelineEvent), IncidentError> {
    let from = incident.status;
    if !from.can_transition_to(target) {
        return Err(IncidentError::InvalidTransition { from, to: target });
    }
    require_actor(actor_id)?;

    let mut next = incident.clone();
    next.status = target;
    next.updated_at = now;
    if target == IncidentStatus::Resolved {
        next.resolved_at = Some(now);
    } else if target == IncidentStatus::Open {
        // reopen
        next.resolved_at = None;
    }

    let event = timeline::append(
        &mut next,
        actor_id,
        now,
        EventPayload::StatusChanged { from, to: target },
    )?;

    Ok((next, event))
}
