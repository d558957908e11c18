//! Service layer API for incident lifecycle operations
//!
//! Every mutating operation follows the same loop: load the incident,
//! run the state machine / ledger / timeline logic against that snapshot,
//! then commit the result with the version that was read. A version
//! conflict means someone else committed first, so the loop starts over
//! from a fresh load, up to `retry.max_attempts` times.
use crate::assignment::{AssignOutcome, Assignment, AssignmentLedger};
use crate::clock::{Clock, SystemClock, TimeStamp};
use crate::config::ServiceConfig;
use crate::error::{IncidentError, RepositoryError};
use crate::incident::{self, Incident, IncidentPatch, IncidentStatus, NewIncident};
use crate::lifecycle;
use crate::repository::{
    CancelToken, Commit, Cursor, CursorKind, IncidentFilter, IncidentRepository, Page,
};
use crate::timeline::{self, Comment, TimelineEvent};
use crate::utils::{INCIDENT_PREFIX, is_valid_id};
use rand::Rng;
use std::time::Duration;

/// Result of a write: the incident as committed plus the sub-entity the
/// operation produced.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Committed<T> {
    pub incident: Incident,
    pub value: T,
}

enum Step<T> {
    Write(Commit, T),
    // nothing to change; the incident is returned as loaded
    Skip(T),
}

pub struct IncidentService<R, C = SystemClock> {
    repo: R,
    clock: C,
    config: ServiceConfig,
}

impl<R: IncidentRepository> IncidentService<R, SystemClock> {
    pub fn new(repo: R, config: ServiceConfig) -> Self {
        Self::with_clock(repo, SystemClock::new(), config)
    }
}

impl<R: IncidentRepository, C: Clock> IncidentService<R, C> {
    pub fn with_clock(repo: R, clock: C, config: ServiceConfig) -> Self {
        Self {
            repo,
            clock,
            config,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Open a new incident
    pub fn create_incident(
        &self,
        draft: &NewIncident,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Incident, IncidentError> {
        let (mut incident, event) = draft.build(actor_id, self.clock.now())?;
        let id = incident.id().to_string();

        let commit = Commit::new(0, incident.clone()).with_events([event]);
        let version = self.repo.commit(commit, cancel)?;
        incident.version = version;
        tracing::info!(incident = %id, severity = incident.severity().as_str(), "incident created");

        Ok(incident)
    }

    pub fn get_incident(&self, id: &str, cancel: &CancelToken) -> Result<Incident, IncidentError> {
        self.load_live(id, cancel)
    }

    pub fn list_incidents(
        &self,
        filter: &IncidentFilter,
        cursor: Option<&str>,
        limit: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Page<Incident>, IncidentError> {
        let cursor = cursor
            .map(|raw| Cursor::parse(raw, CursorKind::Incidents))
            .transpose()?;
        let limit = self.config.pages.clamp(limit);

        Ok(self.repo.query(filter, cursor.as_ref(), limit, cancel)?)
    }

    /// Edit title, description or severity of an incident that is not closed
    pub fn update_incident(
        &self,
        id: &str,
        patch: &IncidentPatch,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Incident, IncidentError> {
        let (incident, ()) = self.mutate("update", id, cancel, |current, now| {
            Ok(match incident::apply_patch(current, patch, actor_id, now)? {
                Some((next, event)) => Step::Write(
                    Commit::new(current.version(), next).with_events([event]),
                    (),
                ),
                None => Step::Skip(()),
            })
        })?;
        Ok(incident)
    }

    /// Move an incident along the state machine
    pub fn transition_incident(
        &self,
        id: &str,
        target: IncidentStatus,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Incident, IncidentError> {
        let (incident, ()) = self.mutate("transition", id, cancel, |current, now| {
            let (next, event) = lifecycle::transition(current, target, actor_id, now)?;
            Ok(Step::Write(
                Commit::new(current.version(), next).with_events([event]),
                (),
            ))
        })?;
        Ok(incident)
    }

    pub fn resolve_incident(
        &self,
        id: &str,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Incident, IncidentError> {
        self.transition_incident(id, IncidentStatus::Resolved, actor_id, cancel)
    }

    /// Soft delete. The incident disappears from every read afterwards.
    pub fn delete_incident(
        &self,
        id: &str,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Incident, IncidentError> {
        let (incident, ()) = self.mutate("delete", id, cancel, |current, now| {
            let (next, event) = incident::soft_delete(current, actor_id, now)?;
            Ok(Step::Write(
                Commit::new(current.version(), next).with_events([event]),
                (),
            ))
        })?;
        Ok(incident)
    }

    /// Hand the incident to `assignee_id`. Re-assigning the active assignee
    /// writes nothing and keeps the version.
    pub fn assign_incident(
        &self,
        id: &str,
        assignee_id: &str,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Committed<Assignment>, IncidentError> {
        let (incident, assignment) = self.mutate("assign", id, cancel, |current, now| {
            let ledger = AssignmentLedger::new(current.id(), self.repo.assignments(id, cancel)?);
            Ok(match ledger.assign(current, assignee_id, actor_id, now)? {
                AssignOutcome::Unchanged(active) => Step::Skip(active),
                AssignOutcome::Changed { assignment, change } => Step::Write(
                    Commit::new(current.version(), change.incident)
                        .with_events(change.events)
                        .with_assignments(change.upserts),
                    assignment,
                ),
            })
        })?;
        Ok(Committed {
            incident,
            value: assignment,
        })
    }

    pub fn unassign_incident(
        &self,
        id: &str,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Committed<Assignment>, IncidentError> {
        let (incident, closed) = self.mutate("unassign", id, cancel, |current, now| {
            let ledger = AssignmentLedger::new(current.id(), self.repo.assignments(id, cancel)?);
            let (closed, change) = ledger.unassign(current, actor_id, now)?;
            Ok(Step::Write(
                Commit::new(current.version(), change.incident)
                    .with_events(change.events)
                    .with_assignments(change.upserts),
                closed,
            ))
        })?;
        Ok(Committed {
            incident,
            value: closed,
        })
    }

    pub fn add_comment(
        &self,
        id: &str,
        author_id: &str,
        body: &str,
        cancel: &CancelToken,
    ) -> Result<Committed<Comment>, IncidentError> {
        let (incident, comment) = self.mutate("comment", id, cancel, |current, now| {
            let (next, comment, event) = timeline::add_comment(current, author_id, body, now)?;
            Ok(Step::Write(
                Commit::new(current.version(), next)
                    .with_events([event])
                    .with_comment(comment.clone()),
                comment,
            ))
        })?;
        Ok(Committed {
            incident,
            value: comment,
        })
    }

    pub fn list_comments(
        &self,
        id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Page<Comment>, IncidentError> {
        let cursor = cursor
            .map(|raw| Cursor::parse(raw, CursorKind::Comments))
            .transpose()?;
        self.load_live(id, cancel)?;

        Ok(self
            .repo
            .comments(id, cursor.as_ref(), self.config.pages.clamp(limit), cancel)?)
    }

    pub fn list_assignments(
        &self,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<Assignment>, IncidentError> {
        self.load_live(id, cancel)?;
        let ledger = AssignmentLedger::new(id, self.repo.assignments(id, cancel)?);

        Ok(ledger.history().to_vec())
    }

    /// Events oldest first, one page at a time.
    pub fn get_timeline(
        &self,
        id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Page<TimelineEvent>, IncidentError> {
        let cursor = cursor
            .map(|raw| Cursor::parse(raw, CursorKind::Timeline))
            .transpose()?;
        self.load_live(id, cancel)?;

        Ok(self
            .repo
            .timeline(id, cursor.as_ref(), self.config.pages.clamp(limit), cancel)?)
    }

    fn load_live(&self, id: &str, cancel: &CancelToken) -> Result<Incident, IncidentError> {
        if !is_valid_id(INCIDENT_PREFIX, id) {
            return Err(IncidentError::NotFound(id.to_string()));
        }
        match self.repo.load(id, cancel)? {
            Some(incident) if !incident.is_deleted() => Ok(incident),
            _ => Err(IncidentError::NotFound(id.to_string())),
        }
    }

    /// The optimistic read-apply-commit loop shared by every write.
    fn mutate<T, F>(
        &self,
        op: &'static str,
        id: &str,
        cancel: &CancelToken,
        mut apply: F,
    ) -> Result<(Incident, T), IncidentError>
    where
        F: FnMut(&Incident, TimeStamp) -> Result<Step<T>, IncidentError>,
    {
        let _span = tracing::info_span!("incident_op", op, incident = %id).entered();
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let current = self.load_live(id, cancel)?;
            // never stamp an event before the one it follows
            let now = self.clock.now().max(current.updated_at());

            let (commit, value) = match apply(&current, now)? {
                Step::Skip(value) => {
                    tracing::debug!(version = current.version(), "nothing to commit");
                    return Ok((current, value));
                }
                Step::Write(commit, value) => (commit, value),
            };

            let mut next = commit.incident.clone();
            match self.repo.commit(commit, cancel) {
                Ok(version) => {
                    next.version = version;
                    tracing::info!(version, attempt, "incident updated");
                    return Ok((next, value));
                }
                Err(RepositoryError::Conflict {
                    expected, actual, ..
                }) => {
                    if attempt >= max_attempts {
                        tracing::warn!(attempt, expected, actual, "giving up on conflicting write");
                        return Err(IncidentError::ConflictRetryable {
                            id: id.to_string(),
                            attempts: attempt,
                        });
                    }
                    tracing::debug!(attempt, expected, actual, "version conflict, retrying");
                    self.backoff(attempt + 1, cancel)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn backoff(&self, attempt: u32, cancel: &CancelToken) -> Result<(), IncidentError> {
        let ceiling = self.config.retry.backoff_ceiling(attempt);
        if !ceiling.is_zero() {
            let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
            let mut pause = Duration::from_millis(ms);
            if let Some(remaining) = cancel.remaining() {
                pause = pause.min(remaining);
            }
            std::thread::sleep(pause);
        }
        cancel.check()?;
        Ok(())
    }
}
