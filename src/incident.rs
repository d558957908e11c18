//! The incident aggregate and its editable fields
use crate::clock::TimeStamp;
use crate::error::IncidentError;
use crate::timeline::{self, EventPayload, TimelineEvent};
use crate::utils::{INCIDENT_PREFIX, new_id};

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[n(0)]
    Low,
    #[n(1)]
    Medium,
    #[n(2)]
    High,
    #[n(3)]
    Critical,
}

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    Hash,
    PartialEq,
)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Acknowledged,
    #[n(2)]
    InProgress,
    #[n(3)]
    Resolved,
    #[n(4)]
    Closed,
}

impl IncidentStatus {
    pub const ALL: [IncidentStatus; 5] = [
        IncidentStatus::Open,
        IncidentStatus::Acknowledged,
        IncidentStatus::InProgress,
        IncidentStatus::Resolved,
        IncidentStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::InProgress => "in_progress",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }

    /// Statuses that carry a `resolved_at`.
    pub fn is_resolved(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IncidentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| IncidentError::InvalidInput(format!("unknown status '{s}'")))
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(IncidentError::InvalidInput(format!(
                "unknown severity '{other}'"
            ))),
        }
    }
}

/// A tracked operational event. Status and bookkeeping fields are only
/// reachable through the lifecycle, ledger and timeline functions.
#[derive(minicbor::Encode, minicbor::Decode, serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    #[n(0)]
    pub(crate) id: String,
    #[n(1)]
    pub(crate) title: String,
    #[n(2)]
    pub(crate) description: String,
    #[n(3)]
    pub(crate) status: IncidentStatus,
    #[n(4)]
    pub(crate) severity: Severity,
    #[n(5)]
    pub(crate) created_at: TimeStamp,
    #[n(6)]
    pub(crate) updated_at: TimeStamp,
    #[n(7)]
    pub(crate) resolved_at: Option<TimeStamp>,
    #[n(8)]
    pub(crate) current_assignee_id: Option<String>,
    #[n(9)]
    pub(crate) created_by: String,
    #[n(10)]
    pub(crate) deleted_at: Option<TimeStamp>,
    #[n(11)]
    pub(crate) version: u64, // 0 until first commit
    #[n(12)]
    pub(crate) last_sequence: u64,
    #[n(13)]
    pub(crate) timeline_head: String, // digest of the newest event
}

impl Incident {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn status(&self) -> IncidentStatus {
        self.status
    }
    pub fn severity(&self) -> Severity {
        self.severity
    }
    pub fn created_at(&self) -> TimeStamp {
        self.created_at
    }
    pub fn updated_at(&self) -> TimeStamp {
        self.updated_at
    }
    pub fn resolved_at(&self) -> Option<TimeStamp> {
        self.resolved_at
    }
    pub fn current_assignee_id(&self) -> Option<&str> {
        self.current_assignee_id.as_deref()
    }
    pub fn created_by(&self) -> &str {
        &self.created_by
    }
    pub fn deleted_at(&self) -> Option<TimeStamp> {
        self.deleted_at
    }
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
    pub fn version(&self) -> u64 {
        self.version
    }
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
    pub fn timeline_head(&self) -> &str {
        &self.timeline_head
    }
    pub fn is_closed(&self) -> bool {
        self.status == IncidentStatus::Closed
    }
}

/// Draft of a new incident, validated on [`NewIncident::build`].
#[derive(Debug, Default, Clone)]
pub struct NewIncident {
    title: Option<String>,
    description: String,
    severity: Option<Severity>,
}

impl NewIncident {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
    pub fn set_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
    /// Checks fields and produces the open incident plus its `Created` event.
    pub fn build(
        &self,
        actor_id: &str,
        now: TimeStamp,
    ) -> Result<(Incident, TimelineEvent), IncidentError> {
        let title = match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => return Err(IncidentError::InvalidInput("title must not be empty".into())),
        };
        let severity = self
            .severity
            .ok_or_else(|| IncidentError::InvalidInput("severity is not set".into()))?;
        require_actor(actor_id)?;

        let mut incident = Incident {
            id: new_id(INCIDENT_PREFIX),
            title: title.clone(),
            description: self.description.clone(),
            status: IncidentStatus::Open,
            severity,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            current_assignee_id: None,
            created_by: actor_id.to_string(),
            deleted_at: None,
            version: 0,
            last_sequence: 0,
            timeline_head: String::new(),
        };
        let event = timeline::append(
            &mut incident,
            actor_id,
            now,
            EventPayload::Created { title, severity },
        )?;

        Ok((incident, event))
    }
}

/// Edits to the editable fields. `None` leaves a field alone.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncidentPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
}

impl IncidentPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.severity.is_none()
    }
}

/// Applies `patch`, returning `None` when nothing would actually change.
pub fn apply_patch(
    incident: &Incident,
    patch: &IncidentPatch,
    actor_id: &str,
    now: TimeStamp,
) -> Result<Option<(Incident, TimelineEvent)>, IncidentError> {
    if incident.is_closed() {
        return Err(IncidentError::IncidentClosed(incident.id.clone()));
    }
    if patch.is_empty() {
        return Err(IncidentError::InvalidInput("patch has no fields".into()));
    }
    require_actor(actor_id)?;

    let title = match patch.title.as_deref().map(str::trim) {
        Some("") => return Err(IncidentError::InvalidInput("title must not be empty".into())),
        Some(title) if title != incident.title => Some(title.to_string()),
        _ => None,
    };
    let description = patch
        .description
        .clone()
        .filter(|description| *description != incident.description);
    let severity = patch.severity.filter(|s| *s != incident.severity);

    if title.is_none() && description.is_none() && severity.is_none() {
        return Ok(None);
    }

    let mut next = incident.clone();
    if let Some(title) = &title {
        next.title = title.clone();
    }
    if let Some(description) = &description {
        next.description = description.clone();
    }
    if let Some(severity) = severity {
        next.severity = severity;
    }
    next.updated_at = now;

    let event = timeline::append(
        &mut next,
        actor_id,
        now,
        EventPayload::Updated {
            title,
            description,
            severity,
        },
    )?;

    Ok(Some((next, event)))
}

/// Tombstones the incident. The record stays in storage.
pub fn soft_delete(
    incident: &Incident,
    actor_id: &str,
    now: TimeStamp,
) -> Result<(Incident, TimelineEvent), IncidentError> {
    if incident.is_deleted() {
        return Err(IncidentError::NotFound(incident.id.clone()));
    }
    require_actor(actor_id)?;

    let mut next = incident.clone();
    next.deleted_at = Some(now);
    next.updated_at = now;
    let event = timeline::append(&mut next, actor_id, now, EventPayload::Deleted)?;

    Ok((next, event))
}

pub(crate) fn require_actor(actor_id: &str) -> Result<(), IncidentError> {
    if actor_id.trim().is_empty() {
        return Err(IncidentError::InvalidInput("actor id must not be empty".into()));
    }
    Ok(())
}
