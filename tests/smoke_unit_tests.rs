//! Smoke screen unit tests for the incident lifecycle components
//!
//! These exercise the public building blocks one at a time, outside of the
//! service loop. They mostly cover the happy path plus the obvious
//! rejections.

use incident_lifecycle::{
    CancelToken, ErrorKind, IncidentError, IncidentPatch, IncidentRepository, IncidentStatus,
    NewIncident, RepositoryError, Severity, SledRepository,
    api::status_for,
    clock::TimeStamp,
    config::{ServiceConfig, StorageConfig},
    repository::Commit,
    timeline,
    utils::{INCIDENT_PREFIX, is_valid_id, new_id},
};

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Ids created later sort after ids created earlier
    #[test]
    fn ids_sort_by_creation() {
        let ids: Vec<String> = (0..20).map(|_| new_id(INCIDENT_PREFIX)).collect();
        let mut sorted = ids.clone();
        sorted.sort();

        assert_eq!(ids, sorted);
        assert!(ids.iter().all(|id| is_valid_id(INCIDENT_PREFIX, id)));
    }

    #[test]
    fn rejects_foreign_ids() {
        assert!(!is_valid_id(INCIDENT_PREFIX, "inc_"));
        assert!(!is_valid_id(INCIDENT_PREFIX, "inc_0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_id(INCIDENT_PREFIX, "cmt_0123456789abcdef0123456789abcdef"));
    }
}

// CLOCK MODULE TESTS
#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn timestamp_renders_rfc3339() {
        let ts = TimeStamp::new_with(2024, 6, 15, 10, 30, 0);
        assert_eq!(ts.to_string(), "2024-06-15T10:30:00+00:00");
    }

    /// Nanos survive the trip through `from_nanos`
    #[test]
    fn timestamp_nanos_roundtrip() {
        let ts = TimeStamp::new_with(2030, 1, 1, 0, 0, 0);
        assert_eq!(TimeStamp::from_nanos(ts.nanos()), ts);
    }
}

// INCIDENT MODULE TESTS
#[cfg(test)]
mod incident_tests {
    use super::*;

    #[test]
    fn builder_produces_open_incident_and_created_event() {
        let now = TimeStamp::new_with(2024, 3, 1, 8, 0, 0);
        let (incident, event) = NewIncident::new()
            .set_title("  Payment gateway 502s  ")
            .set_description("eu-west only")
            .set_severity(Severity::Critical)
            .build("user_ops", now)
            .unwrap();

        assert_eq!(incident.title(), "Payment gateway 502s");
        assert_eq!(incident.status(), IncidentStatus::Open);
        assert_eq!(incident.created_at(), now);
        assert_eq!(incident.updated_at(), now);
        assert_eq!(incident.resolved_at(), None);
        assert_eq!(incident.created_by(), "user_ops");
        assert_eq!(event.sequence(), 1);
        assert_eq!(event.prev_digest(), "");
        assert_eq!(incident.timeline_head(), event.digest());
    }

    /// Title, severity and actor are all required
    #[test]
    fn builder_rejects_missing_fields() {
        let now = TimeStamp::now();

        let no_title = NewIncident::new()
            .set_severity(Severity::Low)
            .build("user_ops", now);
        let blank_title = NewIncident::new()
            .set_title("   ")
            .set_severity(Severity::Low)
            .build("user_ops", now);
        let no_severity = NewIncident::new().set_title("x").build("user_ops", now);
        let no_actor = NewIncident::new()
            .set_title("x")
            .set_severity(Severity::Low)
            .build("", now);

        for result in [no_title, blank_title, no_severity, no_actor] {
            assert!(matches!(result, Err(IncidentError::InvalidInput(_))));
        }
    }

    #[test]
    fn patch_deserializes_partial_json() {
        let patch: IncidentPatch = serde_json::from_str(r#"{"severity":"critical"}"#).unwrap();
        assert_eq!(patch.severity, Some(Severity::Critical));
        assert!(patch.title.is_none());
        assert!(!patch.is_empty());

        assert!(serde_json::from_str::<IncidentPatch>(r#"{"status":"closed"}"#).is_err());
    }

    #[test]
    fn status_and_severity_parse_from_wire_names() {
        let status = "in_progress".parse::<IncidentStatus>().unwrap();
        assert_eq!(status, IncidentStatus::InProgress);
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
        assert!("urgent".parse::<Severity>().is_err());
        assert!(Severity::Critical > Severity::Low);
    }
}

// ERROR MODULE TESTS
#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn kinds_map_to_http_status() {
        let cases = [
            (IncidentError::NotFound("inc_x".into()), "not_found", 404),
            (IncidentError::InvalidInput("bad".into()), "invalid_input", 400),
            (
                IncidentError::InvalidTransition {
                    from: IncidentStatus::Open,
                    to: IncidentStatus::Closed,
                },
                "invalid_transition",
                422,
            ),
            (IncidentError::IncidentClosed("inc_x".into()), "incident_closed", 409),
            (IncidentError::NoActiveAssignment("inc_x".into()), "no_active_assignment", 409),
            (
                IncidentError::ConflictRetryable {
                    id: "inc_x".into(),
                    attempts: 3,
                },
                "conflict_retryable",
                409,
            ),
            (IncidentError::RepositoryUnavailable("down".into()), "repository_unavailable", 503),
            (IncidentError::Cancelled, "cancelled", 499),
            (IncidentError::Internal("encode".into()), "internal", 500),
        ];

        for (err, kind, status) in cases {
            assert_eq!(err.kind().as_str(), kind);
            assert_eq!(status_for(err.kind()), status);
        }
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(IncidentError::InvalidInput("x".into()).is_validation());
        assert!(!IncidentError::RepositoryUnavailable("x".into()).is_validation());
        assert!(!IncidentError::Internal("x".into()).is_validation());
        assert_eq!(
            IncidentError::from(RepositoryError::Corrupt("bad cbor".into())).kind(),
            ErrorKind::RepositoryUnavailable
        );
    }
}

// STORE TESTS
#[cfg(test)]
mod store_tests {
    use super::*;

    fn temporary_store() -> SledRepository {
        let config = StorageConfig {
            temporary: true,
            ..Default::default()
        };
        SledRepository::open(&config).unwrap()
    }

    /// A commit carrying a stale version is refused and leaves nothing behind
    #[test]
    fn stale_commit_is_a_conflict() {
        let repo = temporary_store();
        let cancel = CancelToken::none();
        let (incident, created) = NewIncident::new()
            .set_title("Stale")
            .set_severity(Severity::Low)
            .build("user_ops", TimeStamp::now())
            .unwrap();
        let id = incident.id().to_string();

        let commit = Commit::new(0, incident.clone()).with_events([created]);
        assert_eq!(repo.commit(commit, &cancel).unwrap(), 1);

        let stale = repo.commit(Commit::new(0, incident.clone()), &cancel);
        assert!(matches!(
            stale,
            Err(RepositoryError::Conflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));

        let stored = repo.load(&id, &cancel).unwrap().unwrap();
        assert_eq!(stored.version(), 1);
        let events = repo.timeline(&id, None, 10, &cancel).unwrap().items;
        assert_eq!(events.len(), 1);
        assert!(timeline::verify_chain(&events).is_ok());
    }

    #[test]
    fn cancelled_reads_fail_fast() {
        let repo = temporary_store();
        let cancel = CancelToken::none();
        cancel.cancel();

        assert!(matches!(
            repo.load("inc_0123456789abcdef0123456789abcdef", &cancel),
            Err(RepositoryError::Cancelled)
        ));
    }

    #[test]
    fn default_config_is_usable() {
        assert!(ServiceConfig::default().validate().is_ok());
    }
}
