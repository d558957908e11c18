//! Walks one incident through its life against a throwaway sled database.
//!
//! Run with `RUST_LOG=incident_lifecycle=debug` to see every commit.
use anyhow::Context;
use incident_lifecycle::{
    CancelToken, IncidentFilter, IncidentService, IncidentStatus, NewIncident, Severity,
    SledRepository, config::ServiceConfig, telemetry, timeline,
};

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let mut config = ServiceConfig::from_env();
    config.storage.temporary = true;
    config.validate()?;

    let repo = SledRepository::open(&config.storage)?;
    let service = IncidentService::new(repo, config);
    let cancel = CancelToken::none();

    let draft = NewIncident::new()
        .set_title("DB down")
        .set_description("primary postgres refuses connections")
        .set_severity(Severity::High);
    let incident = service.create_incident(&draft, "user_ops", &cancel)?;
    let id = incident.id().to_string();
    println!("created {id} ({})", incident.status());

    service.transition_incident(&id, IncidentStatus::InProgress, "user_ops", &cancel)?;
    if let Err(e) = service.transition_incident(&id, IncidentStatus::Closed, "user_ops", &cancel) {
        println!("rejected: {e}");
    }

    service.assign_incident(&id, "resp_alice", "user_ops", &cancel)?;
    service.assign_incident(&id, "resp_bob", "user_ops", &cancel)?;
    service.add_comment(&id, "resp_bob", "failed over to replica", &cancel)?;
    let incident = service.resolve_incident(&id, "resp_bob", &cancel)?;
    println!(
        "resolved at {} by version {}",
        incident.resolved_at().context("no resolved_at")?,
        incident.version()
    );

    let events = service.get_timeline(&id, None, None, &cancel)?.items;
    for event in &events {
        println!(
            "  #{:<2} {} {:?} by {}",
            event.sequence(),
            event.occurred_at(),
            event.kind(),
            event.actor_id()
        );
    }
    timeline::verify_chain(&events)?;
    println!("timeline chain verified, head {}", incident.timeline_head());

    let resolved = service.list_incidents(
        &IncidentFilter {
            status: Some(IncidentStatus::Resolved),
            ..Default::default()
        },
        None,
        None,
        &cancel,
    )?;
    println!("{} resolved incident(s)", resolved.items.len());

    Ok(())
}
