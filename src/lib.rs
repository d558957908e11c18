//! Incident lifecycle engine: state machine, assignment ledger and timeline
//! behind a versioned repository.

pub mod api;
pub mod assignment;
pub mod clock;
pub mod config;
pub mod error;
pub mod incident;
pub mod lifecycle;
pub mod repository;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod timeline;
pub mod utils;

pub use error::{ErrorKind, IncidentError, RepositoryError};
pub use incident::{Incident, IncidentPatch, IncidentStatus, NewIncident, Severity};
pub use repository::{CancelToken, IncidentFilter, IncidentRepository};
pub use service::IncidentService;
pub use store::SledRepository;
