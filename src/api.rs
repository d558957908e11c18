//! Typed command boundary for an HTTP front end
//!
//! [`decode`] turns a raw request into a [`Command`] by matching the
//! route table and validating path, query and body against the
//! per-operation schemas. [`Dispatcher`] runs commands against the
//! service behind an ordered list of [`Decorator`]s and renders results
//! and errors as JSON. The transport itself is somebody else's job.
use crate::clock::Clock;
use crate::error::{ErrorKind, IncidentError};
use crate::incident::{IncidentPatch, IncidentStatus, NewIncident, Severity};
use crate::repository::{CancelToken, IncidentFilter, IncidentRepository};
use crate::service::IncidentService;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("unsupported method {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteName {
    CreateIncident,
    ListIncidents,
    GetIncident,
    UpdateIncident,
    DeleteIncident,
    ResolveIncident,
    TransitionIncident,
    ListComments,
    AddComment,
    ListAssignments,
    AssignIncident,
    UnassignIncident,
    GetTimeline,
}

pub struct Route {
    pub method: Method,
    pub pattern: &'static str,
    pub name: RouteName,
}

/// Every operation the boundary exposes. `:id` captures a path segment.
pub const ROUTES: &[Route] = &[
    Route {
        method: Method::Post,
        pattern: "/incidents",
        name: RouteName::CreateIncident,
    },
    Route {
        method: Method::Get,
        pattern: "/incidents",
        name: RouteName::ListIncidents,
    },
    Route {
        method: Method::Get,
        pattern: "/incidents/:id",
        name: RouteName::GetIncident,
    },
    Route {
        method: Method::Put,
        pattern: "/incidents/:id",
        name: RouteName::UpdateIncident,
    },
    Route {
        method: Method::Delete,
        pattern: "/incidents/:id",
        name: RouteName::DeleteIncident,
    },
    Route {
        method: Method::Post,
        pattern: "/incidents/:id/resolve",
        name: RouteName::ResolveIncident,
    },
    Route {
        method: Method::Post,
        pattern: "/incidents/:id/transition",
        name: RouteName::TransitionIncident,
    },
    Route {
        method: Method::Get,
        pattern: "/incidents/:id/comments",
        name: RouteName::ListComments,
    },
    Route {
        method: Method::Post,
        pattern: "/incidents/:id/comments",
        name: RouteName::AddComment,
    },
    Route {
        method: Method::Get,
        pattern: "/incidents/:id/assignments",
        name: RouteName::ListAssignments,
    },
    Route {
        method: Method::Post,
        pattern: "/incidents/:id/assign",
        name: RouteName::AssignIncident,
    },
    Route {
        method: Method::Post,
        pattern: "/incidents/:id/unassign",
        name: RouteName::UnassignIncident,
    },
    Route {
        method: Method::Get,
        pattern: "/incidents/:id/timeline",
        name: RouteName::GetTimeline,
    },
];

const API_PREFIX: &str = "/api/v1";

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
    /// Opaque caller identity, recorded on every write
    pub actor_id: String,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            body: None,
            actor_id: actor_id.into(),
            timeout: None,
        }
    }
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn error(status: u16, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": { "kind": kind, "message": message.into() } }),
        }
    }

    /// Machine readable error kind, if this is an error response.
    pub fn error_kind(&self) -> Option<&str> {
        self.body.get("error")?.get("kind")?.as_str()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateIncidentRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddCommentRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignRequest {
    pub assignee_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionRequest {
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateIncident {
        title: String,
        description: String,
        severity: Severity,
    },
    ListIncidents {
        filter: IncidentFilter,
        cursor: Option<String>,
        limit: Option<usize>,
    },
    GetIncident { id: String },
    UpdateIncident { id: String, patch: IncidentPatch },
    DeleteIncident { id: String },
    ResolveIncident { id: String },
    TransitionIncident { id: String, target: IncidentStatus },
    ListComments {
        id: String,
        cursor: Option<String>,
        limit: Option<usize>,
    },
    AddComment { id: String, body: String },
    ListAssignments { id: String },
    AssignIncident { id: String, assignee_id: String },
    UnassignIncident { id: String },
    GetTimeline {
        id: String,
        cursor: Option<String>,
        limit: Option<usize>,
    },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("No route for {0}")]
    UnknownRoute(String),
    #[error("{method} is not allowed on {path}")]
    MethodNotAllowed { method: &'static str, path: String },
    #[error(transparent)]
    Invalid(#[from] IncidentError),
}

/// Finds the route for `method` and `path`, returning the captured `:id`.
pub fn match_route(method: Method, path: &str) -> Result<(RouteName, Option<String>), DecodeError> {
    let path = path.strip_prefix(API_PREFIX).unwrap_or(path);
    let path = path.trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut path_matched = false;
    for route in ROUTES {
        let pattern: Vec<&str> = route.pattern.split('/').filter(|s| !s.is_empty()).collect();
        if pattern.len() != segments.len() {
            continue;
        }
        let mut id = None;
        let fits = pattern.iter().zip(&segments).all(|(p, s)| {
            if *p == ":id" {
                id = Some(s.to_string());
                true
            } else {
                p == s
            }
        });
        if !fits {
            continue;
        }
        path_matched = true;
        if route.method == method {
            return Ok((route.name, id));
        }
    }

    if path_matched {
        Err(DecodeError::MethodNotAllowed {
            method: method.as_str(),
            path: path.to_string(),
        })
    } else {
        Err(DecodeError::UnknownRoute(path.to_string()))
    }
}

/// Validates a raw request into a typed command.
pub fn decode(request: &Request) -> Result<Command, DecodeError> {
    let (route, captured) = match_route(request.method, &request.path)?;
    let id = || captured.clone().unwrap_or_default();

    let command = match route {
        RouteName::CreateIncident => {
            let body: CreateIncidentRequest = parse_body(request)?;
            Command::CreateIncident {
                title: body.title,
                description: body.description,
                severity: body.severity,
            }
        }
        RouteName::ListIncidents => Command::ListIncidents {
            filter: IncidentFilter {
                status: query_param(request, "status")?,
                severity: query_param(request, "severity")?,
                assignee_id: request.query.get("assignee").cloned(),
            },
            cursor: request.query.get("cursor").cloned(),
            limit: limit_param(request)?,
        },
        RouteName::GetIncident => Command::GetIncident { id: id() },
        RouteName::UpdateIncident => Command::UpdateIncident {
            id: id(),
            patch: parse_body(request)?,
        },
        RouteName::DeleteIncident => Command::DeleteIncident { id: id() },
        RouteName::ResolveIncident => Command::ResolveIncident { id: id() },
        RouteName::TransitionIncident => {
            let body: TransitionRequest = parse_body(request)?;
            Command::TransitionIncident {
                id: id(),
                target: body.status,
            }
        }
        RouteName::ListComments => Command::ListComments {
            id: id(),
            cursor: request.query.get("cursor").cloned(),
            limit: limit_param(request)?,
        },
        RouteName::AddComment => {
            let body: AddCommentRequest = parse_body(request)?;
            Command::AddComment {
                id: id(),
                body: body.body,
            }
        }
        RouteName::ListAssignments => Command::ListAssignments { id: id() },
        RouteName::AssignIncident => {
            let body: AssignRequest = parse_body(request)?;
            Command::AssignIncident {
                id: id(),
                assignee_id: body.assignee_id,
            }
        }
        RouteName::UnassignIncident => Command::UnassignIncident { id: id() },
        RouteName::GetTimeline => Command::GetTimeline {
            id: id(),
            cursor: request.query.get("cursor").cloned(),
            limit: limit_param(request)?,
        },
    };

    Ok(command)
}

fn parse_body<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, IncidentError> {
    let body = request
        .body
        .clone()
        .ok_or_else(|| IncidentError::InvalidInput("request body is required".into()))?;
    serde_json::from_value(body).map_err(|e| IncidentError::InvalidInput(e.to_string()))
}

fn query_param<T>(request: &Request, key: &str) -> Result<Option<T>, IncidentError>
where
    T: std::str::FromStr<Err = IncidentError>,
{
    request.query.get(key).map(|raw| raw.parse()).transpose()
}

fn limit_param(request: &Request) -> Result<Option<usize>, IncidentError> {
    request
        .query
        .get("limit")
        .map(|raw| {
            raw.parse()
                .map_err(|_| IncidentError::InvalidInput(format!("limit '{raw}' is not a number")))
        })
        .transpose()
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::InvalidInput => 400,
        ErrorKind::InvalidTransition => 422,
        ErrorKind::IncidentClosed => 409,
        ErrorKind::NoActiveAssignment => 409,
        ErrorKind::ConflictRetryable => 409,
        ErrorKind::RepositoryUnavailable => 503,
        ErrorKind::Cancelled => 499,
        ErrorKind::Internal => 500,
    }
}

impl From<&IncidentError> for Response {
    fn from(err: &IncidentError) -> Self {
        let kind = err.kind();
        Response::error(status_for(kind), kind.as_str(), err.to_string())
    }
}

impl From<DecodeError> for Response {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownRoute(_) => {
                Response::error(404, "route_not_found", err.to_string())
            }
            DecodeError::MethodNotAllowed { .. } => {
                Response::error(405, "method_not_allowed", err.to_string())
            }
            DecodeError::Invalid(inner) => Response::from(&inner),
        }
    }
}

/// Wraps dispatch. Decorators run in registration order, outermost first.
pub trait Decorator: Send + Sync {
    fn handle(&self, request: &Request, next: &dyn Fn(&Request) -> Response) -> Response;
}

/// One span per request and a line with the outcome.
pub struct RequestLog;

impl Decorator for RequestLog {
    fn handle(&self, request: &Request, next: &dyn Fn(&Request) -> Response) -> Response {
        let span = tracing::info_span!(
            "request",
            method = request.method.as_str(),
            path = %request.path,
            actor = %request.actor_id
        );
        let _entered = span.enter();
        let started = Instant::now();

        let response = next(request);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match response.error_kind() {
            Some(kind) if response.status >= 500 => {
                tracing::error!(status = response.status, kind, elapsed_ms, "request failed")
            }
            Some(kind) => {
                tracing::info!(status = response.status, kind, elapsed_ms, "request denied")
            }
            None => tracing::info!(status = response.status, elapsed_ms, "request served"),
        }
        response
    }
}

/// Turns a panic further down into a 500 instead of tearing down the caller.
pub struct PanicGuard;

impl Decorator for PanicGuard {
    fn handle(&self, request: &Request, next: &dyn Fn(&Request) -> Response) -> Response {
        match catch_unwind(AssertUnwindSafe(|| next(request))) {
            Ok(response) => response,
            Err(_) => {
                tracing::error!(path = %request.path, "handler panicked");
                Response::from(&IncidentError::Internal("handler panicked".into()))
            }
        }
    }
}

pub struct Dispatcher<R, C> {
    service: IncidentService<R, C>,
    decorators: Vec<Box<dyn Decorator>>,
}

impl<R: IncidentRepository, C: Clock> Dispatcher<R, C> {
    pub fn new(service: IncidentService<R, C>) -> Self {
        Self {
            service,
            decorators: vec![],
        }
    }

    /// The default chain: logging outside, panic recovery inside.
    pub fn with_default_decorators(service: IncidentService<R, C>) -> Self {
        Self::new(service).decorate(RequestLog).decorate(PanicGuard)
    }

    pub fn decorate(mut self, decorator: impl Decorator + 'static) -> Self {
        self.decorators.push(Box::new(decorator));
        self
    }

    pub fn dispatch(&self, request: &Request) -> Response {
        self.run(0, request)
    }

    fn run(&self, layer: usize, request: &Request) -> Response {
        match self.decorators.get(layer) {
            Some(decorator) => decorator.handle(request, &|r: &Request| self.run(layer + 1, r)),
            None => self.handle(request),
        }
    }

    fn handle(&self, request: &Request) -> Response {
        let command = match decode(request) {
            Ok(command) => command,
            Err(err) => return err.into(),
        };
        let cancel = match request.timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::none(),
        };

        match self.execute(command, &request.actor_id, &cancel) {
            Ok(response) => response,
            Err(err) => Response::from(&err),
        }
    }

    /// Runs one command. Writes answer with the committed incident and version.
    pub fn execute(
        &self,
        command: Command,
        actor_id: &str,
        cancel: &CancelToken,
    ) -> Result<Response, IncidentError> {
        let service = &self.service;
        let response = match command {
            Command::CreateIncident {
                title,
                description,
                severity,
            } => {
                let draft = NewIncident::new()
                    .set_title(title)
                    .set_description(description)
                    .set_severity(severity);
                created(service.create_incident(&draft, actor_id, cancel)?)?
            }
            Command::ListIncidents {
                filter,
                cursor,
                limit,
            } => ok(service.list_incidents(&filter, cursor.as_deref(), limit, cancel)?)?,
            Command::GetIncident { id } => ok(service.get_incident(&id, cancel)?)?,
            Command::UpdateIncident { id, patch } => {
                ok(service.update_incident(&id, &patch, actor_id, cancel)?)?
            }
            Command::DeleteIncident { id } => ok(service.delete_incident(&id, actor_id, cancel)?)?,
            Command::ResolveIncident { id } => {
                ok(service.resolve_incident(&id, actor_id, cancel)?)?
            }
            Command::TransitionIncident { id, target } => {
                ok(service.transition_incident(&id, target, actor_id, cancel)?)?
            }
            Command::ListComments { id, cursor, limit } => {
                ok(service.list_comments(&id, cursor.as_deref(), limit, cancel)?)?
            }
            Command::AddComment { id, body } => {
                created(service.add_comment(&id, actor_id, &body, cancel)?)?
            }
            Command::ListAssignments { id } => ok(service.list_assignments(&id, cancel)?)?,
            Command::AssignIncident { id, assignee_id } => {
                ok(service.assign_incident(&id, &assignee_id, actor_id, cancel)?)?
            }
            Command::UnassignIncident { id } => {
                ok(service.unassign_incident(&id, actor_id, cancel)?)?
            }
            Command::GetTimeline { id, cursor, limit } => {
                ok(service.get_timeline(&id, cursor.as_deref(), limit, cancel)?)?
            }
        };
        Ok(response)
    }
}

fn ok<T: serde::Serialize>(value: T) -> Result<Response, IncidentError> {
    render(200, value)
}

fn created<T: serde::Serialize>(value: T) -> Result<Response, IncidentError> {
    render(201, value)
}

fn render<T: serde::Serialize>(status: u16, value: T) -> Result<Response, IncidentError> {
    let body = serde_json::to_value(value)
        .map_err(|e| IncidentError::Internal(format!("response is not serializable: {e}")))?;
    Ok(Response { status, body })
}
