//! HTTP API for managing backends, templates and user allow-lists
//!
//! Every route except `/health` requires the shared secret in the
//! `X-API-KEY` header. Routes are resolved by [`Route::parse`].

use crate::error::{json_error_response, BackendError, ErrorCode};
use crate::record::{AuthUpdate, NewBackend};
use crate::service::BackendService;
use crate::users::{User, UserStore};
use crate::validate;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header carrying the shared secret
pub const API_KEY_HEADER: &str = "x-api-key";

/// Everything a request handler needs
pub struct ApiState {
    pub backends: Arc<BackendService>,
    pub users: UserStore,
    pub api_key: String,
}

/// Resolved API route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    Utils,
    ListBackends,
    CreateBackend,
    GetBackend(String),
    DeleteBackend(String),
    UpdateBackendAuth(String),
    BackendsByOwner(String),
    BackendsByTemplate(String),
    ListTemplates,
    TemplatesByName(String),
    Template { name: String, version: String },
    ListUsers(String),
    AddUser(String),
    DeleteUser(String),
}

impl Route {
    /// The route table
    pub fn parse(method: &Method, path: &str) -> Option<Route> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(percent_decode)
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let route = match (method, segments.as_slice()) {
            (&Method::GET, ["health"]) => Route::Health,
            (&Method::GET, ["utils"]) => Route::Utils,

            (&Method::GET, ["backends"]) => Route::ListBackends,
            (&Method::POST, ["backends"]) => Route::CreateBackend,
            (&Method::GET, ["backends", "byOwner", owner]) => Route::BackendsByOwner(owner.to_string()),
            (&Method::GET, ["backends", "byTemplate", template]) => {
                Route::BackendsByTemplate(template.to_string())
            }
            (&Method::GET, ["backends", id]) => Route::GetBackend(id.to_string()),
            (&Method::DELETE, ["backends", id]) => Route::DeleteBackend(id.to_string()),
            (&Method::POST, ["backends", id, "auth"]) => Route::UpdateBackendAuth(id.to_string()),

            (&Method::GET, ["templates"]) => Route::ListTemplates,
            (&Method::GET, ["templates", name]) => Route::TemplatesByName(name.to_string()),
            (&Method::GET, ["templates", name, version]) => Route::Template {
                name: name.to_string(),
                version: version.to_string(),
            },

            (&Method::GET, ["users", id]) => Route::ListUsers(id.to_string()),
            (&Method::POST, ["users", id]) => Route::AddUser(id.to_string()),
            (&Method::DELETE, ["users", id]) => Route::DeleteUser(id.to_string()),

            _ => return None,
        };
        Some(route)
    }

    pub fn requires_auth(&self) -> bool {
        !matches!(self, Route::Health)
    }
}

fn percent_decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<ApiState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, _addr: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

fn check_api_key<B>(req: &Request<B>, expected: &str) -> bool {
    req.headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|key| key == expected)
        .unwrap_or(false)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    let Some(route) = Route::parse(&method, &path) else {
        return Ok(json_error_response(ErrorCode::NotFound, "Not found"));
    };

    if route.requires_auth() && !check_api_key(&req, &state.api_key) {
        warn!(%method, %path, "Unauthorized API request");
        return Ok(json_error_response(
            ErrorCode::Forbidden,
            "Could not validate credentials",
        ));
    }

    let response = dispatch(route, req, &state).await.unwrap_or_else(|e| {
        match e.code() {
            ErrorCode::InternalError | ErrorCode::TemplateError | ErrorCode::InvalidState => {
                error!(%method, %path, error = %e, "API error")
            }
            _ => debug!(%method, %path, error = %e, "Request rejected"),
        }
        e.into_response()
    });

    Ok(response)
}

async fn dispatch(
    route: Route,
    req: Request<hyper::body::Incoming>,
    state: &ApiState,
) -> Result<Response<Full<Bytes>>, BackendError> {
    match route {
        Route::Health => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
        Route::Utils => json_ok(&serde_json::json!({ "name": PKG_NAME, "version": VERSION })),

        Route::ListBackends => {
            let backends = Arc::clone(&state.backends);
            json_ok(&run_blocking(move || Ok(backends.list())).await?)
        }
        Route::CreateBackend => {
            let input: NewBackend = read_json(req).await?;
            let backends = Arc::clone(&state.backends);
            json_ok(&run_blocking(move || backends.create(&input)).await?)
        }
        Route::GetBackend(id) => {
            let id = validate::backend_id(&id)?;
            let backends = Arc::clone(&state.backends);
            json_ok(&run_blocking(move || backends.get(id)).await?)
        }
        Route::DeleteBackend(id) => {
            let id = validate::backend_id(&id)?;
            let backends = Arc::clone(&state.backends);
            let users = state.users.clone();
            run_blocking(move || {
                backends.delete(id)?;
                if let Err(e) = users.remove_all(id) {
                    warn!(id, error = %e, "Backend deleted but its user allow-list was not");
                }
                Ok(())
            })
            .await?;
            json_ok(&serde_json::json!({ "message": format!("Backend deleted: {}.", id) }))
        }
        Route::UpdateBackendAuth(id) => {
            let id = validate::backend_id(&id)?;
            let update: AuthUpdate = read_json(req).await?;
            let backends = Arc::clone(&state.backends);
            json_ok(&run_blocking(move || backends.update_auth(id, update.auth_enabled)).await?)
        }
        Route::BackendsByOwner(owner) => {
            let service = Arc::clone(&state.backends);
            let wanted = owner.clone();
            let backends = run_blocking(move || Ok(service.list_by_owner(&wanted))).await?;
            if backends.is_empty() {
                return Err(BackendError::NotFound(format!("No Backends found for {}.", owner)));
            }
            json_ok(&backends)
        }
        Route::BackendsByTemplate(template) => {
            let service = Arc::clone(&state.backends);
            let wanted = template.clone();
            let backends = run_blocking(move || Ok(service.list_by_template(&wanted))).await?;
            if backends.is_empty() {
                return Err(BackendError::NotFound(format!(
                    "No Backends found for template {}.",
                    template
                )));
            }
            json_ok(&backends)
        }

        Route::ListTemplates => json_ok(&state.backends.templates().list(None, None)),
        Route::TemplatesByName(name) => {
            let templates = state.backends.templates().list(Some(&name), None);
            if templates.is_empty() {
                return Err(BackendError::NotFound(format!("No templates found for {}", name)));
            }
            json_ok(&templates)
        }
        Route::Template { name, version } => {
            let mut templates = state.backends.templates().list(Some(&name), Some(&version));
            if templates.len() != 1 {
                return Err(BackendError::NotFound(format!(
                    "No single template found for {} {}",
                    name, version
                )));
            }
            json_ok(&templates.remove(0))
        }

        Route::ListUsers(id) => {
            let id = validate::backend_id(&id)?;
            let users = state.users.clone();
            json_ok(&run_blocking(move || Ok(users.list(id))).await?)
        }
        Route::AddUser(id) => {
            let id = validate::backend_id(&id)?;
            let user: User = read_json(req).await?;
            let users = state.users.clone();
            json_ok(&run_blocking(move || users.add(id, &user.user)).await?)
        }
        Route::DeleteUser(id) => {
            let id = validate::backend_id(&id)?;
            let user: User = read_json(req).await?;
            let users = state.users.clone();
            let name = user.user.clone();
            run_blocking(move || users.remove(id, &name)).await?;
            json_ok(&serde_json::json!({
                "message": format!("User {} deleted from {}.", user.user, id)
            }))
        }
    }
}

/// Run registry and allow-list work, which holds locks across file I/O,
/// on the blocking pool instead of an async worker
async fn run_blocking<F, T>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Internal(format!("Blocking task failed: {}", e)))?
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>) -> Result<T, BackendError> {
    let body = req
        .collect()
        .await
        .map_err(|e| BackendError::Validation(format!("Failed to read request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| BackendError::Validation(format!("Invalid JSON: {}", e)))
}

fn json_ok<T: Serialize + ?Sized>(value: &T) -> Result<Response<Full<Bytes>>, BackendError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| BackendError::Internal(format!("Failed to serialize response: {}", e)))?;
    Ok(json_response(StatusCode::OK, body))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}
