/// HTTP server for the control-plane API and the metrics endpoint
use crate::api::TaskPackageApi;
use crate::config::ServerConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::MetricsCollector;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Mount point of every control-plane route
pub const PREFIX: &str = "/task-package";

/// State shared by all connections; the API is swapped on config reload
pub struct AppState {
    api: RwLock<Arc<TaskPackageApi>>,
    metrics: Arc<MetricsCollector>,
}

impl AppState {
    pub fn new(api: Arc<TaskPackageApi>) -> Self {
        let metrics = api.metrics().clone();
        AppState {
            api: RwLock::new(api),
            metrics,
        }
    }

    /// Current API adapter
    pub fn api(&self) -> Arc<TaskPackageApi> {
        self.api.read().clone()
    }

    /// Install a new adapter and return the previous one
    pub fn swap(&self, api: Arc<TaskPackageApi>) -> Arc<TaskPackageApi> {
        std::mem::replace(&mut *self.api.write(), api)
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}

/// Control-plane server
#[derive(Clone)]
pub struct TaskPackageServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

fn socket_addr(host: &str, port: u16) -> DaemonResult<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| DaemonError::ServerError(format!("Invalid address: {}", e)))
}

impl TaskPackageServer {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        TaskPackageServer { config, state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Start the HTTP server
    pub async fn start_http(&self) -> DaemonResult<()> {
        let addr = socket_addr(&self.config.http_addr, self.config.http_port)?;
        let state = self.state.clone();

        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let state = state.clone();
                    handle_request(req, state)
                }))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);

        info!("Task package API listening on http://{}{}", addr, PREFIX);

        server
            .await
            .map_err(|e| DaemonError::ServerError(format!("HTTP server error: {}", e)))
    }

    /// Start the metrics endpoint
    pub async fn start_metrics(&self) -> DaemonResult<()> {
        if !self.config.enable_metrics {
            return Ok(());
        }

        let addr = socket_addr(&self.config.http_addr, self.config.metrics_port)?;
        let metrics = self.state.metrics.clone();

        let make_svc = make_service_fn(move |_conn| {
            let metrics = metrics.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req| {
                    let metrics = metrics.clone();
                    handle_metrics_request(metrics)
                }))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);

        info!("Metrics endpoint listening on http://{}", addr);

        server
            .await
            .map_err(|e| DaemonError::ServerError(format!("Metrics server error: {}", e)))
    }

    /// Run both servers until one of them stops
    pub async fn run(&self) -> DaemonResult<()> {
        let server = self.clone();
        let http_handle = tokio::spawn(async move { server.start_http().await });

        let result = if self.config.enable_metrics {
            let server = self.clone();
            let metrics_handle = tokio::spawn(async move { server.start_metrics().await });
            tokio::select! {
                res = http_handle => res,
                res = metrics_handle => res,
            }
        } else {
            http_handle.await
        };

        result.map_err(|e| DaemonError::ServerError(format!("Server task failed: {}", e)))?
    }
}

/// Serve one control-plane request. Never fails: errors become JSON bodies.
pub async fn handle_request(
    req: Request<Body>,
    state: Arc<AppState>,
) -> Result<Response<Body>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    state.metrics.record_connection();

    let response = match route(req, &state).await {
        Ok(response) => response,
        Err(e) => {
            state.metrics.record_error();
            let status = e.status_code();
            if status.is_server_error() {
                error!("{} {} failed: {}", method, path, e);
            } else {
                debug!("{} {} rejected: {}", method, path, e);
            }
            respond(status, &e.to_body())
        }
    };

    state.metrics.record_connection_closed();
    state.metrics.record_request(started.elapsed().as_secs_f64());
    Ok(with_cors(response))
}

async fn route(req: Request<Body>, state: &AppState) -> DaemonResult<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let sub = path
        .strip_prefix(PREFIX)
        .ok_or_else(|| DaemonError::NotFound(format!("No route for {}", path)))?;

    if method == Method::OPTIONS {
        return Ok(empty(StatusCode::NO_CONTENT));
    }

    if method == Method::GET && (sub.is_empty() || sub == "/") {
        return Ok(respond(
            StatusCode::OK,
            &json!({
                "name": "Taskpack control plane",
                "version": crate::VERSION,
                "routes": [
                    "POST /start",
                    "POST /cancel",
                    "POST /update",
                    "GET /status",
                    "GET /info",
                    "GET /edt/mode/status",
                    "POST /edt/mode/enable",
                    "POST /edt/mode/disable"
                ]
            }),
        ));
    }

    let api = state.api();
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let auth = api.authenticate(authorization.as_deref()).await?;
    let query = req.uri().query().map(str::to_string);

    match (&method, sub) {
        (&Method::POST, "/start") => ok_json(&api.start(&auth, read_json(req).await?).await?),
        (&Method::POST, "/cancel") => ok_json(&api.cancel(&auth, read_json(req).await?).await?),
        (&Method::POST, "/update") => ok_json(&api.update(&auth, read_json(req).await?).await?),
        (&Method::GET, "/status") => {
            ok_json(&api.status(&auth, parse_query(query.as_deref())?).await?)
        }
        (&Method::GET, "/info") => ok_json(&api.info(&auth, parse_query(query.as_deref())?).await?),
        (&Method::GET, "/edt/mode/status") => {
            ok_json(&api.mode_status(parse_query(query.as_deref())?).await?)
        }
        (&Method::POST, "/edt/mode/enable") => {
            ok_json(&api.set_mode(&auth, read_json(req).await?, true).await?)
        }
        (&Method::POST, "/edt/mode/disable") => {
            ok_json(&api.set_mode(&auth, read_json(req).await?, false).await?)
        }
        _ => Err(DaemonError::NotFound(format!("No route for {} {}", method, path))),
    }
}

/// Decode a JSON body; an empty body reads as `{}`
async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> DaemonResult<T> {
    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_value(Value::Object(Map::new()))
            .map_err(|e| DaemonError::InvalidRequest(format!("Invalid request body: {}", e)));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| DaemonError::InvalidRequest(format!("Invalid request body: {}", e)))
}

/// Decode a query string; empty values count as absent
fn parse_query<T: DeserializeOwned>(query: Option<&str>) -> DaemonResult<T> {
    let params: Map<String, Value> = url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    serde_json::from_value(Value::Object(params))
        .map_err(|e| DaemonError::InvalidRequest(format!("Invalid query: {}", e)))
}

fn ok_json<T: Serialize>(value: &T) -> DaemonResult<Response<Body>> {
    let body = serde_json::to_value(value)?;
    Ok(respond(StatusCode::OK, &body))
}

fn respond(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn with_cors(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    response
}

/// Handle metrics requests
async fn handle_metrics_request(
    metrics: Arc<MetricsCollector>,
) -> Result<Response<Body>, hyper::Error> {
    match metrics.gather_metrics() {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            Ok(response)
        }
        Err(e) => {
            warn!("Failed to gather metrics: {:?}", e);
            let mut response = Response::new(Body::from("Failed to gather metrics"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}
