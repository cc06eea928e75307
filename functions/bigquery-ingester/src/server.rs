//! HTTP front end for the trigger endpoint.
//!
//! Serves `GET /datastoreToBigqueryIngestorTask` and a `/health` probe with
//! hyper 1.x, one task per connection.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request as HttpRequest, Response as HttpResponse, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::queue::TRIGGER_PATH;
use crate::{IngestionService, Request, Response};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Base URL re-enqueued triggers are sent to. Derived from request headers when unset.
    pub public_base_url: Option<String>,
    /// How long in-flight triggers may run after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_base_url: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], settings.port)),
            public_base_url: settings.public_base_url.clone(),
            ..Self::default()
        }
    }
}

pub struct IngesterServer {
    config: ServerConfig,
    service: Arc<IngestionService>,
}

struct ServerState {
    service: Arc<IngestionService>,
    public_base_url: Option<String>,
}

impl IngesterServer {
    pub fn new(config: ServerConfig, service: Arc<IngestionService>) -> Self {
        Self { config, service }
    }

    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_address).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires, then let
    /// in-flight requests finish within the configured grace period.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("Ingester listening on http://{}", listener.local_addr()?);

        let state = Arc::new(ServerState {
            service: Arc::clone(&self.service),
            public_base_url: self.config.public_base_url.clone(),
        });
        let (drain_tx, _) = broadcast::channel::<()>(1);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Connection from {}", addr);

                            connections.spawn(serve_connection(
                                stream,
                                addr,
                                Arc::clone(&state),
                                drain_tx.subscribe(),
                            ));
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => {
                    info!(in_flight = connections.len(), "Ingester shutting down");
                    break;
                }
            }
        }

        drop(listener);
        let _ = drain_tx.send(());

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown grace period elapsed, aborting connections"
            );
            connections.abort_all();
        }

        Ok(())
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn run_until_shutdown(self) -> anyhow::Result<()> {
        let (tx, rx) = broadcast::channel(1);

        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = tx.send(());
        });

        self.run(rx).await
    }
}

/// Serve one connection, closing it gracefully once `drain` fires.
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    mut drain: broadcast::Receiver<()>,
) {
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        // Triggers carry everything in the query string.
        let req = req.map(|_| ());
        async move { Ok::<_, Infallible>(handle_request(&req, &state).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);
    let mut draining = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    if !err.is_incomplete_message() {
                        warn!("Error serving connection from {}: {}", addr, err);
                    }
                }
                break;
            }
            _ = drain.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for ctrl-c: {}", e);
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
}

async fn handle_request<B>(
    req: &HttpRequest<B>,
    state: &ServerState,
) -> HttpResponse<Full<Bytes>> {
    if req.method() != Method::GET {
        return make_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method Not Allowed".to_string(),
        );
    }

    match req.uri().path() {
        TRIGGER_PATH => {
            let request = Request::from_query(req.uri().query().unwrap_or_default());
            let base_url = base_url(req, state.public_base_url.as_deref());
            let outcome = state.service.handle_request(&request, &base_url).await;
            json_response(outcome.status, &outcome.response)
        }
        "/health" | "/healthz" => make_response(
            StatusCode::OK,
            "application/json",
            r#"{"status":"healthy"}"#.to_string(),
        ),
        _ => make_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    }
}

/// Scheme and authority the caller used to reach us, unless configured explicitly.
fn base_url<B>(req: &HttpRequest<B>, configured: Option<&str>) -> String {
    if let Some(url) = configured {
        return url.trim_end_matches('/').to_string();
    }

    let proto = header(req, "x-forwarded-proto")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .unwrap_or("https");
    let host = header(req, "host")
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .unwrap_or("localhost");

    format!("{}://{}", proto, host)
}

fn header<'a, B>(req: &'a HttpRequest<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn json_response(status: StatusCode, body: &Response) -> HttpResponse<Full<Bytes>> {
    let body = serde_json::to_string(body).unwrap_or_else(|e| {
        error!("Failed to serialize response: {}", e);
        r#"{"status":"failed","message":"response serialization failed"}"#.to_string()
    });
    make_response(status, "application/json", body)
}

fn make_response(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> HttpResponse<Full<Bytes>> {
    let mut response = HttpResponse::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupCatalog, BackupRecord};
    use crate::config::{ExportConfig, ExportRegistry};
    use crate::queue::{TaskQueue, Trigger};
    use crate::retry::RetryPolicy;
    use crate::warehouse::{LoadJob, TableRef, Warehouse};
    use async_trait::async_trait;
    use http_body_util::BodyExt;

    struct Unreachable;

    #[async_trait]
    impl BackupCatalog for Unreachable {
        async fn first_in_name_range(
            &self,
            _: &str,
            _: &str,
        ) -> anyhow::Result<Option<BackupRecord>> {
            anyhow::bail!("catalog should not be called")
        }
    }

    #[async_trait]
    impl TaskQueue for Unreachable {
        async fn enqueue(&self, _: &str, _: &str, _: &Trigger, _: Duration) -> anyhow::Result<()> {
            anyhow::bail!("queue should not be called")
        }
    }

    #[async_trait]
    impl Warehouse for Unreachable {
        async fn table_exists(&self, _: &TableRef) -> anyhow::Result<bool> {
            anyhow::bail!("warehouse should not be called")
        }

        async fn delete_table(&self, _: &TableRef) -> anyhow::Result<()> {
            anyhow::bail!("warehouse should not be called")
        }

        async fn insert_load_job(&self, _: &LoadJob) -> anyhow::Result<String> {
            anyhow::bail!("warehouse should not be called")
        }
    }

    /// Backup that is never complete, reported after a short delay.
    struct SlowCatalog;

    #[async_trait]
    impl BackupCatalog for SlowCatalog {
        async fn first_in_name_range(
            &self,
            _: &str,
            _: &str,
        ) -> anyhow::Result<Option<BackupRecord>> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(None)
        }
    }

    fn state() -> ServerState {
        let service = IngestionService::new(
            ExportRegistry::default(),
            Arc::new(Unreachable),
            Arc::new(Unreachable),
            Arc::new(Unreachable),
            RetryPolicy::default(),
        );
        ServerState {
            service: Arc::new(service),
            public_base_url: None,
        }
    }

    async fn body_json(response: HttpResponse<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 8080);
        assert!(config.public_base_url.is_none());
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_base_url_from_headers() {
        let req = HttpRequest::builder()
            .uri("/datastoreToBigqueryIngestorTask")
            .header("host", "ingester-abc.a.run.app")
            .header("x-forwarded-proto", "https, http")
            .body(())
            .unwrap();
        assert_eq!(base_url(&req, None), "https://ingester-abc.a.run.app");
    }

    #[test]
    fn test_base_url_defaults() {
        let req = HttpRequest::builder().uri("/").body(()).unwrap();
        assert_eq!(base_url(&req, None), "https://localhost");
        assert_eq!(
            base_url(&req, Some("http://10.0.0.5:8080/")),
            "http://10.0.0.5:8080"
        );
    }

    #[tokio::test]
    async fn test_missing_timestamp_is_bad_request() {
        let req = HttpRequest::builder()
            .uri("/datastoreToBigqueryIngestorTask?exportConfig=nightly")
            .body(())
            .unwrap();

        let response = handle_request(&req, &state()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let json = body_json(response).await;
        assert_eq!(json["status"], "failed");
        assert_eq!(json["message"], "Missing required param: timestamp");
    }

    #[tokio::test]
    async fn test_unknown_export_config_is_bad_request() {
        let req = HttpRequest::builder()
            .uri("/datastoreToBigqueryIngestorTask?timestamp=1704556800&exportConfig=hourly")
            .body(())
            .unwrap();

        let response = handle_request(&req, &state()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Unknown export config: hourly");
    }

    #[tokio::test]
    async fn test_health_and_routing() {
        let health = HttpRequest::builder().uri("/health").body(()).unwrap();
        assert_eq!(handle_request(&health, &state()).await.status(), StatusCode::OK);

        let missing = HttpRequest::builder().uri("/metrics").body(()).unwrap();
        assert_eq!(handle_request(&missing, &state()).await.status(), StatusCode::NOT_FOUND);

        let post = HttpRequest::builder()
            .method(Method::POST)
            .uri("/datastoreToBigqueryIngestorTask")
            .body(())
            .unwrap();
        assert_eq!(
            handle_request(&post, &state()).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_trigger() {
        let export = ExportConfig::builder()
            .queue_name("export-queue")
            .backup_name_prefix("nightly_")
            .bigquery_project_id("analytics")
            .bigquery_dataset_id("datastore")
            .entity_kinds(vec!["Order".to_string()])
            .bucket_name("backups")
            .build();
        let service = IngestionService::new(
            ExportRegistry::from_configs([("nightly", export)]).unwrap(),
            Arc::new(SlowCatalog),
            Arc::new(Unreachable),
            Arc::new(Unreachable),
            RetryPolicy::builder().max_attempts(1).build(),
        );
        let server = IngesterServer::new(ServerConfig::default(), Arc::new(service));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let serving = tokio::spawn(async move { server.serve(listener, rx).await });

        let request = tokio::spawn(reqwest::get(format!(
            "http://{}/datastoreToBigqueryIngestorTask?timestamp=1704556800&exportConfig=nightly",
            addr
        )));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json["message"].as_str().unwrap().contains("giving up"));

        serving.await.unwrap().unwrap();
    }
}
