mod clients;
mod config;

use bytes::Bytes;
use clients::mmsc_http::MmscHttpClient;
use config::{DaemonConfig, LeaseConfig};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn, LevelFilter};
use mms_core::connectivity::{LeaseMode, NetworkEvent, NetworkKind, SimulatedConnectivity};
use mms_core::error::CoreError;
use mms_core::ids::ServiceId;
use mms_core::notify::LogNotifier;
use mms_core::pdu::JsonPduCodec;
use mms_core::service::TransactionBundle;
use mms_core::store::InMemoryStore;
use mms_core::time::{Clock, SystemClock};
use mms_core::{EngineParts, MmsEngine};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("core: {0}")]
    Core(#[from] CoreError),
    #[error("bind {0}")]
    Bind(String),
}

#[derive(Clone)]
struct DaemonState {
    engine: Arc<MmsEngine>,
    connectivity: SimulatedConnectivity,
    store: InMemoryStore,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("mms.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    cfg.validate()?;
    init_logging(&cfg);
    let state = build_state(&cfg)?;
    if cfg.service.scan_on_start {
        state.engine.handle().scan()?;
    }
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (addr, server) =
        start_control_server(state.clone(), &cfg.control.bind_addr, shutdown_rx).await?;
    info!("control server listening on {}", addr);
    let _ = signal::ctrl_c().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    state.engine.shutdown().await;
    Ok(())
}

fn init_logging(cfg: &DaemonConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

fn build_state(cfg: &DaemonConfig) -> Result<DaemonState, DaemonError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = InMemoryStore::new(clock.clone());
    let mode = match cfg.network.lease {
        LeaseConfig::Active => LeaseMode::Active,
        LeaseConfig::Deferred => LeaseMode::Deferred,
    };
    let connectivity = SimulatedConnectivity::new(cfg.network.available, mode);
    let transport = MmscHttpClient::new(cfg.mmsc.timeout_secs)?;
    let engine = MmsEngine::start(
        cfg.core_config(),
        cfg.retry.clone(),
        EngineParts {
            store: Arc::new(store.clone()),
            transport: Arc::new(transport),
            codec: Arc::new(JsonPduCodec),
            connectivity: Arc::new(connectivity.clone()),
            notifier: Arc::new(LogNotifier),
            clock,
            alarm: None,
        },
    )?;
    Ok(DaemonState {
        engine: Arc::new(engine),
        connectivity,
        store,
    })
}

async fn start_control_server(
    state: DaemonState,
    bind_addr: &str,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, JoinHandle<()>), DaemonError> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|_| DaemonError::Bind(bind_addr.to_string()))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| DaemonError::Bind(err.to_string()))?;
    let local = listener
        .local_addr()
        .map_err(|err| DaemonError::Bind(err.to_string()))?;
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let conn_state = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = conn_state.clone();
                                    async move { handle_request(state, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(err) => {
                            warn!("control server accept failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }
    });
    Ok((local, handle))
}

async fn handle_request<B>(
    state: DaemonState,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Display,
{
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let handle = state.engine.handle();
    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/health") => json_response(StatusCode::OK, serde_json::json!({"status":"ok"})),
        ("GET", "/stats") => {
            let snapshot = handle.snapshot().await;
            let body = serde_json::json!({
                "processing": snapshot.processing,
                "pending": snapshot.pending,
                "open_units": snapshot.open_units,
                "pending_operations": state.store.pending_len().await,
                "sent_last_minute": state.engine.rate().sent_in_window(),
            });
            json_response(StatusCode::OK, body)
        }
        ("POST", "/scan") => submitted(handle.scan()),
        ("POST", "/launch") => match read_json::<TransactionBundle, B>(req).await {
            Ok(bundle) => submitted(handle.launch(bundle)),
            Err(err) => error_response(StatusCode::BAD_REQUEST, err),
        },
        ("POST", "/network") => match read_json::<NetworkEvent, B>(req).await {
            Ok(event) => {
                apply_network_event(&state.connectivity, &event);
                match handle.network_changed(event) {
                    Ok(()) => json_response(
                        StatusCode::ACCEPTED,
                        serde_json::json!({"status":"accepted"}),
                    ),
                    Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
                }
            }
            Err(err) => error_response(StatusCode::BAD_REQUEST, err),
        },
        _ => error_response(StatusCode::NOT_FOUND, "not found".to_string()),
    };
    Ok(response)
}

/// Mirrors a reported radio change onto the simulated connectivity.
fn apply_network_event(connectivity: &SimulatedConnectivity, event: &NetworkEvent) {
    if event.kind != NetworkKind::Mobile {
        return;
    }
    connectivity.set_connected(event.connected);
    if event.enables_mms() {
        connectivity.set_mode(LeaseMode::Active);
    }
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, String>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Display,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|err| err.to_string())?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|err| err.to_string())
}

fn submitted(result: Result<ServiceId, CoreError>) -> Response<Full<Bytes>> {
    match result {
        Ok(service_id) => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({"service_id": service_id.0}),
        ),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({"error": message}))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

#[cfg(test)]
mod tests;
