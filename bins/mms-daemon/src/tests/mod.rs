use super::*;
use crate::config::{
    ConfigError, ControlConfig, LoggingConfig, MmscConfig, NetworkConfig, ServiceConfig,
};
use hyper::client::conn::http1 as client_http1;
use mms_core::event::ServiceEvent;
use mms_core::pdu::{GenericPdu, NotificationInd, PduCodec};
use mms_core::policy::RetryPolicy;
use mms_core::store::MessageStore;
use mms_core::transaction::TransactionKind;
use std::time::Duration;
use tempfile::tempdir;


// Nothing listens on the discard port, so relay calls fail fast.
const DEAD_MMSC: &str = "http://127.0.0.1:9/mms";

pub(super) fn test_config() -> DaemonConfig {
    DaemonConfig {
        mmsc: MmscConfig {
            url: DEAD_MMSC.to_string(),
            proxy_address: None,
            proxy_port: None,
            timeout_secs: 2,
        },
        service: ServiceConfig {
            scan_on_start: false,
            ..ServiceConfig::default()
        },
        retry: RetryPolicy::default(),
        network: NetworkConfig::default(),
        control: ControlConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        },
        logging: LoggingConfig {
            level: "error".to_string(),
        },
    }
}

fn build_request(method: &str, path: &str, body: Option<serde_json::Value>) -> Request<Full<Bytes>> {
    let bytes = body
        .map(|value| value.to_string().into_bytes())
        .unwrap_or_default();
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost")
        .body(Full::from(Bytes::from(bytes)))
        .unwrap()
}

async fn call(state: &DaemonState, req: Request<Full<Bytes>>) -> (StatusCode, serde_json::Value) {
    let resp = handle_request(state.clone(), req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mms.toml");
    let cfg = r#"
[mmsc]
url = "http://mmsc.example.com/mms"
proxy_address = "10.0.0.172"
proxy_port = 8080

[service]
auto_retrieve = false
max_concurrent_transactions = 2

[retry]
backoff_schedule_ms = [0, 1000, 5000]
incoming_retry_limit = 3

[network]
available = true
lease = "deferred"

[control]
bind_addr = "127.0.0.1:9180"

[logging]
level = "debug"
"#;
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    loaded.validate().unwrap();
    assert_eq!(loaded.mmsc.proxy_port, Some(8080));
    assert!(!loaded.service.auto_retrieve);
    assert_eq!(loaded.service.lease_extension_ms, 30_000);
    assert_eq!(loaded.retry.backoff_schedule_ms, vec![0, 1000, 5000]);
    assert_eq!(loaded.retry.incoming_retry_limit, 3);
    assert_eq!(loaded.retry.outgoing_retry_limit, 5);
    assert_eq!(loaded.network.lease, LeaseConfig::Deferred);

    let core = loaded.core_config();
    assert!(core.settings.is_proxy_set());
    assert_eq!(core.max_concurrent_transactions, 2);
}

#[tokio::test]
async fn minimal_config_uses_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mms.toml");
    std::fs::write(
        &path,
        "[mmsc]\nurl = \"http://mmsc.example.com/\"\n\n[logging]\nlevel = \"info\"\n",
    )
    .unwrap();
    let loaded = config::load_config(&path).unwrap();
    loaded.validate().unwrap();
    assert_eq!(loaded.retry, RetryPolicy::default());
    assert!(loaded.service.scan_on_start);
    assert!(loaded.network.available);
    assert_eq!(loaded.control.bind_addr, "127.0.0.1:9180");
}

#[tokio::test]
async fn missing_file_is_io_error() {
    let dir = tempdir().unwrap();
    let result = config::load_config(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io)));
}

#[tokio::test]
async fn daemon_starts_and_stops() {
    let cfg = test_config();
    init_logging(&cfg);
    let state = build_state(&cfg).unwrap();
    let (tx, rx) = oneshot::channel();
    let (addr, handle) = start_control_server(state.clone(), &cfg.control.bind_addr, rx)
        .await
        .unwrap();

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = client_http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let resp = sender
        .send_request(build_request("GET", "/health", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    state.engine.shutdown().await;
}

#[tokio::test]
async fn control_endpoints() {
    let cfg = test_config();
    let state = build_state(&cfg).unwrap();

    let (status, body) = call(&state, build_request("GET", "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&state, build_request("GET", "/stats", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processing"], 0);
    assert_eq!(body["pending_operations"], 0);

    let (status, body) = call(&state, build_request("POST", "/scan", None)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["service_id"].as_u64().is_some());

    let (status, _) = call(
        &state,
        build_request("POST", "/launch", Some(serde_json::json!({"kind": "Bogus"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let event = serde_json::to_value(NetworkEvent::mms_apn_ready()).unwrap();
    let (status, _) = call(&state, build_request("POST", "/network", Some(event))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = call(&state, build_request("DELETE", "/scan", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    state.engine.shutdown().await;
}

#[tokio::test]
async fn pushed_notification_fails_against_unreachable_mmsc() {
    let cfg = test_config();
    let state = build_state(&cfg).unwrap();
    let mut events = state.engine.subscribe();

    let ind = NotificationInd {
        transaction_id: b"T-push".to_vec(),
        content_location: "http://127.0.0.1:9/get/1".to_string(),
        from: Some("+15550001".to_string()),
        subject: None,
        message_size: 100,
        expiry_secs: 3600,
    };
    let push = JsonPduCodec
        .compose(&GenericPdu::NotificationInd(ind))
        .unwrap();
    let bundle = serde_json::to_value(TransactionBundle::push(push)).unwrap();
    let (status, _) = call(&state, build_request("POST", "/launch", Some(bundle))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (kind, completed) = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ServiceEvent::TransactionCompleted { kind, state: outcome, .. } = event {
            break (kind, outcome);
        }
    };
    assert_eq!(kind, TransactionKind::Notification);
    assert!(completed.is_failed());
    let uri = completed.content_uri.unwrap();
    assert!(state.store.message(&uri).await.is_some());

    let mut scheduled = false;
    for _ in 0..200 {
        if let Ok(Some(row)) = state.store.pending_for(&uri).await {
            if row.retry_index == 1 {
                scheduled = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduled);
    state.engine.shutdown().await;
}
