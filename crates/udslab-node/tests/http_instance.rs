//! Instance transport tests over real listeners

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use udslab_engine::{BuiltinRecord, DiagnosticEngine, EngineConfig};
use udslab_node::{Instance, InstanceConfig, InstanceInfo, InstanceRecord, ListenerConfig};

fn demo_engine() -> Arc<DiagnosticEngine> {
    let config = EngineConfig {
        builtins: vec![BuiltinRecord::fixed(0xF190, b"TESTVIN123".to_vec())],
        ..EngineConfig::default()
    };
    Arc::new(DiagnosticEngine::new(config).unwrap())
}

fn instance_config(listener: ListenerConfig, registry_url: &str, register: bool) -> InstanceConfig {
    InstanceConfig {
        info: InstanceInfo {
            id: "0x01".into(),
            name: "test-device".into(),
            description: "instance under test".into(),
        },
        listener,
        registry_url: registry_url.into(),
        register,
    }
}

/// Start an instance on an ephemeral TCP port, return its base url.
async fn spawn_instance(registry_url: &str, register: bool) -> String {
    let config = instance_config(
        ListenerConfig::Tcp {
            addr: "127.0.0.1:0".into(),
        },
        registry_url,
        register,
    );
    let bound = Instance::new(demo_engine(), config)
        .unwrap()
        .bind()
        .await
        .unwrap();
    let addr = bound
        .external_addr()
        .strip_prefix("tcp:")
        .unwrap()
        .to_string();
    tokio::spawn(async move {
        let _ = bound.serve().await;
    });
    format!("http://{addr}")
}

/// Mock registry answering `status` on POST /instances and recording bodies.
async fn spawn_registry(
    status: StatusCode,
) -> (String, Arc<tokio::sync::Mutex<Vec<InstanceRecord>>>) {
    #[derive(Clone)]
    struct RegistryState {
        records: Arc<tokio::sync::Mutex<Vec<InstanceRecord>>>,
        status: StatusCode,
    }

    async fn create_instance(
        State(state): State<RegistryState>,
        Json(record): Json<InstanceRecord>,
    ) -> StatusCode {
        state.records.lock().await.push(record);
        state.status
    }

    let records = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/instances", post(create_instance))
        .with_state(RegistryState {
            records: records.clone(),
            status,
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), records)
}

#[tokio::test]
async fn tcp_round_trip() {
    let base = spawn_instance("", false).await;
    let client = reqwest::Client::new();

    let resp: serde_json::Value = client
        .post(format!("{base}/uds"))
        .json(&serde_json::json!({"sid": "22", "data": "f190"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["sid"], "62");
    assert_eq!(resp["data"], format!("f190{}", hex::encode(b"TESTVIN123")));

    // unsupported service comes back as a negative frame, still HTTP 200
    let resp: serde_json::Value = client
        .post(format!("{base}/uds"))
        .json(&serde_json::json!({"sid": "19", "data": "01"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["sid"], "7f");
    assert_eq!(resp["data"], "1911");
}

#[tokio::test]
async fn malformed_frames_are_http_400() {
    let base = spawn_instance("", false).await;
    let client = reqwest::Client::new();

    // odd-length data hex
    let resp = client
        .post(format!("{base}/uds"))
        .json(&serde_json::json!({"sid": "22", "data": "f19"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // multi-byte sid
    let resp = client
        .post(format!("{base}/uds"))
        .json(&serde_json::json!({"sid": "2762", "data": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn registration_record_reaches_registry() {
    let (registry_url, records) = spawn_registry(StatusCode::CREATED).await;
    let base = spawn_instance(&registry_url, true).await;

    let stored = records.lock().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "0x01");
    assert_eq!(stored[0].name, "test-device");
    assert!(stored[0].addr.starts_with("tcp:127.0.0.1:"));
    drop(stored);

    // and the instance actually serves
    let resp = reqwest::Client::new()
        .post(format!("{base}/uds"))
        .json(&serde_json::json!({"sid": "10", "data": "02"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn rejected_registration_fails_startup() {
    let (registry_url, _records) = spawn_registry(StatusCode::INTERNAL_SERVER_ERROR).await;
    let config = instance_config(
        ListenerConfig::Tcp {
            addr: "127.0.0.1:0".into(),
        },
        &registry_url,
        true,
    );
    let err = Instance::new(demo_engine(), config)
        .unwrap()
        .bind()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn empty_identity_rejected() {
    let config = instance_config(
        ListenerConfig::Tcp {
            addr: "127.0.0.1:0".into(),
        },
        "",
        false,
    );
    let mut config = config;
    config.info.name = String::new();
    assert!(Instance::new(demo_engine(), config).is_err());
}

#[tokio::test]
async fn unix_socket_round_trip() {
    let path = std::env::temp_dir().join(format!("udslab-node-test-{}.sock", std::process::id()));
    let config = instance_config(
        ListenerConfig::Unix { path: path.clone() },
        "",
        false,
    );
    let bound = Instance::new(demo_engine(), config)
        .unwrap()
        .bind()
        .await
        .unwrap();
    assert_eq!(
        bound.external_addr(),
        format!("unix:{}", path.display())
    );
    tokio::spawn(async move {
        let _ = bound.serve().await;
    });

    // minimal HTTP/1.1 exchange over the socket
    let body = r#"{"sid":"22","data":"f190"}"#;
    let request = format!(
        "POST /uds HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""sid":"62""#));

    let _ = std::fs::remove_file(&path);
}
