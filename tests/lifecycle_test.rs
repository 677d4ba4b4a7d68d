mod common;

use std::sync::{Arc, Mutex};

use common::TestApp;
use mongodb::bson::doc;
use morrigan::config::Config;
use morrigan::lifecycle::{embedded, Server, ServerState};
use morrigan::store::{DocumentStore, MemoryStore};

const ALL_EVENTS: &[&str] = &[
    "initializing",
    "initialized",
    "starting",
    "startingConnected",
    "started",
    "ready",
    "stopping",
    "stopped",
    "error",
];

fn record_events(server: &Server) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for event in ALL_EVENTS {
        let seen = seen.clone();
        server.on(event, move |name| {
            seen.lock().unwrap().push(name.to_string());
        });
    }
    seen
}

fn test_config(state_dir: &std::path::Path) -> Config {
    let mut config = Config {
        state_dir: state_dir.to_path_buf(),
        ..Config::default()
    };
    config.http.port = 0;
    config.auth.bootstrap_password = Some(common::BOOTSTRAP_PASSWORD.to_string());
    config
}

#[tokio::test]
async fn lifecycle_events_fire_in_order_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = embedded(test_config(dir.path()));
    let seen = record_events(&server);

    server.start().await.unwrap();
    assert_eq!(server.state().await, ServerState::Ready);
    server.stop("SIGTERM").await.unwrap();
    assert_eq!(server.state().await, ServerState::Stopped);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "initializing",
            "initialized",
            "starting",
            "startingConnected",
            "started",
            "ready",
            "stopping",
            "stopped",
        ]
    );
}

#[tokio::test]
async fn state_order_is_monotonic() {
    assert!(ServerState::Instanced.order() < ServerState::Initializing.order());
    assert!(ServerState::Initializing.order() < ServerState::Initialized.order());
    assert!(ServerState::Initialized.order() < ServerState::Starting.order());
    assert!(ServerState::Starting.order() < ServerState::StartingConnected.order());
    assert!(ServerState::StartingConnected.order() < ServerState::Started.order());
    assert!(ServerState::Started.order() < ServerState::Ready.order());
    assert!(ServerState::Ready.order() < ServerState::Stopping.order());
    assert!(ServerState::Stopping.order() < ServerState::Stopped.order());
}

#[tokio::test]
async fn stop_before_ready_is_a_silent_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let server = embedded(test_config(dir.path()));

    server.stop("early").await.unwrap();
    assert_eq!(server.state().await, ServerState::Instanced);

    server.setup().await.unwrap();
    server.stop("early").await.unwrap();
    assert_eq!(server.state().await, ServerState::Initialized);
}

#[tokio::test]
async fn concurrent_stops_collapse_to_one_execution() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(embedded(test_config(dir.path())));
    let seen = record_events(&server);

    server.start().await.unwrap();

    let a = {
        let server = server.clone();
        tokio::spawn(async move { server.stop("SIGTERM").await })
    };
    let b = {
        let server = server.clone();
        tokio::spawn(async move { server.stop("SIGTERM").await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.iter().filter(|e| e.as_str() == "stopping").count(),
        1,
        "only one stop executes"
    );
    assert_eq!(seen.iter().filter(|e| e.as_str() == "stopped").count(), 1);
}

#[tokio::test]
async fn setup_is_rejected_outside_instanced() {
    let dir = tempfile::tempdir().unwrap();
    let server = embedded(test_config(dir.path()));

    server.setup().await.unwrap();
    assert!(server.setup().await.is_err(), "second setup is rejected");

    // start() from Initialized is the normal path and still works.
    server.start().await.unwrap();
    assert!(server.start().await.is_err(), "start from Ready is rejected");

    server.stop("test over").await.unwrap();
}

#[tokio::test]
async fn unknown_component_drives_setup_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config
        .components
        .insert("telemetry".to_string(), serde_json::json!({}));
    let server = embedded(config);

    assert!(server.setup().await.is_err());
    assert_eq!(server.state().await, ServerState::Error);
    let captured = server.captured_error().expect("captured error");
    assert!(captured.contains("telemetry"));
}

#[tokio::test]
async fn graceful_stop_finalizes_the_instance_row_and_listener() {
    let app = TestApp::spawn().await;
    let instance_id = app.server.instance_id().to_string();

    // While ready the instance row is live.
    let row = app
        .store
        .find_one("instances", doc! { "_id": instance_id.as_str() })
        .await
        .unwrap()
        .unwrap();
    assert!(row.get_bool("live").unwrap());

    app.server.stop("SIGTERM").await.unwrap();

    let row = app
        .store
        .find_one("instances", doc! { "_id": instance_id.as_str() })
        .await
        .unwrap()
        .unwrap();
    assert!(!row.get_bool("live").unwrap());
    assert_eq!(row.get_str("stopReason").unwrap(), "SIGTERM");

    // The listener no longer takes connections.
    let result = app.http.get(app.url("/api-docs")).send().await;
    assert!(result.is_err(), "listener is closed after stop");

    // No component reported a hook failure.
    assert!(app.server.component_errors().await.is_empty());
}

#[tokio::test]
async fn missing_bootstrap_password_fails_start_on_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.auth.bootstrap_password = None;
    let server = Server::with_data_store(config, Arc::new(MemoryStore::new()));

    assert!(server.start().await.is_err());
    assert_eq!(server.state().await, ServerState::Error);
}

#[tokio::test]
async fn instance_row_lists_active_components() {
    let app = TestApp::spawn().await;

    let row = app
        .store
        .find_one("instances", doc! { "_id": app.server.instance_id() })
        .await
        .unwrap()
        .unwrap();
    let components: Vec<&str> = row
        .get_array("components")
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(components.contains(&"auth"));
    assert!(components.contains(&"client"));

    app.server.stop("test over").await.unwrap();
}
