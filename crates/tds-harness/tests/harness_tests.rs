mod common;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::spawn_stub_upstream;
use tds_harness::engine::client::{ClientResult, DbClientConfig, DbClientExecutor};
use tds_harness::engine::credentials::{clone_credentials, credential_map, CredentialMap};
use tds_harness::parser::tds::Value;
use tds_harness::{
    ClientRequest, HarnessError, InProcessProxyService, MockTarget, ProxyService,
    ProxyServiceFactory, TdsClientExecutor,
};
use tokio::sync::mpsc;

fn assert_valid_port(port: &str) {
    assert_ne!(port, "0");
    let n: u16 = port.parse().expect("port should be decimal");
    assert!(n >= 1);
}

struct FailingFactory;

impl ProxyServiceFactory for FailingFactory {
    type Service = InProcessProxyService;

    fn create(
        &self,
        _credentials: CredentialMap,
    ) -> impl Future<Output = tds_harness::Result<Self::Service>> + Send {
        async {
            Err::<InProcessProxyService, _>(HarnessError::ProxyConstruction(
                "injected constructor failure".to_string(),
            ))
        }
    }
}

/// Hands out services that count every `stop` call.
struct CountingFactory {
    stops: Arc<AtomicUsize>,
    fail_start: bool,
}

struct CountingService {
    stops: Arc<AtomicUsize>,
    fail_start: bool,
}

impl ProxyService for CountingService {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> &str {
        "4242"
    }

    fn start(&mut self) -> tds_harness::Result<()> {
        if self.fail_start {
            return Err(HarnessError::ProxyConstruction(
                "injected start failure".to_string(),
            ));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl ProxyServiceFactory for CountingFactory {
    type Service = CountingService;

    fn create(
        &self,
        _credentials: CredentialMap,
    ) -> impl Future<Output = tds_harness::Result<Self::Service>> + Send {
        let service = CountingService {
            stops: Arc::clone(&self.stops),
            fail_start: self.fail_start,
        };
        async move { Ok::<_, HarnessError>(service) }
    }
}

/// Reports how many times the proxy had been stopped when the client ran.
#[derive(Clone)]
struct StopObservingExecutor {
    stops: Arc<AtomicUsize>,
}

impl DbClientExecutor for StopObservingExecutor {
    fn execute(
        &self,
        _config: DbClientConfig,
        _query: String,
    ) -> impl Future<Output = ClientResult> + Send {
        let stops = Arc::clone(&self.stops);
        async move {
            let out: ClientResult = Ok(stops.load(Ordering::SeqCst).to_string());
            out
        }
    }
}

/// Records the config it was given and returns a canned answer without
/// touching the network.
#[derive(Clone)]
struct RecordingExecutor {
    seen: mpsc::UnboundedSender<DbClientConfig>,
}

impl DbClientExecutor for RecordingExecutor {
    fn execute(
        &self,
        config: DbClientConfig,
        _query: String,
    ) -> impl Future<Output = ClientResult> + Send {
        let seen = self.seen.clone();
        async move {
            let _ = seen.send(config);
            let out: ClientResult = Ok("recorded".to_string());
            out
        }
    }
}

#[derive(Clone)]
struct PanickingExecutor;

impl DbClientExecutor for PanickingExecutor {
    fn execute(
        &self,
        config: DbClientConfig,
        _query: String,
    ) -> impl Future<Output = ClientResult> + Send {
        async move {
            if !config.database.is_empty() {
                panic!("client blew up");
            }
            let out: ClientResult = Ok(String::new());
            out
        }
    }
}

#[tokio::test]
async fn test_proxy_request_happy_path() {
    tds_harness::logging::init_test_logging();
    let mut upstream = spawn_stub_upstream(Value::Int(1)).await;
    let request = ClientRequest::new("tempdb", false, "SELECT 1");
    let creds = credential_map([
        ("host", "127.0.0.1"),
        ("port", upstream.port.as_str()),
        ("user", "alice"),
        ("password", "pw"),
    ]);

    let response = request
        .proxy_request(&TdsClientExecutor::default(), creds)
        .await
        .unwrap();

    assert_eq!(response.client.unwrap(), "1");
    assert_valid_port(&response.proxy_port);
    let login = upstream.logins.recv().await.unwrap();
    assert_eq!(login.username, "alice");
    assert_eq!(login.password, "pw");
}

#[tokio::test]
async fn test_proxy_request_sends_placeholder_credentials() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = ClientRequest::new("reports", true, "SELECT 2");
    let creds = credential_map([("host", "127.0.0.1"), ("port", "1433")]);

    let response = request
        .proxy_request(&RecordingExecutor { seen: tx }, creds)
        .await
        .unwrap();
    assert_eq!(response.client.unwrap(), "recorded");

    let config = rx.recv().await.unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, response.proxy_port);
    assert_eq!(config.username, "dummy");
    assert_eq!(config.password, "dummy");
    assert_eq!(config.database, "reports");
    assert!(config.read_only);
}

#[tokio::test]
async fn test_proxy_request_surfaces_client_error() {
    // nothing listens behind the proxy's upstream address
    let dead = tds_harness::open_loopback_listener("0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port().to_string();
    drop(dead);

    let request = ClientRequest::new("tempdb", false, "SELECT 1");
    let creds = credential_map([("host", "127.0.0.1"), ("port", dead_port.as_str())]);
    let response = request
        .proxy_request(&TdsClientExecutor::default(), creds)
        .await
        .unwrap();

    assert_valid_port(&response.proxy_port);
    assert!(matches!(response.client, Err(HarnessError::Client(_))));
}

#[tokio::test]
async fn test_proxy_request_survives_client_panic() {
    let request = ClientRequest::new("tempdb", false, "SELECT 1");
    let creds = credential_map([("host", "127.0.0.1"), ("port", "1433")]);
    let response = request
        .proxy_request(&PanickingExecutor, creds)
        .await
        .unwrap();
    assert!(matches!(response.client, Err(HarnessError::Client(_))));
}

#[tokio::test]
async fn test_empty_credentials_are_rejected_at_construction() {
    let request = ClientRequest::new("tempdb", false, "SELECT 1");
    let err = request
        .proxy_request(&TdsClientExecutor::default(), CredentialMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));
}

#[tokio::test]
async fn test_caller_credentials_survive_cloned_handoff() {
    let upstream = spawn_stub_upstream(Value::Int(1)).await;
    let original = credential_map([
        ("host", "127.0.0.1"),
        ("port", upstream.port.as_str()),
        ("password", "secret"),
    ]);

    let request = ClientRequest::new("tempdb", false, "SELECT 1");
    let response = request
        .proxy_request(&TdsClientExecutor::default(), clone_credentials(&original))
        .await
        .unwrap();
    assert!(response.client.is_ok());

    assert_eq!(original["password"], b"secret".to_vec());
}

#[tokio::test]
async fn test_mock_rendezvous_captures_client_parameters() {
    let request = ClientRequest::new("x", true, "SELECT 1");
    let creds = credential_map([("user", "u")]);

    let response = request
        .proxy_to_created_mock(&TdsClientExecutor::default(), creds)
        .await
        .unwrap();

    let capture = response.capture.unwrap();
    assert_eq!(capture.database(), "x");
    assert!(capture.read_only());
    assert_eq!(capture.username(), "u");
    assert_valid_port(&response.proxy_port);
}

#[tokio::test]
async fn test_caller_host_and_port_are_overridden() {
    let request = ClientRequest::new("x", false, "SELECT 1");
    let creds = credential_map([("host", "10.0.0.1"), ("port", "9999"), ("user", "u")]);

    let response = tokio::time::timeout(
        Duration::from_secs(10),
        request.proxy_to_created_mock(&TdsClientExecutor::default(), creds),
    )
    .await
    .unwrap()
    .unwrap();

    let capture = response.capture.unwrap();
    assert_eq!(capture.username(), "u");
    assert!(capture.peer_addr.ip().is_loopback());
}

#[tokio::test]
async fn test_shared_mock_serves_two_requests() {
    let mock = MockTarget::new("0").await.unwrap();
    let executor = TdsClientExecutor::default();

    let first = ClientRequest::new("one", false, "SELECT 1")
        .proxy_to_mock(&executor, credential_map([("user", "a")]), &mock)
        .await
        .unwrap();
    let second = ClientRequest::new("two", true, "SELECT 1")
        .proxy_to_mock(&executor, credential_map([("user", "b")]), &mock)
        .await
        .unwrap();

    let first_capture = first.capture.unwrap();
    let second_capture = second.capture.unwrap();
    assert_eq!(first_capture.database(), "one");
    assert_eq!(first_capture.username(), "a");
    assert_eq!(second_capture.database(), "two");
    assert!(second_capture.read_only());
    assert_ne!(first.proxy_port, second.proxy_port);
    assert_ne!(first.proxy_port, mock.port());

    // the caller still owns the mock
    assert!(!mock.is_closed());
    assert!(mock.accept().is_ok());
}

#[tokio::test]
async fn test_injected_construction_failure() {
    let request = ClientRequest::new("tempdb", false, "SELECT 1");

    let err = request
        .proxy_request_via(
            &FailingFactory,
            &TdsClientExecutor::default(),
            credential_map([("user", "u")]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));

    let err = request
        .proxy_to_created_mock_via(
            &FailingFactory,
            &TdsClientExecutor::default(),
            credential_map([("user", "u")]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));
}

#[tokio::test]
async fn test_construction_failure_releases_shared_mock_accept() {
    let mock = MockTarget::new("0").await.unwrap();
    let request = ClientRequest::new("tempdb", false, "SELECT 1");

    let err = request
        .proxy_to_mock_via(
            &FailingFactory,
            &TdsClientExecutor::default(),
            credential_map([("user", "u")]),
            &mock,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));
    assert!(mock.accept().is_ok());
}

#[test]
fn client_request_equality_is_structural() {
    let a = ClientRequest::new("db", true, "SELECT 1");
    let b = ClientRequest {
        database: "db".to_string(),
        read_only: true,
        query: "SELECT 1".to_string(),
    };
    assert_eq!(a, b);
    assert_ne!(a, ClientRequest::new("db", false, "SELECT 1"));
}

#[tokio::test]
async fn test_failed_start_still_stops_proxy_once() {
    let stops = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        stops: Arc::clone(&stops),
        fail_start: true,
    };
    let executor = StopObservingExecutor {
        stops: Arc::clone(&stops),
    };

    let err = ClientRequest::new("tempdb", false, "SELECT 1")
        .proxy_request_via(&factory, &executor, credential_map([("user", "u")]))
        .await
        .unwrap_err();

    match err {
        HarnessError::ProxyConstruction(msg) => assert_eq!(msg, "injected start failure"),
        other => panic!("expected start failure, got {:?}", other),
    }
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_proxy_stopped_after_client_and_before_return() {
    let stops = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        stops: Arc::clone(&stops),
        fail_start: false,
    };
    let executor = StopObservingExecutor {
        stops: Arc::clone(&stops),
    };

    let response = ClientRequest::new("tempdb", false, "SELECT 1")
        .proxy_request_via(&factory, &executor, credential_map([("user", "u")]))
        .await
        .unwrap();

    // still running while the client executed
    assert_eq!(response.client.unwrap(), "0");
    assert_eq!(response.proxy_port, "4242");
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mock_variant_stops_proxy_on_failed_start() {
    let stops = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        stops: Arc::clone(&stops),
        fail_start: true,
    };
    let executor = StopObservingExecutor {
        stops: Arc::clone(&stops),
    };

    let err = ClientRequest::new("tempdb", false, "SELECT 1")
        .proxy_to_created_mock_via(&factory, &executor, credential_map([("user", "u")]))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}
