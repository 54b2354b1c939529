mod common;

use std::time::Duration;

use common::{spawn_stub_upstream, spawn_stub_with_encryption};
use tds_common::ProxyConfig;
use tds_harness::engine::client::{DbClientConfig, DbClientExecutor, TdsClientExecutor};
use tds_harness::engine::credentials::credential_map;
use tds_harness::engine::proxy::accept_backoff;
use tds_harness::parser::tds::{EncryptionMode, Value};
use tds_harness::{HarnessError, InProcessProxyService, ProxyService};
use tokio::net::TcpStream;

fn client_config(proxy: &InProcessProxyService, database: &str, read_only: bool) -> DbClientConfig {
    DbClientConfig {
        host: proxy.host().to_string(),
        port: proxy.port().to_string(),
        username: "dummy".to_string(),
        password: "dummy".to_string(),
        database: database.to_string(),
        read_only,
    }
}

#[tokio::test]
async fn test_missing_upstream_address_is_construction_error() {
    let creds = credential_map([("user", "alice")]);
    let err = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .err()
        .expect("construction should fail");
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));
}

#[tokio::test]
async fn test_non_numeric_port_is_construction_error() {
    let creds = credential_map([("host", "127.0.0.1"), ("port", "sql")]);
    let err = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .err()
        .expect("construction should fail");
    assert!(matches!(err, HarnessError::ProxyConstruction(_)));
}

#[tokio::test]
async fn test_bound_port_is_never_zero() {
    let creds = credential_map([("host", "127.0.0.1"), ("port", "1433")]);
    let proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    assert_eq!(proxy.host(), "127.0.0.1");
    assert_ne!(proxy.port(), "0");
    assert!(proxy.port().parse::<u16>().unwrap() > 0);
    assert_eq!(proxy.upstream(), "127.0.0.1:1433");
}

#[tokio::test]
async fn test_injects_credentials_into_login() {
    tds_harness::logging::init_test_logging();
    let mut upstream = spawn_stub_upstream(Value::Int(1)).await;
    let creds = credential_map([
        ("host", "127.0.0.1"),
        ("port", upstream.port.as_str()),
        ("user", "alice"),
        ("password", "pw"),
    ]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.start().unwrap();

    let out = TdsClientExecutor::default()
        .execute(client_config(&proxy, "tempdb", true), "SELECT 1".to_string())
        .await
        .unwrap();
    assert_eq!(out, "1");

    let login = upstream.logins.recv().await.unwrap();
    assert_eq!(login.username, "alice");
    assert_eq!(login.password, "pw");
    assert_eq!(login.database, "tempdb");
    assert!(login.read_only());
    assert_eq!(upstream.queries.recv().await.unwrap(), "SELECT 1");

    proxy.stop();
}

#[tokio::test]
async fn test_oversized_injected_username_is_not_forwarded() {
    let mut upstream = spawn_stub_upstream(Value::Int(1)).await;
    let long_user = "u".repeat(70_000);
    let creds = credential_map([
        ("host", "127.0.0.1"),
        ("port", upstream.port.as_str()),
        ("username", long_user.as_str()),
    ]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.start().unwrap();

    let err = TdsClientExecutor::default()
        .execute(client_config(&proxy, "tempdb", false), "SELECT 1".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Client(_)));
    assert!(upstream.logins.try_recv().is_err());

    proxy.stop();
}

#[tokio::test]
async fn test_without_auth_credentials_login_passes_through() {
    let mut upstream = spawn_stub_upstream(Value::Int(7)).await;
    let creds = credential_map([("host", "127.0.0.1"), ("port", upstream.port.as_str())]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.start().unwrap();

    let out = TdsClientExecutor::default()
        .execute(client_config(&proxy, "master", false), "SELECT 7".to_string())
        .await
        .unwrap();
    assert_eq!(out, "7");

    let login = upstream.logins.recv().await.unwrap();
    assert_eq!(login.username, "dummy");
    assert_eq!(login.password, "dummy");
    assert!(!login.read_only());
}

#[tokio::test]
async fn test_upstream_requiring_tls_fails_the_client() {
    let upstream = spawn_stub_with_encryption(Value::Int(1), EncryptionMode::Required).await;
    let creds = credential_map([("host", "127.0.0.1"), ("port", upstream.port.as_str())]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.start().unwrap();

    let err = TdsClientExecutor::default()
        .execute(client_config(&proxy, "master", false), "SELECT 1".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Client(_)));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_safe_before_start() {
    let creds = credential_map([("host", "127.0.0.1"), ("port", "1433")]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.stop();
    proxy.stop();
    assert!(matches!(proxy.start(), Err(HarnessError::ProxyConstruction(_))));
    proxy.stop();
}

#[tokio::test]
async fn test_second_start_fails() {
    let creds = credential_map([("host", "127.0.0.1"), ("port", "1433")]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.start().unwrap();
    assert!(proxy.start().is_err());
    proxy.stop();
}

#[tokio::test]
async fn test_stop_releases_listening_port() {
    let creds = credential_map([("host", "127.0.0.1"), ("port", "1433")]);
    let mut proxy = InProcessProxyService::new(creds, ProxyConfig::default())
        .await
        .unwrap();
    proxy.start().unwrap();
    let addr = format!("{}:{}", proxy.host(), proxy.port());
    assert!(TcpStream::connect(&addr).await.is_ok());

    proxy.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(&addr).await.is_err());
}

#[test]
fn accept_backoff_grows_and_caps() {
    assert_eq!(accept_backoff(0), Duration::ZERO);
    assert_eq!(accept_backoff(1), Duration::from_millis(10));
    assert_eq!(accept_backoff(2), Duration::from_millis(20));
    assert_eq!(accept_backoff(5), Duration::from_millis(160));
    assert_eq!(accept_backoff(8), Duration::from_secs(1));
    assert_eq!(accept_backoff(40), Duration::from_secs(1));
    assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
}
