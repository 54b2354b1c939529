//! Request orchestration: one proxy, one client run, and optionally one mock
//! capture per call.

use crate::engine::client::{concurrent_client_exec, ClientResult, DbClientConfig, DbClientExecutor};
use crate::engine::credentials::{target_credentials, CredentialMap};
use crate::engine::mock::{MockTarget, MockTargetCapture};
use crate::engine::proxy::{InProcessProxyFactory, ProxyService, ProxyServiceFactory};
use crate::error::{HarnessError, Result};
use tracing::{debug, info};

/// The proxy injects the real credentials; the client only sends these.
const PLACEHOLDER_USERNAME: &str = "dummy";
const PLACEHOLDER_PASSWORD: &str = "dummy";

/// Client-controlled parameters of one database interaction. Credentials
/// travel separately.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientRequest {
    pub database: String,
    pub read_only: bool,
    pub query: String,
}

#[derive(Debug)]
pub struct ProxyResponse {
    /// Port the proxy actually bound.
    pub proxy_port: String,
    pub client: ClientResult,
}

#[derive(Debug)]
pub struct MockResponse {
    pub proxy_port: String,
    pub capture: Result<MockTargetCapture>,
}

/// Stops the wrapped service on every exit path.
struct ProxyGuard<S: ProxyService>(S);

impl<S: ProxyService> Drop for ProxyGuard<S> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

impl ClientRequest {
    pub fn new(database: impl Into<String>, read_only: bool, query: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            read_only,
            query: query.into(),
        }
    }

    /// Runs the client through a fresh in-process proxy built from
    /// `credentials`. The proxy takes ownership of the map and zeroizes it
    /// when stopped, so pass a clone if the caller needs the values again.
    pub async fn proxy_request<E>(&self, executor: &E, credentials: CredentialMap) -> Result<ProxyResponse>
    where
        E: DbClientExecutor + Clone,
    {
        self.proxy_request_via(&InProcessProxyFactory::default(), executor, credentials)
            .await
    }

    pub async fn proxy_request_via<F, E>(
        &self,
        factory: &F,
        executor: &E,
        credentials: CredentialMap,
    ) -> Result<ProxyResponse>
    where
        F: ProxyServiceFactory,
        E: DbClientExecutor + Clone,
    {
        let mut proxy = ProxyGuard(factory.create(credentials).await?);
        proxy.0.start()?;

        let config = DbClientConfig {
            host: proxy.0.host().to_string(),
            port: proxy.0.port().to_string(),
            username: PLACEHOLDER_USERNAME.to_string(),
            password: PLACEHOLDER_PASSWORD.to_string(),
            database: self.database.clone(),
            read_only: self.read_only,
        };
        debug!(config = ?config, query = %self.query, "Submitting client request through proxy");

        let client = concurrent_client_exec(executor, config, self.query.clone())
            .await
            .unwrap_or_else(|_| {
                Err(HarnessError::Client(
                    "client task ended without a result".to_string(),
                ))
            });
        let proxy_port = proxy.0.port().to_string();
        drop(proxy);

        info!(proxy_port = %proxy_port, ok = client.is_ok(), "Proxy request finished");
        Ok(ProxyResponse { proxy_port, client })
    }

    /// Creates a mock target on an ephemeral port, aims the proxy at it and
    /// returns what the mock captured. The mock is closed before returning.
    pub async fn proxy_to_created_mock<E>(
        &self,
        executor: &E,
        credentials: CredentialMap,
    ) -> Result<MockResponse>
    where
        E: DbClientExecutor + Clone,
    {
        self.proxy_to_created_mock_via(&InProcessProxyFactory::default(), executor, credentials)
            .await
    }

    pub async fn proxy_to_created_mock_via<F, E>(
        &self,
        factory: &F,
        executor: &E,
        credentials: CredentialMap,
    ) -> Result<MockResponse>
    where
        F: ProxyServiceFactory,
        E: DbClientExecutor + Clone,
    {
        let mock = MockTarget::new("0").await?;
        let response = self
            .proxy_to_mock_via(factory, executor, credentials, &mock)
            .await;
        mock.close();
        response
    }

    /// Like [`proxy_to_created_mock`](Self::proxy_to_created_mock) against a
    /// caller-owned mock, which stays open.
    pub async fn proxy_to_mock<E>(
        &self,
        executor: &E,
        credentials: CredentialMap,
        mock: &MockTarget,
    ) -> Result<MockResponse>
    where
        E: DbClientExecutor + Clone,
    {
        self.proxy_to_mock_via(&InProcessProxyFactory::default(), executor, credentials, mock)
            .await
    }

    pub async fn proxy_to_mock_via<F, E>(
        &self,
        factory: &F,
        executor: &E,
        credentials: CredentialMap,
        mock: &MockTarget,
    ) -> Result<MockResponse>
    where
        F: ProxyServiceFactory,
        E: DbClientExecutor + Clone,
    {
        let credentials = target_credentials(mock.host(), mock.port(), credentials);
        // Armed before the client starts so the handshake cannot be missed.
        let accept = mock.accept()?;

        let response = self.proxy_request_via(factory, executor, credentials).await?;
        if let Err(e) = &response.client {
            // The mock hangs up mid-login, so the client is expected to fail.
            debug!(error = %e, "Discarding client result");
        }

        let capture = accept.capture().await;
        Ok(MockResponse {
            proxy_port: response.proxy_port,
            capture,
        })
    }
}
