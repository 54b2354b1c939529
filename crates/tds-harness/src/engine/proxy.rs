//! In-process proxy service that injects credentials into TDS logins.
//!
//! The service binds an ephemeral loopback port when it is constructed and
//! forwards every accepted connection to the upstream named by the `host` and
//! `port` credentials. PRELOGIN is relayed untouched; LOGIN7 is rewritten with
//! the `username`/`password` credentials before it reaches the upstream. After
//! that the connection is a plain byte relay.

use crate::engine::credentials::{
    zeroize_credentials, CredentialMap, HOST_KEY, PASSWORD_KEY, PORT_KEY, USERNAME_KEY, USER_KEY,
};
use crate::engine::listener::{bound_port, open_loopback_listener, LOOPBACK_HOST};
use crate::engine::wire::{expect_message, write_message};
use crate::error::{HarnessError, Result};
use crate::metrics;
use crate::parser::tds::{encode_login7, packet_type, parse_login7, parse_prelogin, Login7};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tds_common::ProxyConfig;
use tokio::io;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

pub static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying after `failures` consecutive accept errors.
/// Doubles from 10ms and caps at one second.
pub fn accept_backoff(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    ACCEPT_BACKOFF_BASE
        .checked_mul(factor)
        .map_or(ACCEPT_BACKOFF_MAX, |d| d.min(ACCEPT_BACKOFF_MAX))
}

/// A proxy whose lifetime is scoped to one orchestration call.
pub trait ProxyService: Send {
    fn host(&self) -> &str;
    fn port(&self) -> &str;
    /// `host:port` must be dialable once this returns.
    fn start(&mut self) -> Result<()>;
    /// Idempotent, and safe before `start` or after a failed one.
    fn stop(&mut self);
}

/// Builds a fresh proxy service from a credential map it takes ownership of.
pub trait ProxyServiceFactory: Send + Sync {
    type Service: ProxyService;

    fn create(
        &self,
        credentials: CredentialMap,
    ) -> impl Future<Output = Result<Self::Service>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct InProcessProxyFactory {
    config: ProxyConfig,
}

impl InProcessProxyFactory {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }
}

impl ProxyServiceFactory for InProcessProxyFactory {
    type Service = InProcessProxyService;

    fn create(
        &self,
        credentials: CredentialMap,
    ) -> impl Future<Output = Result<Self::Service>> + Send {
        InProcessProxyService::new(credentials, self.config.clone())
    }
}

struct ProxyConnectionGuard;

impl ProxyConnectionGuard {
    fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for ProxyConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InProcessProxyService {
    host: String,
    port: String,
    upstream: String,
    listener: Option<TcpListener>,
    credentials: Arc<DashMap<String, Vec<u8>>>,
    config: Arc<ProxyConfig>,
    shutdown: CancellationToken,
    stopped: bool,
}

impl InProcessProxyService {
    /// Validates the upstream address and binds the listening port.
    pub async fn new(mut credentials: CredentialMap, config: ProxyConfig) -> Result<Self> {
        let bound = async {
            let upstream = upstream_address(&credentials)?;
            let listener = open_loopback_listener(&config.listen_port).await?;
            let port = bound_port(&listener)?;
            Ok::<_, HarnessError>((upstream, listener, port))
        }
        .await;
        let (upstream, listener, port) = match bound {
            Ok(parts) => parts,
            Err(e) => {
                zeroize_credentials(&mut credentials);
                return Err(e);
            }
        };
        metrics::register_metrics();

        Ok(Self {
            host: LOOPBACK_HOST.to_string(),
            port,
            upstream,
            listener: Some(listener),
            credentials: Arc::new(credentials.into_iter().collect()),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            stopped: false,
        })
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }
}

impl ProxyService for InProcessProxyService {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> &str {
        &self.port
    }

    fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(HarnessError::ProxyConstruction(
                "proxy service already stopped".to_string(),
            ));
        }
        let listener = self.listener.take().ok_or_else(|| {
            HarnessError::ProxyConstruction("proxy service already started".to_string())
        })?;

        info!(
            listen_addr = %format!("{}:{}", self.host, self.port),
            upstream = %self.upstream,
            "In-process proxy service started"
        );
        tokio::spawn(accept_loop(
            listener,
            self.upstream.clone(),
            Arc::clone(&self.credentials),
            Arc::clone(&self.config),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();
        self.listener = None;
        for mut entry in self.credentials.iter_mut() {
            entry.value_mut().as_mut_slice().zeroize();
        }
        info!(port = %self.port, "In-process proxy service stopped");
    }
}

impl Drop for InProcessProxyService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn credential_str<'a>(credentials: &'a CredentialMap, key: &str) -> Result<&'a str> {
    let raw = credentials
        .get(key)
        .ok_or_else(|| HarnessError::ProxyConstruction(format!("missing credential `{}`", key)))?;
    std::str::from_utf8(raw)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            HarnessError::ProxyConstruction(format!("credential `{}` is not a valid value", key))
        })
}

fn upstream_address(credentials: &CredentialMap) -> Result<String> {
    let host = credential_str(credentials, HOST_KEY)?;
    let port: u16 = credential_str(credentials, PORT_KEY)?.parse().map_err(|_| {
        HarnessError::ProxyConstruction(format!("credential `{}` is not a port number", PORT_KEY))
    })?;
    Ok(format!("{}:{}", host, port))
}

async fn accept_loop(
    listener: TcpListener,
    upstream: String,
    credentials: Arc<DashMap<String, Vec<u8>>>,
    config: Arc<ProxyConfig>,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((socket, addr)) => {
                    failures = 0;
                    metrics::PROXIED_CONNECTIONS.inc();
                    let upstream = upstream.clone();
                    let credentials = Arc::clone(&credentials);
                    let config = Arc::clone(&config);
                    let token = shutdown.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            res = handle_connection(socket, upstream, credentials, config) => {
                                if let Err(e) = res {
                                    warn!(client = %addr, error = %e, "Proxy connection error");
                                }
                            }
                            _ = token.cancelled() => {
                                debug!(client = %addr, "Proxy connection dropped on shutdown");
                            }
                        }
                    });
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "Proxy accept failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            },
            _ = shutdown.cancelled() => {
                debug!("Proxy accept loop shutting down");
                break;
            }
        }
    }
}

/// Connect to the upstream with timeout.
async fn connect_backend(
    target_addr: &str,
    client_peer: &str,
    limit: Duration,
) -> Result<TcpStream> {
    debug!(
        "Attempting upstream connect to {} for client {}",
        target_addr, client_peer
    );
    match timeout(limit, TcpStream::connect(target_addr)).await {
        Ok(stream) => {
            let s = stream?;
            debug!(
                "Connected to upstream {} for client {}",
                target_addr, client_peer
            );
            Ok(s)
        }
        Err(_) => {
            warn!(
                "Could not connect to upstream at {} (connect timeout) for client {}",
                target_addr, client_peer
            );
            Err(HarnessError::Timeout(format!(
                "connecting to upstream {}",
                target_addr
            )))
        }
    }
}

/// Overwrites the LOGIN7 identity with whatever the credential map carries.
/// Returns the names of the injected fields.
fn inject_credentials(
    login: &mut Login7,
    credentials: &DashMap<String, Vec<u8>>,
) -> Vec<&'static str> {
    let mut injected = Vec::new();

    {
        let username = credentials
            .get(USERNAME_KEY)
            .or_else(|| credentials.get(USER_KEY));
        if let Some(value) = username {
            login.username = String::from_utf8_lossy(value.value()).into_owned();
            injected.push(USERNAME_KEY);
        }
    }

    if let Some(value) = credentials.get(PASSWORD_KEY) {
        let mut previous = std::mem::replace(
            &mut login.password,
            String::from_utf8_lossy(value.value()).into_owned(),
        );
        previous.zeroize();
        injected.push(PASSWORD_KEY);
    }

    injected
}

/// PRELOGIN both ways, then the rewritten LOGIN7 upstream.
async fn relay_handshake(
    source_read: &mut OwnedReadHalf,
    source_write: &mut OwnedWriteHalf,
    target_read: &mut OwnedReadHalf,
    target_write: &mut OwnedWriteHalf,
    credentials: &DashMap<String, Vec<u8>>,
    config: &ProxyConfig,
    client_peer: &str,
) -> Result<()> {
    let limit = config.handshake_timeout();
    let packet_size = config.packet_size;

    let prelogin =
        expect_message(source_read, packet_type::PRELOGIN, limit, "client PRELOGIN").await?;
    write_message(
        target_write,
        packet_type::PRELOGIN,
        &prelogin.payload,
        packet_size,
    )
    .await?;

    let reply = expect_message(
        target_read,
        packet_type::TABULAR_RESULT,
        limit,
        "upstream PRELOGIN reply",
    )
    .await?;
    let upstream_prelogin = parse_prelogin(&reply.payload)?;
    if upstream_prelogin.encryption.requires_tls() {
        return Err(HarnessError::Proxy(format!(
            "upstream requires TLS ({:?}), which the in-process proxy does not terminate",
            upstream_prelogin.encryption
        )));
    }
    write_message(
        source_write,
        packet_type::TABULAR_RESULT,
        &reply.payload,
        packet_size,
    )
    .await?;

    let login_msg = expect_message(source_read, packet_type::LOGIN7, limit, "client LOGIN7").await?;
    let mut login = parse_login7(&login_msg.payload)?;
    let injected = inject_credentials(&mut login, credentials);
    let encoded = encode_login7(&login).map(Zeroizing::new);
    login.password.zeroize();
    let encoded = encoded?;

    write_message(target_write, packet_type::LOGIN7, &encoded, packet_size).await?;
    metrics::CREDENTIAL_INJECTIONS.inc();
    debug!(
        client = %client_peer,
        username = %login.username,
        database = %login.database,
        read_only = login.read_only(),
        injected = ?injected,
        "Forwarded LOGIN7 with injected credentials"
    );
    Ok(())
}

/// Handle a single client connection: connect upstream, inject credentials
/// into the login, then relay bytes until either side closes.
pub async fn handle_connection(
    source: TcpStream,
    upstream: String,
    credentials: Arc<DashMap<String, Vec<u8>>>,
    config: Arc<ProxyConfig>,
) -> Result<()> {
    let client_peer = source
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let target = match connect_backend(&upstream, &client_peer, config.connect_timeout()).await {
        Ok(s) => s,
        Err(e) => {
            metrics::HANDSHAKE_FAILURES.inc();
            return Err(e);
        }
    };

    let _guard = ProxyConnectionGuard::new();

    let (mut source_read, mut source_write) = source.into_split();
    let (mut target_read, mut target_write) = target.into_split();

    if let Err(e) = relay_handshake(
        &mut source_read,
        &mut source_write,
        &mut target_read,
        &mut target_write,
        &credentials,
        &config,
        &client_peer,
    )
    .await
    {
        metrics::HANDSHAKE_FAILURES.inc();
        return Err(e);
    }

    let _ = tokio::select! {
        res = io::copy(&mut source_read, &mut target_write) => res,
        res = io::copy(&mut target_read, &mut source_write) => res,
    };

    debug!(client = %client_peer, "Proxy connection closed");
    Ok(())
}
