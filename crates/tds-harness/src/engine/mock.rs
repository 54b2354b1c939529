//! Mock TDS target that records one client handshake per accept.

use crate::engine::capture::CaptureReader;
use crate::engine::listener::{bound_port, open_loopback_listener, LOOPBACK_HOST};
use crate::engine::wire::{expect_message, write_message};
use crate::error::{HarnessError, Result};
use crate::metrics;
use crate::parser::tds::{
    encode_prelogin, packet_type, parse_login7, parse_prelogin, EncryptionMode, Login7, Prelogin,
    DEFAULT_PACKET_SIZE,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tds_common::MockConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// What the mock saw from one client before it hung up.
#[derive(Debug, Clone)]
pub struct MockTargetCapture {
    /// Address the connection came from (the proxy's outbound socket).
    pub peer_addr: SocketAddr,
    pub prelogin: Prelogin,
    pub login: Login7,
    /// Every byte read from the client, packet headers included.
    pub received: Vec<u8>,
}

impl MockTargetCapture {
    pub fn database(&self) -> &str {
        &self.login.database
    }

    pub fn read_only(&self) -> bool {
        self.login.read_only()
    }

    pub fn username(&self) -> &str {
        &self.login.username
    }

    pub fn password(&self) -> &str {
        &self.login.password
    }
}

pub struct MockTarget {
    host: String,
    port: String,
    listener: Mutex<Option<Arc<TcpListener>>>,
    pending: Arc<AtomicBool>,
    closed: CancellationToken,
    config: MockConfig,
}

impl MockTarget {
    /// Binds loopback at `port`; "0" picks an ephemeral port.
    pub async fn new(port: &str) -> Result<Self> {
        Self::with_config(port, MockConfig::default()).await
    }

    pub async fn with_config(port: &str, config: MockConfig) -> Result<Self> {
        let listener = open_loopback_listener(port).await?;
        let port = bound_port(&listener)?;
        metrics::register_metrics();
        info!(port = %port, "Mock TDS target listening");

        Ok(Self {
            host: LOOPBACK_HOST.to_string(),
            port,
            listener: Mutex::new(Some(Arc::new(listener))),
            pending: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            config,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Arms a single accept. The returned handle yields exactly one capture.
    ///
    /// Fails with [`HarnessError::Mock`] if the target is closed or another
    /// accept is still pending.
    pub fn accept(&self) -> Result<AcceptHandle> {
        let listener = {
            let guard = self
                .listener
                .lock()
                .map_err(|_| HarnessError::Mock("listener lock poisoned".to_string()))?;
            guard
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| HarnessError::Mock("mock target is closed".to_string()))?
        };

        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HarnessError::Mock(
                "an accept is already pending on this mock target".to_string(),
            ));
        }
        let slot = PendingSlot(Arc::clone(&self.pending));

        let (tx, rx) = oneshot::channel();
        let cancel = self.closed.child_token();
        let task_cancel = cancel.clone();
        let config = self.config.clone();
        let port = self.port.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => {
                    Err(HarnessError::Mock("accept cancelled".to_string()))
                }
                res = accept_and_capture(&listener, &config) => {
                    match res {
                        Ok(capture) => {
                            metrics::MOCK_CAPTURES.inc();
                            Ok(capture)
                        }
                        Err(e) => {
                            metrics::HANDSHAKE_FAILURES.inc();
                            warn!(port = %port, error = %e, "Mock target failed to capture handshake");
                            Err(e.into_mock())
                        }
                    }
                }
            };
            let _ = tx.send(result);
        });

        Ok(AcceptHandle {
            rx,
            _cancel: cancel.drop_guard(),
            _slot: slot,
        })
    }

    /// Stops listening and aborts any pending accept. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Ok(mut guard) = self.listener.lock() {
            guard.take();
        }
        debug!(port = %self.port, "Mock TDS target closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clears the target's pending flag when the handle goes away.
struct PendingSlot(Arc<AtomicBool>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One armed accept. Dropping it without awaiting cancels the accept.
pub struct AcceptHandle {
    rx: oneshot::Receiver<Result<MockTargetCapture>>,
    _cancel: DropGuard,
    _slot: PendingSlot,
}

impl AcceptHandle {
    pub async fn capture(self) -> Result<MockTargetCapture> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::Mock(
                "accept task ended without a capture".to_string(),
            )),
        }
    }
}

async fn accept_and_capture(listener: &TcpListener, config: &MockConfig) -> Result<MockTargetCapture> {
    let (socket, peer_addr) = match config.accept_timeout() {
        Some(limit) => timeout(limit, listener.accept()).await.map_err(|_| {
            HarnessError::Timeout("waiting for a client connection".to_string())
        })??,
        None => listener.accept().await?,
    };
    debug!(peer = %peer_addr, "Mock target accepted connection");

    let (read_half, mut write_half) = socket.into_split();
    let mut reader = CaptureReader::new(read_half);
    let limit = config.read_timeout();

    let msg = expect_message(&mut reader, packet_type::PRELOGIN, limit, "client PRELOGIN").await?;
    let prelogin = parse_prelogin(&msg.payload)?;

    let reply = Prelogin {
        encryption: EncryptionMode::NotSupported,
        ..Prelogin::default()
    };
    write_message(
        &mut write_half,
        packet_type::TABULAR_RESULT,
        &encode_prelogin(&reply),
        DEFAULT_PACKET_SIZE,
    )
    .await?;

    let msg = expect_message(&mut reader, packet_type::LOGIN7, limit, "client LOGIN7").await?;
    let login = parse_login7(&msg.payload)?;
    let (_, received) = reader.into_parts();

    // The client sees EOF where it expects a LOGINACK.
    let _ = write_half.shutdown().await;

    debug!(
        peer = %peer_addr,
        database = %login.database,
        read_only = login.read_only(),
        bytes = received.len(),
        "Mock target captured LOGIN7"
    );
    Ok(MockTargetCapture {
        peer_addr,
        prelogin,
        login,
        received,
    })
}
