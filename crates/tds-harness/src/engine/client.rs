//! Database client driven through the proxy.

use crate::engine::wire::{expect_message, write_message};
use crate::error::{HarnessError, Result};
use crate::parser::tds::{
    encode_login7, encode_prelogin, encode_sql_batch, packet_type, parse_prelogin, parse_tokens,
    Login7, Prelogin, Token,
};
use std::fmt;
use std::future::Future;
use tds_common::ClientConfig;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Where and how the client connects.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DbClientConfig {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub read_only: bool,
}

impl fmt::Debug for DbClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Rendered query output, or whatever stopped the client.
pub type ClientResult = Result<String>;

pub trait DbClientExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        config: DbClientConfig,
        query: String,
    ) -> impl Future<Output = ClientResult> + Send;
}

/// Runs the executor on its own task. The receiver yields exactly one result;
/// it errors only if the task panicked.
pub fn concurrent_client_exec<E>(
    executor: &E,
    config: DbClientConfig,
    query: impl Into<String>,
) -> oneshot::Receiver<ClientResult>
where
    E: DbClientExecutor + Clone,
{
    let (tx, rx) = oneshot::channel();
    let executor = executor.clone();
    let query = query.into();

    tokio::spawn(async move {
        let result = executor.execute(config, query).await;
        let _ = tx.send(result);
    });

    rx
}

/// Minimal TDS 7.4 client: unencrypted PRELOGIN, LOGIN7, then one SQL batch.
#[derive(Debug, Clone, Default)]
pub struct TdsClientExecutor {
    config: ClientConfig,
}

impl TdsClientExecutor {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        match timeout(self.config.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(HarnessError::Timeout(format!("connecting to {}", addr))),
        }
    }

    async fn run_query(&self, config: &DbClientConfig, query: &str) -> Result<String> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = self.connect(&addr).await?;
        let (mut reader, mut writer) = stream.into_split();
        let limit = self.config.read_timeout();
        let packet_size = self.config.packet_size;

        write_message(
            &mut writer,
            packet_type::PRELOGIN,
            &encode_prelogin(&Prelogin::default()),
            packet_size,
        )
        .await?;
        let reply = expect_message(
            &mut reader,
            packet_type::TABULAR_RESULT,
            limit,
            "PRELOGIN response",
        )
        .await?;
        let server = parse_prelogin(&reply.payload)?;
        if server.encryption.requires_tls() {
            return Err(HarnessError::Client(format!(
                "server at {} requires encryption ({:?})",
                addr, server.encryption
            )));
        }

        let mut login = Login7 {
            packet_size: packet_size as u32,
            hostname: self.config.workstation.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            app_name: self.config.app_name.clone(),
            server_name: config.host.clone(),
            database: config.database.clone(),
            ..Login7::default()
        };
        login.set_read_only(config.read_only);
        let encoded = encode_login7(&login).map(Zeroizing::new);
        login.password.zeroize();
        let encoded = encoded?;

        write_message(&mut writer, packet_type::LOGIN7, &encoded, packet_size).await?;
        let response =
            expect_message(&mut reader, packet_type::TABULAR_RESULT, limit, "login response")
                .await?;
        check_login(&parse_tokens(&response.payload)?)?;
        debug!(addr = %addr, database = %config.database, "Client logged in");

        write_message(
            &mut writer,
            packet_type::SQL_BATCH,
            &encode_sql_batch(query),
            packet_size,
        )
        .await?;
        let response =
            expect_message(&mut reader, packet_type::TABULAR_RESULT, limit, "query response")
                .await?;
        render_rows(&parse_tokens(&response.payload)?)
    }
}

impl DbClientExecutor for TdsClientExecutor {
    fn execute(
        &self,
        config: DbClientConfig,
        query: String,
    ) -> impl Future<Output = ClientResult> + Send {
        let this = self.clone();
        async move {
            this.run_query(&config, &query)
                .await
                .map_err(HarnessError::into_client)
        }
    }
}

fn check_login(tokens: &[Token]) -> Result<()> {
    for t in tokens {
        if let Token::Error(msg) = t {
            return Err(HarnessError::Client(format!(
                "login failed: {} (error {})",
                msg.message, msg.number
            )));
        }
    }
    if tokens.iter().any(|t| matches!(t, Token::LoginAck(_))) {
        Ok(())
    } else {
        Err(HarnessError::Client(
            "login response carried no LOGINACK".to_string(),
        ))
    }
}

/// Tab-separated columns, newline-separated rows. An ERROR token fails the query.
pub fn render_rows(tokens: &[Token]) -> Result<String> {
    let mut rows = Vec::new();
    for t in tokens {
        match t {
            Token::Error(msg) => {
                return Err(HarnessError::Client(format!(
                    "query failed: {} (error {})",
                    msg.message, msg.number
                )));
            }
            Token::Row(values) => {
                let cols: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                rows.push(cols.join("\t"));
            }
            _ => {}
        }
    }
    Ok(rows.join("\n"))
}
