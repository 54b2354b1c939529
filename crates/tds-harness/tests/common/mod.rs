#![allow(dead_code)]

use tds_harness::engine::wire::{read_message, write_message};
use tds_harness::parser::tds::{
    done_status, encode_done, encode_env_database, encode_login_ack, encode_prelogin,
    encode_result_set, packet_type, parse_login7, parse_sql_batch, Column, ColumnType,
    EncryptionMode, Login7, LoginAck, Prelogin, Value, DEFAULT_PACKET_SIZE,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A fake SQL Server that completes any login and answers every batch with
/// a single-row, single-column result.
pub struct StubUpstream {
    pub port: String,
    /// Every LOGIN7 the stub received, in order.
    pub logins: mpsc::UnboundedReceiver<Login7>,
    /// Every SQL batch text the stub received, in order.
    pub queries: mpsc::UnboundedReceiver<String>,
}

pub async fn spawn_stub_upstream(answer: Value) -> StubUpstream {
    spawn_stub_with_encryption(answer, EncryptionMode::NotSupported).await
}

pub async fn spawn_stub_with_encryption(answer: Value, encryption: EncryptionMode) -> StubUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let (login_tx, logins) = mpsc::unbounded_channel();
    let (query_tx, queries) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let answer = answer.clone();
            let login_tx = login_tx.clone();
            let query_tx = query_tx.clone();
            tokio::spawn(async move {
                let _ = serve(socket, answer, encryption, login_tx, query_tx).await;
            });
        }
    });

    StubUpstream {
        port,
        logins,
        queries,
    }
}

async fn serve(
    socket: TcpStream,
    answer: Value,
    encryption: EncryptionMode,
    login_tx: mpsc::UnboundedSender<Login7>,
    query_tx: mpsc::UnboundedSender<String>,
) -> tds_harness::Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    let Some(_prelogin) = read_message(&mut reader).await? else {
        return Ok(());
    };
    let reply = Prelogin {
        encryption,
        ..Prelogin::default()
    };
    write_message(
        &mut writer,
        packet_type::TABULAR_RESULT,
        &encode_prelogin(&reply),
        DEFAULT_PACKET_SIZE,
    )
    .await?;
    if encryption.requires_tls() {
        return Ok(());
    }

    let Some(login) = read_message(&mut reader).await? else {
        return Ok(());
    };
    let login = parse_login7(&login.payload)?;
    let database = login.database.clone();
    let _ = login_tx.send(login);

    let mut response = encode_login_ack(&LoginAck::default());
    response.extend_from_slice(&encode_env_database(&database, "master"));
    response.extend_from_slice(&encode_done(done_status::FINAL, 0));
    write_message(
        &mut writer,
        packet_type::TABULAR_RESULT,
        &response,
        DEFAULT_PACKET_SIZE,
    )
    .await?;

    while let Some(batch) = read_message(&mut reader).await? {
        let _ = query_tx.send(parse_sql_batch(&batch.payload)?);
        let columns = [Column {
            name: String::new(),
            ty: ColumnType::IntN(4),
        }];
        let result = encode_result_set(&columns, &[vec![answer.clone()]]);
        write_message(
            &mut writer,
            packet_type::TABULAR_RESULT,
            &result,
            DEFAULT_PACKET_SIZE,
        )
        .await?;
    }
    Ok(())
}
