use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use chrono::Utc;
use fallible_iterator::FallibleIterator;
use pg_escape::quote_identifier;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::{backend, frontend};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, warn};

use super::protocol::{encode_standby_status_update, ReplicationMessage};
use crate::config::SourceConfig;
use crate::consumer::{ReplicationSource, SlotInfo, SystemInfo};
use crate::{Error, Result};

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';
const COPY_DATA_TAG: u8 = b'd';
const COPY_DONE_TAG: u8 = b'c';

/// SQLSTATE `duplicate_object`.
const DUPLICATE_OBJECT: &str = "42710";

/// A walsender session opened with `replication=database`.
///
/// tokio-postgres has no CopyBoth support, so the session speaks the wire
/// protocol itself over a plain TCP stream using `postgres-protocol` for
/// message encoding and authentication.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    streaming: bool,
}

enum Frame {
    CopyBothResponse,
    CopyData(Bytes),
    CopyDone,
    Message(backend::Message),
}

/// One row of a simple query result, all values in text form.
#[derive(Debug, Clone, Default)]
pub struct SimpleRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)?.as_deref()
    }
}

impl ReplicationConnection {
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        info!(
            "Connecting to {}:{} as {} in replication mode",
            config.host, config.port, config.username
        );

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let stream = timeout(
            connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "Timed out connecting to {}:{} after {:?}",
                config.host, config.port, connect_timeout
            ))
        })??;
        stream.set_nodelay(true)?;

        let mut connection = Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            streaming: false,
        };
        connection.startup(config).await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    async fn startup(&mut self, config: &SourceConfig) -> Result<()> {
        frontend::startup_message(startup_params(config), &mut self.write_buf)?;
        self.flush().await?;

        loop {
            match self.read_frame().await? {
                Frame::Message(backend::Message::AuthenticationOk) => {
                    debug!("Authentication successful");
                }
                Frame::Message(backend::Message::AuthenticationCleartextPassword) => {
                    frontend::password_message(config.password.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Frame::Message(backend::Message::AuthenticationMd5Password(body)) => {
                    let hash = authentication::md5_hash(
                        config.username.as_bytes(),
                        config.password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Frame::Message(backend::Message::AuthenticationSasl(body)) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supported = true;
                        }
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "Server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    self.authenticate_scram(config.password.as_bytes()).await?;
                }
                Frame::Message(backend::Message::ErrorResponse(body)) => {
                    return Err(server_error(&body));
                }
                Frame::Message(backend::Message::ReadyForQuery(_)) => return Ok(()),
                Frame::Message(backend::Message::ParameterStatus(_))
                | Frame::Message(backend::Message::BackendKeyData(_))
                | Frame::Message(backend::Message::NoticeResponse(_)) => {}
                _ => {
                    return Err(Error::Authentication(
                        "Unexpected message during startup".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &[u8]) -> Result<()> {
        let mut scram = sasl::ScramSha256::new(password, sasl::ChannelBinding::unsupported());
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_frame().await? {
            Frame::Message(backend::Message::AuthenticationSaslContinue(body)) => {
                scram.update(body.data())?;
            }
            Frame::Message(backend::Message::ErrorResponse(body)) => return Err(server_error(&body)),
            _ => {
                return Err(Error::Authentication(
                    "Expected SASL continue message".to_string(),
                ))
            }
        }
        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_frame().await? {
            Frame::Message(backend::Message::AuthenticationSaslFinal(body)) => {
                scram.finish(body.data())?;
                Ok(())
            }
            Frame::Message(backend::Message::ErrorResponse(body)) => Err(server_error(&body)),
            _ => Err(Error::Authentication(
                "Expected SASL final message".to_string(),
            )),
        }
    }

    /// Runs a replication command and collects its rows.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        debug!("Sending command: {}", query);
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            match self.read_frame().await? {
                Frame::Message(backend::Message::RowDescription(body)) => {
                    columns = body
                        .fields()
                        .map(|field| Ok(field.name().to_string()))
                        .collect()?;
                }
                Frame::Message(backend::Message::DataRow(body)) => {
                    let buffer = body.buffer();
                    let values = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect()?;
                    rows.push(SimpleRow {
                        columns: columns.clone(),
                        values,
                    });
                }
                Frame::Message(backend::Message::ErrorResponse(body)) => {
                    failure = Some(server_error(&body));
                }
                Frame::Message(backend::Message::ReadyForQuery(_)) => break,
                Frame::Message(backend::Message::NoticeResponse(body)) => log_notice(&body),
                Frame::Message(_) => {}
                Frame::CopyBothResponse | Frame::CopyData(_) | Frame::CopyDone => {
                    return Err(Error::Protocol(format!(
                        "Unexpected copy message in response to {}",
                        query
                    )))
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one complete backend message. Partial input stays buffered, so
    /// dropping the future between reads loses nothing.
    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(Error::Connection(
                    "Server closed the replication connection".to_string(),
                ));
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.read_buf[0];
        let len = (&self.read_buf[1..5]).get_i32();
        if len < 4 {
            return Err(Error::Protocol(format!("Invalid message length {}", len)));
        }
        let total = 1 + len as usize;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        // postgres-protocol does not parse the CopyBoth messages.
        let frame = match tag {
            COPY_BOTH_RESPONSE_TAG => {
                self.read_buf.advance(total);
                Frame::CopyBothResponse
            }
            COPY_DATA_TAG => {
                let mut data = self.read_buf.split_to(total);
                data.advance(5);
                Frame::CopyData(data.freeze())
            }
            COPY_DONE_TAG => {
                self.read_buf.advance(total);
                Frame::CopyDone
            }
            _ => match backend::Message::parse(&mut self.read_buf)? {
                Some(message) => Frame::Message(message),
                None => return Ok(None),
            },
        };
        Ok(Some(frame))
    }
}

#[async_trait]
impl ReplicationSource for ReplicationConnection {
    async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| Error::Replication {
            message: "IDENTIFY_SYSTEM returned no rows".to_string(),
        })?;

        let xlogpos = row.get("xlogpos").unwrap_or("0/0");
        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline: row
                .get("timeline")
                .and_then(|t| t.parse().ok())
                .unwrap_or(1),
            xlogpos: xlogpos
                .parse()
                .map_err(|_| Error::Protocol(format!("Invalid xlogpos {}", xlogpos)))?,
            dbname: row.get("dbname").map(|s| s.to_string()),
        };

        info!(
            system_id = %info.system_id,
            timeline = info.timeline,
            xlogpos = %info.xlogpos,
            dbname = ?info.dbname,
            "Identified source system"
        );
        Ok(info)
    }

    async fn create_replication_slot(
        &mut self,
        slot_name: &str,
        output_plugin: &str,
        temporary: bool,
    ) -> Result<SlotInfo> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {}{} LOGICAL {} NOEXPORT_SNAPSHOT",
            quote_identifier(slot_name),
            if temporary { " TEMPORARY" } else { "" },
            quote_identifier(output_plugin)
        );

        match self.simple_query(&query).await {
            Ok(rows) => {
                let consistent_point = rows
                    .first()
                    .and_then(|row| row.get("consistent_point"))
                    .and_then(|lsn| lsn.parse::<PgLsn>().ok());
                info!(
                    temporary,
                    consistent_point = ?consistent_point,
                    "Created replication slot '{}'",
                    slot_name
                );
                Ok(SlotInfo {
                    slot_name: slot_name.to_string(),
                    consistent_point,
                })
            }
            Err(e) if e.sql_state() == Some(DUPLICATE_OBJECT) => {
                info!("Replication slot '{}' already exists", slot_name);
                Ok(SlotInfo {
                    slot_name: slot_name.to_string(),
                    consistent_point: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start: PgLsn,
        plugin_args: &[String],
    ) -> Result<()> {
        let mut query = format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            quote_identifier(slot_name),
            start
        );
        if !plugin_args.is_empty() {
            query.push_str(&format!(" ({})", plugin_args.join(", ")));
        }

        info!("Starting replication from LSN: {}", start);
        frontend::query(&query, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            match self.read_frame().await? {
                Frame::CopyBothResponse => {
                    self.streaming = true;
                    info!("Logical replication started on slot {}", slot_name);
                    return Ok(());
                }
                Frame::Message(backend::Message::ErrorResponse(body)) => {
                    return Err(server_error(&body));
                }
                Frame::Message(backend::Message::NoticeResponse(body)) => log_notice(&body),
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected response to START_REPLICATION".to_string(),
                    ))
                }
            }
        }
    }

    async fn recv(&mut self, deadline: Instant) -> Result<Option<ReplicationMessage>> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "Replication not started".to_string(),
            });
        }

        loop {
            let frame = match timeout_at(deadline, self.read_frame()).await {
                Ok(frame) => frame?,
                Err(_) => return Ok(None),
            };

            match frame {
                Frame::CopyData(data) => return ReplicationMessage::parse(data).map(Some),
                Frame::CopyDone => {
                    self.streaming = false;
                    return Err(Error::Replication {
                        message: "Server ended the replication stream".to_string(),
                    });
                }
                Frame::Message(backend::Message::ErrorResponse(body)) => {
                    return Err(server_error(&body));
                }
                Frame::Message(backend::Message::NoticeResponse(body)) => log_notice(&body),
                Frame::Message(backend::Message::ParameterStatus(_)) => {}
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected message in replication stream".to_string(),
                    ))
                }
            }
        }
    }

    async fn send_standby_status_update(&mut self, written: PgLsn, flushed: PgLsn) -> Result<()> {
        let update = encode_standby_status_update(written, flushed, Utc::now(), false);
        frontend::CopyData::new(update)?.write(&mut self.write_buf);
        self.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing replication connection");
        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
            self.streaming = false;
        }
        frontend::terminate(&mut self.write_buf);
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Tuple text and identifiers are always requested in UTF-8, whatever the
/// source database encoding.
fn startup_params(config: &SourceConfig) -> Vec<(&str, &str)> {
    vec![
        ("user", config.username.as_str()),
        ("database", config.database.as_str()),
        ("replication", "database"),
        ("application_name", config.application_name.as_str()),
        ("client_encoding", "UTF8"),
    ]
}

fn server_error(body: &backend::ErrorResponseBody) -> Error {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    loop {
        match fields.next() {
            Ok(Some(field)) => {
                let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
                match field.type_() {
                    b'S' => severity = value,
                    b'C' => code = value,
                    b'M' => message = value,
                    _ => {}
                }
            }
            Ok(None) => break,
            Err(e) => return Error::Protocol(format!("Malformed error response: {}", e)),
        }
    }

    Error::Server {
        severity,
        code,
        message,
    }
}

fn log_notice(body: &backend::NoticeResponseBody) {
    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        if field.type_() == b'M' {
            warn!("Server notice: {}", String::from_utf8_lossy(field.value_bytes()));
        }
    }
}
