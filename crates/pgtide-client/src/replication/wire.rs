//! Replication-mode wire session.
//!
//! Released tokio-postgres cannot open a `replication=database` session,
//! so this module speaks the streaming-replication subprotocol over raw
//! TCP: startup and auth, START_REPLICATION into CopyBoth mode, XLogData
//! and keepalive frames inbound, standby status updates outbound.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use pgtide_core::Lsn;

use crate::conninfo::ConnectParams;
use crate::error::{CdcError, CdcResult};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01).
pub(crate) const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

const SQLSTATE_OBJECT_IN_USE: &str = "55006";
const SQLSTATE_UNDEFINED_OBJECT: &str = "42704";

/// A frame read off the CopyBoth stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WalFrame {
    /// WAL payload carrying one pgoutput message.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        data: Bytes,
    },
    /// Server keepalive; `reply_requested` asks for an immediate status update.
    Keepalive { wal_end: Lsn, reply_requested: bool },
}

/// An authenticated replication-mode connection, before CopyBoth.
pub struct WireSession {
    stream: BufReader<TcpStream>,
}

impl WireSession {
    /// Connect and authenticate in replication mode.
    pub async fn connect(params: &ConnectParams) -> CdcResult<WireSession> {
        debug!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            database = %params.database,
            "Opening replication session"
        );
        let tcp = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| {
                CdcError::Connection(format!("connect {}:{}: {}", params.host, params.port, e))
            })?;
        let mut stream = BufReader::new(tcp);

        let startup = vec![
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(startup.into_iter(), &mut buf)
            .map_err(|e| CdcError::Connection(format!("startup message: {}", e)))?;
        write_all(&mut stream, &buf).await?;

        authenticate(&mut stream, params).await?;

        // Drain ParameterStatus/BackendKeyData until ReadyForQuery.
        loop {
            let (tag, body) = read_frame(&mut stream).await?;
            match tag {
                b'Z' => break,
                b'E' => {
                    let (code, message) = parse_error_response(&body);
                    return Err(classify_server_error(&code, &message));
                }
                _ => {}
            }
        }

        debug!("Replication session ready");
        Ok(WireSession { stream })
    }

    /// Issue START_REPLICATION for the slot and enter CopyBoth mode.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> CdcResult<WalStream> {
        let query = start_replication_command(slot_name, publication, start_lsn)?;
        debug!(slot = %slot_name, start_lsn = %start_lsn, "Starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)
            .map_err(|e| CdcError::Connection(format!("start query: {}", e)))?;
        write_all(&mut self.stream, &buf).await?;

        let (tag, body) = read_frame(&mut self.stream).await?;
        match tag {
            b'W' => {
                info!(slot = %slot_name, start_lsn = %start_lsn, "Entered CopyBoth mode");
                Ok(WalStream {
                    stream: self.stream,
                    buf: BytesMut::with_capacity(8 * 1024),
                })
            }
            b'E' => {
                let (code, message) = parse_error_response(&body);
                Err(classify_server_error(&code, &message))
            }
            other => Err(CdcError::Stream(format!(
                "unexpected response to START_REPLICATION: '{}'",
                other as char
            ))),
        }
    }
}

/// CopyBoth-mode stream of WAL frames.
pub struct WalStream {
    stream: BufReader<TcpStream>,
    buf: BytesMut,
}

impl WalStream {
    /// Read the next WAL frame.
    ///
    /// Returns `Ok(None)` when the server ends the copy stream cleanly.
    ///
    /// Cancel-safe: frames are assembled in an internal buffer, so dropping
    /// the future between reads never loses or tears a frame.
    pub async fn next_frame(&mut self) -> CdcResult<Option<WalFrame>> {
        loop {
            if let Some((tag, body)) = take_frame(&mut self.buf)? {
                match tag {
                    b'd' => match parse_wal_frame(body)? {
                        Some(frame) => return Ok(Some(frame)),
                        None => continue,
                    },
                    b'c' => return Ok(None),
                    b'E' => {
                        let (code, message) = parse_error_response(&body);
                        return Err(classify_server_error(&code, &message));
                    }
                    other => {
                        return Err(CdcError::Stream(format!(
                            "unexpected message type in copy stream: '{}'",
                            other as char
                        )))
                    }
                }
            }

            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| CdcError::Stream(format!("read: {}", e)))?;
            if n == 0 {
                return Err(CdcError::Stream(
                    "connection closed mid copy stream".into(),
                ));
            }
        }
    }

    /// Send a standby status update acknowledging `ack` as written,
    /// flushed, and applied.
    pub async fn send_status_update(&mut self, ack: Lsn) -> CdcResult<()> {
        let frame = encode_status_update(ack, status_clock_micros());
        write_all(&mut self.stream, &frame).await
    }

    /// Best-effort clean close: final status update, then CopyDone.
    pub async fn shutdown(mut self, ack: Lsn) {
        if ack > Lsn::ZERO {
            let _ = self.send_status_update(ack).await;
        }
        let mut frame = BytesMut::with_capacity(5);
        frame.put_u8(b'c');
        frame.put_i32(4);
        let _ = self.stream.write_all(&frame).await;
        let _ = self.stream.flush().await;
    }
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    params: &ConnectParams,
) -> CdcResult<()> {
    loop {
        let (tag, body) = read_frame(stream).await?;

        let mut raw = BytesMut::with_capacity(5 + body.len());
        raw.put_u8(tag);
        raw.put_i32((body.len() + 4) as i32);
        raw.put_slice(&body);
        let msg = backend::Message::parse(&mut raw)
            .map_err(|e| CdcError::Connection(format!("auth message parse: {}", e)))?
            .ok_or_else(|| CdcError::Connection("truncated auth message".into()))?;

        match msg {
            backend::Message::AuthenticationOk => {
                debug!("Authentication successful");
                return Ok(());
            }
            backend::Message::AuthenticationCleartextPassword => {
                let mut buf = BytesMut::new();
                frontend::password_message(params.password.as_bytes(), &mut buf)
                    .map_err(|e| CdcError::Connection(format!("password message: {}", e)))?;
                write_all(stream, &buf).await?;
            }
            backend::Message::AuthenticationMd5Password(md5_body) => {
                let hash = hash_md5_password(&params.user, &params.password, &md5_body.salt());
                let mut buf = BytesMut::new();
                frontend::password_message(hash.as_bytes(), &mut buf)
                    .map_err(|e| CdcError::Connection(format!("password message: {}", e)))?;
                write_all(stream, &buf).await?;
            }
            backend::Message::AuthenticationSasl(_) => {
                return Err(CdcError::Connection(
                    "SASL authentication not supported for replication sessions".into(),
                ));
            }
            backend::Message::ErrorResponse(_) => {
                let (code, message) = parse_error_response(&body);
                return Err(CdcError::Connection(format!(
                    "authentication failed: {} ({})",
                    message, code
                )));
            }
            _ => {
                return Err(CdcError::Connection(format!(
                    "unexpected message during auth: '{}'",
                    tag as char
                )))
            }
        }
    }
}

/// Read one `type + length + body` backend frame.
async fn read_frame(stream: &mut BufReader<TcpStream>) -> CdcResult<(u8, Vec<u8>)> {
    let tag = stream
        .read_u8()
        .await
        .map_err(|e| CdcError::Stream(format!("read frame type: {}", e)))?;
    let len = stream
        .read_i32()
        .await
        .map_err(|e| CdcError::Stream(format!("read frame length: {}", e)))? as usize;
    if len < 4 {
        return Err(CdcError::Format(format!("invalid frame length {}", len)));
    }
    let mut body = vec![0u8; len - 4];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| CdcError::Stream(format!("read frame body: {}", e)))?;
    Ok((tag, body))
}

async fn write_all(stream: &mut BufReader<TcpStream>, buf: &[u8]) -> CdcResult<()> {
    stream
        .write_all(buf)
        .await
        .map_err(|e| CdcError::Stream(format!("write: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| CdcError::Stream(format!("flush: {}", e)))
}

/// Render the START_REPLICATION command.
///
/// The start position goes out in the server's split hex form; `pg_lsn`
/// has no decimal reading, so any other rendering names a different
/// position. Slot and publication names are interpolated (replication
/// commands take no bind parameters) and must be plain identifiers.
fn start_replication_command(
    slot_name: &str,
    publication: &str,
    start_lsn: Lsn,
) -> CdcResult<String> {
    validate_identifier(slot_name, "slot")?;
    validate_identifier(publication, "publication")?;
    Ok(format!(
        "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
        slot_name, start_lsn, publication
    ))
}

fn validate_identifier(name: &str, what: &str) -> CdcResult<()> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= 63
        }
        None => false,
    };
    if !ok {
        return Err(CdcError::Format(format!(
            "invalid {} name {:?}: expected letters, digits or underscores",
            what, name
        )));
    }
    Ok(())
}

/// Pop one complete `tag + length + body` frame off the buffer, if present.
fn take_frame(buf: &mut BytesMut) -> CdcResult<Option<(u8, Bytes)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(CdcError::Format(format!("invalid frame length {}", len)));
    }
    let len = len as usize;
    if buf.len() < 1 + len {
        return Ok(None);
    }
    let tag = buf[0];
    let mut frame = buf.split_to(1 + len);
    frame.advance(5);
    Ok(Some((tag, frame.freeze())))
}

/// Parse a CopyData payload into a WAL frame.
///
/// Returns `Ok(None)` for empty payloads and subtags this client does not
/// consume; pgoutput-level tags are handled downstream by the decoder.
fn parse_wal_frame(mut payload: Bytes) -> CdcResult<Option<WalFrame>> {
    if !payload.has_remaining() {
        return Ok(None);
    }
    match payload.get_u8() {
        b'w' => {
            if payload.remaining() < 24 {
                return Err(CdcError::Format(format!(
                    "XLogData header truncated: {} bytes",
                    payload.remaining()
                )));
            }
            let wal_start = Lsn(payload.get_u64());
            let wal_end = Lsn(payload.get_u64());
            let _timestamp = payload.get_i64();
            Ok(Some(WalFrame::XLogData {
                wal_start,
                wal_end,
                data: payload,
            }))
        }
        b'k' => {
            if payload.remaining() < 17 {
                return Err(CdcError::Format(format!(
                    "keepalive truncated: {} bytes",
                    payload.remaining()
                )));
            }
            let wal_end = Lsn(payload.get_u64());
            let _timestamp = payload.get_i64();
            let reply_requested = payload.get_u8() == 1;
            Ok(Some(WalFrame::Keepalive {
                wal_end,
                reply_requested,
            }))
        }
        other => {
            debug!(tag = other, "Skipping unknown copy subtag");
            Ok(None)
        }
    }
}

/// Encode a standby status update as a complete CopyData frame.
///
/// The same ack position is reported as written, flushed, and applied;
/// this client only acknowledges what the caller has durably processed.
fn encode_status_update(ack: Lsn, clock_micros: i64) -> BytesMut {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(ack.value());
    payload.put_u64(ack.value());
    payload.put_u64(ack.value());
    payload.put_i64(clock_micros);
    payload.put_u8(0);

    let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
    frame.put_u8(b'd');
    frame.put_i32((payload.len() + 4) as i32);
    frame.put_slice(&payload);
    frame
}

/// Microseconds since the Postgres epoch.
fn status_clock_micros() -> i64 {
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH
        + std::time::Duration::from_secs(PG_EPOCH_OFFSET_SECS);
    match std::time::SystemTime::now().duration_since(pg_epoch) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Walk ErrorResponse fields (one type byte, then a NUL-terminated value,
/// until a zero byte) and pull out the SQLSTATE and message.
fn parse_error_response(body: &[u8]) -> (String, String) {
    let mut code = String::new();
    let mut message = String::new();
    let mut i = 0;
    while i < body.len() {
        let field = body[i];
        if field == 0 {
            break;
        }
        i += 1;
        let start = i;
        while i < body.len() && body[i] != 0 {
            i += 1;
        }
        let value = String::from_utf8_lossy(&body[start..i]).to_string();
        i += 1;
        match field {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    (code, message)
}

fn classify_server_error(code: &str, message: &str) -> CdcError {
    match code {
        SQLSTATE_OBJECT_IN_USE => CdcError::SlotInUse(message.to_string()),
        SQLSTATE_UNDEFINED_OBJECT => CdcError::SlotConflict(message.to_string()),
        _ => CdcError::Stream(format!("server error: {} ({})", message, code)),
    }
}

fn hash_md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    let second = hex::encode(hasher.finalize());

    format!("md5{}", second)
}
