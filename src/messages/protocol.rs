use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use super::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION_3, SSL_REQUEST_CODE};
use crate::errors::ProtocolError;

const TAG_AUTHENTICATION: u8 = b'R';
const TAG_ERROR_RESPONSE: u8 = b'E';
const TAG_READY_FOR_QUERY: u8 = b'Z';
const TAG_ROW_DESCRIPTION: u8 = b'T';
const TAG_DATA_ROW: u8 = b'D';
const TAG_COMMAND_COMPLETE: u8 = b'C';
const TAG_QUERY: u8 = b'Q';
const TAG_TERMINATE: u8 = b'X';

/// Transaction status byte carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(Self::Idle),
            b'T' => Some(Self::InTransaction),
            b'E' => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Failed => b'E',
        }
    }
}

/// Transaction-control verb detected in a `Query` SQL string or a server
/// `CommandComplete` tag. Advisory only; `ReadyForQuery` is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Begin,
    Commit,
    Rollback,
}

/// Classify the leading keyword of a SQL string or command tag.
pub fn classify_verb(text: &str) -> Option<Verb> {
    let first_word = text.trim_start().split_whitespace().next()?;
    match first_word.to_ascii_uppercase().as_str() {
        "BEGIN" | "START" => Some(Verb::Begin),
        "COMMIT" | "END" => Some(Verb::Commit),
        "ROLLBACK" | "ABORT" => Some(Verb::Rollback),
        _ => None,
    }
}

/// The first thing a client sends on a new connection, before the ordinary
/// tagged-frame framing applies.
#[derive(Debug, Clone)]
pub enum InitialMessage {
    SslRequest,
    Startup { params: HashMap<String, String> },
}

/// Attempt to parse the very first frame of a client connection: either an
/// `SSLRequest` or a `Startup`. Returns `Ok(None)` if not enough bytes have
/// arrived yet. Returns the number of bytes consumed alongside the message.
pub fn try_parse_initial_message(
    buf: &[u8],
) -> Result<Option<(InitialMessage, usize)>, ProtocolError> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let code = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if len == 8 && code == SSL_REQUEST_CODE {
        return Ok(Some((InitialMessage::SslRequest, 8)));
    }

    if len < 8 {
        return Err(ProtocolError::InvalidLength(len));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge(len, MAX_MESSAGE_SIZE));
    }
    let total = len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let version = code as u32;
    if version != PROTOCOL_VERSION_3 {
        return Err(ProtocolError::UnsupportedProtocolVersion(version));
    }
    let params_bytes = &buf[8..total];
    let params = parse_params(params_bytes)?;
    if !params.contains_key("user") {
        return Err(ProtocolError::MissingStartupParam("user"));
    }
    Ok(Some((InitialMessage::Startup { params }, total)))
}

fn parse_params(bytes: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    let mut tokens = bytes
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>();
    // Trailing double-null produces one or two empty strings at the end.
    while tokens.last().map(|s| s.is_empty()).unwrap_or(false) {
        tokens.pop();
    }
    if tokens.len() % 2 != 0 {
        return Err(ProtocolError::BadStartupParams);
    }
    let mut map = HashMap::with_capacity(tokens.len() / 2);
    let mut it = tokens.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        map.insert(k, v);
    }
    Ok(map)
}

/// A frame sent by the client after startup has completed.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Query { sql: String },
    Terminate,
    Other { tag: u8 },
}

/// A frame sent by the backend server.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    AuthenticationOk,
    AuthenticationOther { code: i32 },
    ErrorResponse { message: String },
    ReadyForQuery { status: TransactionStatus },
    RowDescription,
    DataRow,
    CommandComplete { tag: String },
    Other { tag: u8 },
}

/// Try to consume one tagged frame (tag byte + 4-byte BE length + payload)
/// from the front of `buf`. Returns `Ok(None)` when the buffer holds fewer
/// bytes than the frame needs; the caller should wait for more data.
pub(crate) fn try_take_frame(buf: &[u8]) -> Result<Option<(u8, &[u8], usize)>, ProtocolError> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(ProtocolError::InvalidLength(len));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge(len, MAX_MESSAGE_SIZE));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[5..total];
    Ok(Some((tag, payload, total)))
}

/// Parse zero or more client frames from `buf`. Returns the parsed messages
/// and the number of bytes consumed; any trailing partial frame is left in
/// the buffer for the next call.
pub fn parse_client_messages(
    buf: &[u8],
) -> Result<(Vec<ClientMessage>, usize), ProtocolError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    loop {
        let Some((tag, payload, total)) = try_take_frame(&buf[offset..])? else {
            break;
        };
        let message = match tag {
            TAG_QUERY => {
                let sql = cstr(payload).unwrap_or_default();
                ClientMessage::Query { sql }
            }
            TAG_TERMINATE => ClientMessage::Terminate,
            other => ClientMessage::Other { tag: other },
        };
        messages.push(message);
        offset += total;
    }
    Ok((messages, offset))
}

/// Parse a single client frame from the front of `buf`, if a complete one
/// is available, without consuming the rest. Used by the proxy engine,
/// which needs the raw byte span of each frame to forward it verbatim.
pub fn try_parse_one_client_message(
    buf: &[u8],
) -> Result<Option<(ClientMessage, usize)>, ProtocolError> {
    let Some((tag, payload, total)) = try_take_frame(buf)? else {
        return Ok(None);
    };
    let message = match tag {
        TAG_QUERY => ClientMessage::Query {
            sql: cstr(payload).unwrap_or_default(),
        },
        TAG_TERMINATE => ClientMessage::Terminate,
        other => ClientMessage::Other { tag: other },
    };
    Ok(Some((message, total)))
}

/// Single-frame counterpart of [`try_parse_one_client_message`] for server
/// frames.
pub fn try_parse_one_server_message(
    buf: &[u8],
) -> Result<Option<(ServerMessage, usize)>, ProtocolError> {
    let Some((tag, payload, total)) = try_take_frame(buf)? else {
        return Ok(None);
    };
    let message = match tag {
        TAG_AUTHENTICATION => {
            if payload.len() < 4 {
                return Err(ProtocolError::BadStartupParams);
            }
            let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if code == 0 {
                ServerMessage::AuthenticationOk
            } else {
                ServerMessage::AuthenticationOther { code }
            }
        }
        TAG_ERROR_RESPONSE => ServerMessage::ErrorResponse {
            message: extract_error_message(payload),
        },
        TAG_READY_FOR_QUERY => {
            let status = payload
                .first()
                .copied()
                .and_then(TransactionStatus::from_byte)
                .ok_or(ProtocolError::BadStartupParams)?;
            ServerMessage::ReadyForQuery { status }
        }
        TAG_ROW_DESCRIPTION => ServerMessage::RowDescription,
        TAG_DATA_ROW => ServerMessage::DataRow,
        TAG_COMMAND_COMPLETE => ServerMessage::CommandComplete {
            tag: cstr(payload).unwrap_or_default(),
        },
        other => ServerMessage::Other { tag: other },
    };
    Ok(Some((message, total)))
}

/// Parse zero or more server frames from `buf`, same contract as
/// [`parse_client_messages`].
pub fn parse_server_messages(
    buf: &[u8],
) -> Result<(Vec<ServerMessage>, usize), ProtocolError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    loop {
        let Some((tag, payload, total)) = try_take_frame(&buf[offset..])? else {
            break;
        };
        let message = match tag {
            TAG_AUTHENTICATION => {
                if payload.len() < 4 {
                    return Err(ProtocolError::BadStartupParams);
                }
                let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if code == 0 {
                    ServerMessage::AuthenticationOk
                } else {
                    ServerMessage::AuthenticationOther { code }
                }
            }
            TAG_ERROR_RESPONSE => {
                let message = extract_error_message(payload);
                ServerMessage::ErrorResponse { message }
            }
            TAG_READY_FOR_QUERY => {
                let status = payload
                    .first()
                    .copied()
                    .and_then(TransactionStatus::from_byte)
                    .ok_or(ProtocolError::BadStartupParams)?;
                ServerMessage::ReadyForQuery { status }
            }
            TAG_ROW_DESCRIPTION => ServerMessage::RowDescription,
            TAG_DATA_ROW => ServerMessage::DataRow,
            TAG_COMMAND_COMPLETE => {
                let tag_str = cstr(payload).unwrap_or_default();
                ServerMessage::CommandComplete { tag: tag_str }
            }
            other => ServerMessage::Other { tag: other },
        };
        messages.push(message);
        offset += total;
    }
    Ok((messages, offset))
}

fn cstr(payload: &[u8]) -> Option<String> {
    let end = payload.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&payload[..end]).into_owned())
}

/// `ErrorResponse` payload is a sequence of `code(1 byte) ‖ string \0` pairs
/// terminated by a final `\0`. We only care about the human-readable `M`
/// field; everything else is ignored.
fn extract_error_message(payload: &[u8]) -> String {
    let mut i = 0;
    while i < payload.len() {
        let code = payload[i];
        if code == 0 {
            break;
        }
        i += 1;
        let start = i;
        while i < payload.len() && payload[i] != 0 {
            i += 1;
        }
        let field = String::from_utf8_lossy(&payload[start..i]).into_owned();
        if i < payload.len() {
            i += 1; // skip the field's terminating null
        }
        if code == b'M' {
            return field;
        }
    }
    String::new()
}

// ---------------------------------------------------------------------
// Emission: the only frames this pooler itself originates.
// ---------------------------------------------------------------------

pub fn encode_ssl_request() -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(8);
    buf.put_i32(SSL_REQUEST_CODE);
    buf
}

pub fn encode_startup(params: &[(&str, &str)]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(PROTOCOL_VERSION_3);
    for (k, v) in params {
        body.put_slice(k.as_bytes());
        body.put_u8(0);
        body.put_slice(v.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_i32(4 + body.len() as i32);
    buf.put(body);
    buf
}

pub fn encode_authentication_ok() -> BytesMut {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(TAG_AUTHENTICATION);
    buf.put_i32(8);
    buf.put_i32(0);
    buf
}

pub fn encode_ready_for_query(status: TransactionStatus) -> BytesMut {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(TAG_READY_FOR_QUERY);
    buf.put_i32(5);
    buf.put_u8(status.as_byte());
    buf
}

pub fn encode_command_complete(tag: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + tag.len() + 1);
    buf.put_u8(TAG_COMMAND_COMPLETE);
    buf.put_i32(4 + tag.len() as i32 + 1);
    buf.put_slice(tag.as_bytes());
    buf.put_u8(0);
    buf
}

/// Fixed-severity `ErrorResponse`, matching the pooler's own synthesized
/// errors: severity `FATAL`, SQLSTATE `08006` (connection failure).
pub fn encode_error_response(message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    body.put_slice(b"FATAL\0");
    body.put_u8(b'V');
    body.put_slice(b"FATAL\0");
    body.put_u8(b'C');
    body.put_slice(b"08006\0");
    body.put_u8(b'M');
    body.put_slice(message.as_bytes());
    body.put_u8(0);
    body.put_u8(0);

    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(TAG_ERROR_RESPONSE);
    buf.put_i32(4 + body.len() as i32);
    buf.put(body);
    buf
}

pub fn encode_query(sql: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(6 + sql.len());
    buf.put_u8(TAG_QUERY);
    buf.put_i32(4 + sql.len() as i32 + 1);
    buf.put_slice(sql.as_bytes());
    buf.put_u8(0);
    buf
}

/// Writes a PostgreSQL C-string-pair `Startup` body for backend-connect,
/// using only the parameters this core needs: `user` and `database`.
pub fn encode_backend_startup(user: &str, database: &str) -> BytesMut {
    encode_startup(&[("user", user), ("database", database)])
}

/// Consume a byte previously read off the wire so callers can use `Buf`
/// helpers symmetrically with the rest of this module.
pub fn read_ssl_reply_byte(buf: &mut BytesMut) -> Option<u8> {
    if buf.is_empty() {
        return None;
    }
    Some(buf.get_u8())
}
