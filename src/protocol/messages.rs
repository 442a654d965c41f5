use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::protocol::startup::StartupPacket;

pub type PgType = u32;

pub const PROTOCOL_VERSION_3: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message payload is truncated")]
    Truncated,
    #[error("message payload has trailing bytes")]
    TrailingBytes,
    #[error("cstring terminator missing")]
    MissingTerminator,
    #[error("{0} is not valid utf8")]
    InvalidUtf8(&'static str),
    #[error("invalid message length {0}")]
    InvalidLength(u32),
    #[error("message length {declared} exceeds the limit of {limit} bytes")]
    MessageTooLarge { declared: usize, limit: usize },
    #[error("unsupported startup code {0}")]
    UnsupportedStartupCode(u32),
    #[error("unsupported frontend message type '{}'", char::from(*.0))]
    UnknownMessage(u8),
    #[error("{0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupAction {
    Startup(StartupPacket),
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: u32, secret_key: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptionField {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: PgType,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format_code: i16,
}

impl RowDescriptionField {
    pub fn text(name: impl Into<String>, type_oid: PgType, type_size: i16) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size,
            type_modifier: -1,
            format_code: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query {
        sql: String,
    },
    Parse {
        statement_name: String,
        query: String,
        parameter_types: Vec<PgType>,
    },
    Bind {
        portal_name: String,
        statement_name: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    DescribeStatement {
        statement_name: String,
    },
    DescribePortal {
        portal_name: String,
    },
    CloseStatement {
        statement_name: String,
    },
    ClosePortal {
        portal_name: String,
    },
    /// Password, SASLInitialResponse and SASLResponse share the `p` tag;
    /// the authentication exchange decides how to read the payload.
    AuthResponse {
        data: Vec<u8>,
    },
    Flush,
    Sync,
    Terminate,
}

impl FrontendMessage {
    /// Messages of the extended-query flow; a failure in one of them puts
    /// the connection into discard-until-Sync mode.
    pub fn is_extended_query(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Bind { .. }
                | Self::Execute { .. }
                | Self::DescribeStatement { .. }
                | Self::DescribePortal { .. }
                | Self::CloseStatement { .. }
                | Self::ClosePortal { .. }
                | Self::Flush
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyForQueryStatus {
    Idle,
    InTransaction,
    FailedTransaction,
}

impl ReadyForQueryStatus {
    fn code(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::FailedTransaction => b'E',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password {
        salt: [u8; 4],
    },
    AuthenticationSasl {
        mechanisms: Vec<String>,
    },
    AuthenticationSaslContinue {
        data: Vec<u8>,
    },
    AuthenticationSaslFinal {
        data: Vec<u8>,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: u32,
        secret_key: u32,
    },
    ReadyForQuery {
        status: ReadyForQueryStatus,
    },
    ParseComplete,
    BindComplete,
    CloseComplete,
    EmptyQueryResponse,
    NoData,
    PortalSuspended,
    DataRow {
        values: Vec<Option<String>>,
    },
    CommandComplete {
        tag: String,
    },
    ParameterDescription {
        parameter_types: Vec<PgType>,
    },
    RowDescription {
        fields: Vec<RowDescriptionField>,
    },
    NoticeResponse {
        code: String,
        message: String,
    },
    ErrorResponse {
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },
}

impl BackendMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::ErrorResponse {
            code: code.to_string(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn command_complete(tag: &str, rows: u64) -> Self {
        Self::CommandComplete {
            tag: render_command_complete(tag, rows),
        }
    }
}

pub fn decode_startup_action(bytes: &[u8]) -> Result<StartupAction, ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::Malformed("startup packet is too short"));
    }
    let declared_len = BigEndian::read_u32(&bytes[0..4]);
    if declared_len as usize != bytes.len() {
        return Err(ProtocolError::Malformed("startup packet length mismatch"));
    }
    let code = BigEndian::read_u32(&bytes[4..8]);
    match code {
        PROTOCOL_VERSION_3 => parse_startup_parameters(bytes),
        SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
            if bytes.len() != 8 {
                return Err(ProtocolError::Malformed(
                    "encryption request packet has invalid length",
                ));
            }
            if code == SSL_REQUEST_CODE {
                Ok(StartupAction::SslRequest)
            } else {
                Ok(StartupAction::GssEncRequest)
            }
        }
        CANCEL_REQUEST_CODE => {
            if bytes.len() != 16 {
                return Err(ProtocolError::Malformed(
                    "cancel request packet has invalid length",
                ));
            }
            Ok(StartupAction::CancelRequest {
                process_id: BigEndian::read_u32(&bytes[8..12]),
                secret_key: BigEndian::read_u32(&bytes[12..16]),
            })
        }
        other => Err(ProtocolError::UnsupportedStartupCode(other)),
    }
}

fn parse_startup_parameters(bytes: &[u8]) -> Result<StartupAction, ProtocolError> {
    let mut cursor = Cursor::new(&bytes[8..]);
    let mut params = Vec::new();
    loop {
        let key = cursor.read_cstring()?;
        if key.is_empty() {
            break;
        }
        let value = cursor.read_cstring()?;
        params.push((key, value));
    }
    cursor.ensure_consumed()?;

    let user = params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("user"))
        .map(|(_, value)| value.clone())
        .ok_or(ProtocolError::Malformed(
            "startup packet is missing user parameter",
        ))?;
    let database = params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("database"))
        .map(|(_, value)| value.clone());

    Ok(StartupAction::Startup(StartupPacket {
        user,
        database,
        parameters: params,
    }))
}

pub fn decode_frontend_message(tag: u8, payload: &[u8]) -> Result<FrontendMessage, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let message = match tag {
        b'Q' => FrontendMessage::Query {
            sql: cursor.read_cstring()?,
        },
        b'P' => {
            let statement_name = cursor.read_cstring()?;
            let query = cursor.read_cstring()?;
            let count = cursor.read_count()?;
            let mut parameter_types = Vec::with_capacity(count);
            for _ in 0..count {
                parameter_types.push(cursor.read_i32()? as u32);
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                parameter_types,
            }
        }
        b'B' => {
            let portal_name = cursor.read_cstring()?;
            let statement_name = cursor.read_cstring()?;

            let param_format_count = cursor.read_count()?;
            let mut param_formats = Vec::with_capacity(param_format_count);
            for _ in 0..param_format_count {
                param_formats.push(cursor.read_i16()?);
            }

            let param_count = cursor.read_count()?;
            let mut params = Vec::with_capacity(param_count);
            for _ in 0..param_count {
                let len = cursor.read_i32()?;
                if len == -1 {
                    params.push(None);
                } else if len < -1 {
                    return Err(ProtocolError::Malformed("bind parameter length is invalid"));
                } else {
                    params.push(Some(cursor.read_bytes(len as usize)?.to_vec()));
                }
            }

            let result_format_count = cursor.read_count()?;
            let mut result_formats = Vec::with_capacity(result_format_count);
            for _ in 0..result_format_count {
                result_formats.push(cursor.read_i16()?);
            }

            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                params,
                result_formats,
            }
        }
        b'E' => FrontendMessage::Execute {
            portal_name: cursor.read_cstring()?,
            max_rows: cursor.read_i32()?,
        },
        b'D' => {
            let kind = cursor.read_u8()?;
            let name = cursor.read_cstring()?;
            match kind {
                b'S' => FrontendMessage::DescribeStatement {
                    statement_name: name,
                },
                b'P' => FrontendMessage::DescribePortal { portal_name: name },
                _ => return Err(ProtocolError::Malformed("describe message kind must be S or P")),
            }
        }
        b'C' => {
            let kind = cursor.read_u8()?;
            let name = cursor.read_cstring()?;
            match kind {
                b'S' => FrontendMessage::CloseStatement {
                    statement_name: name,
                },
                b'P' => FrontendMessage::ClosePortal { portal_name: name },
                _ => return Err(ProtocolError::Malformed("close message kind must be S or P")),
            }
        }
        b'p' => FrontendMessage::AuthResponse {
            data: cursor.read_bytes(payload.len())?.to_vec(),
        },
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'X' => FrontendMessage::Terminate,
        other => return Err(ProtocolError::UnknownMessage(other)),
    };
    cursor.ensure_consumed()?;
    Ok(message)
}

pub fn decode_password_message(payload: &[u8]) -> Result<String, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let password = cursor.read_cstring()?;
    cursor.ensure_consumed()?;
    Ok(password)
}

pub fn decode_sasl_initial_response(payload: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let mechanism = cursor.read_cstring()?;
    let len = cursor.read_i32()?;
    let data = if len < 0 {
        Vec::new()
    } else {
        cursor.read_bytes(len as usize)?.to_vec()
    };
    cursor.ensure_consumed()?;
    Ok((mechanism, data))
}

/// Appends one backend message to `out`.
pub fn encode_backend_message(message: &BackendMessage, out: &mut BytesMut) {
    match message {
        BackendMessage::AuthenticationOk => {
            let at = begin_frame(out, b'R');
            out.put_i32(0);
            end_frame(out, at);
        }
        BackendMessage::AuthenticationCleartextPassword => {
            let at = begin_frame(out, b'R');
            out.put_i32(3);
            end_frame(out, at);
        }
        BackendMessage::AuthenticationMd5Password { salt } => {
            let at = begin_frame(out, b'R');
            out.put_i32(5);
            out.put_slice(salt);
            end_frame(out, at);
        }
        BackendMessage::AuthenticationSasl { mechanisms } => {
            let at = begin_frame(out, b'R');
            out.put_i32(10);
            for mechanism in mechanisms {
                put_cstring(out, mechanism);
            }
            out.put_u8(0);
            end_frame(out, at);
        }
        BackendMessage::AuthenticationSaslContinue { data } => {
            let at = begin_frame(out, b'R');
            out.put_i32(11);
            out.put_slice(data);
            end_frame(out, at);
        }
        BackendMessage::AuthenticationSaslFinal { data } => {
            let at = begin_frame(out, b'R');
            out.put_i32(12);
            out.put_slice(data);
            end_frame(out, at);
        }
        BackendMessage::ParameterStatus { name, value } => {
            let at = begin_frame(out, b'S');
            put_cstring(out, name);
            put_cstring(out, value);
            end_frame(out, at);
        }
        BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        } => {
            let at = begin_frame(out, b'K');
            out.put_u32(*process_id);
            out.put_u32(*secret_key);
            end_frame(out, at);
        }
        BackendMessage::ReadyForQuery { status } => {
            let at = begin_frame(out, b'Z');
            out.put_u8(status.code());
            end_frame(out, at);
        }
        BackendMessage::ParseComplete => empty_frame(out, b'1'),
        BackendMessage::BindComplete => empty_frame(out, b'2'),
        BackendMessage::CloseComplete => empty_frame(out, b'3'),
        BackendMessage::EmptyQueryResponse => empty_frame(out, b'I'),
        BackendMessage::NoData => empty_frame(out, b'n'),
        BackendMessage::PortalSuspended => empty_frame(out, b's'),
        BackendMessage::DataRow { values } => encode_data_row(values, out),
        BackendMessage::CommandComplete { tag } => {
            let at = begin_frame(out, b'C');
            put_cstring(out, tag);
            end_frame(out, at);
        }
        BackendMessage::ParameterDescription { parameter_types } => {
            let at = begin_frame(out, b't');
            out.put_i16(parameter_types.len() as i16);
            for oid in parameter_types {
                out.put_u32(*oid);
            }
            end_frame(out, at);
        }
        BackendMessage::RowDescription { fields } => {
            let at = begin_frame(out, b'T');
            out.put_i16(fields.len() as i16);
            for field in fields {
                put_cstring(out, &field.name);
                out.put_u32(field.table_oid);
                out.put_i16(field.column_attr);
                out.put_u32(field.type_oid);
                out.put_i16(field.type_size);
                out.put_i32(field.type_modifier);
                out.put_i16(field.format_code);
            }
            end_frame(out, at);
        }
        BackendMessage::NoticeResponse { code, message } => {
            let at = begin_frame(out, b'N');
            put_error_fields(out, "NOTICE", code, message, None, None);
            end_frame(out, at);
        }
        BackendMessage::ErrorResponse {
            code,
            message,
            detail,
            hint,
        } => {
            let at = begin_frame(out, b'E');
            put_error_fields(out, "ERROR", code, message, detail.as_deref(), hint.as_deref());
            end_frame(out, at);
        }
    }
}

/// DataRow in text format, written straight from a borrowed row.
pub fn encode_data_row(values: &[Option<String>], out: &mut BytesMut) {
    let at = begin_frame(out, b'D');
    out.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(text) => {
                out.put_i32(text.len() as i32);
                out.put_slice(text.as_bytes());
            }
            None => out.put_i32(-1),
        }
    }
    end_frame(out, at);
}

fn put_error_fields(
    out: &mut BytesMut,
    severity: &str,
    code: &str,
    message: &str,
    detail: Option<&str>,
    hint: Option<&str>,
) {
    out.put_u8(b'S');
    put_cstring(out, severity);
    out.put_u8(b'V');
    put_cstring(out, severity);
    out.put_u8(b'C');
    put_cstring(out, code);
    out.put_u8(b'M');
    put_cstring(out, message);
    if let Some(detail) = detail {
        out.put_u8(b'D');
        put_cstring(out, detail);
    }
    if let Some(hint) = hint {
        out.put_u8(b'H');
        put_cstring(out, hint);
    }
    out.put_u8(0);
}

pub fn render_command_complete(tag: &str, rows: u64) -> String {
    let upper = tag.trim().to_ascii_uppercase();
    match upper.as_str() {
        "INSERT" => format!("INSERT 0 {}", rows),
        "SELECT" | "UPDATE" | "DELETE" | "MOVE" | "FETCH" | "COPY" => {
            format!("{} {}", upper, rows)
        }
        _ => upper,
    }
}

fn begin_frame(out: &mut BytesMut, tag: u8) -> usize {
    out.put_u8(tag);
    let at = out.len();
    out.put_u32(0);
    at
}

fn end_frame(out: &mut BytesMut, at: usize) {
    let len = (out.len() - at) as u32;
    BigEndian::write_u32(&mut out[at..at + 4], len);
}

fn empty_frame(out: &mut BytesMut, tag: u8) {
    out.put_u8(tag);
    out.put_u32(4);
}

fn put_cstring(out: &mut BytesMut, value: &str) {
    out.put_slice(value.as_bytes());
    out.put_u8(0);
}

// Client-side helpers. The gateway never sends these; they back the
// integration tests and the framing benchmark.

pub fn encode_startup_packet(packet: &StartupPacket) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u32(0);
    out.put_u32(PROTOCOL_VERSION_3);
    for (key, value) in &packet.parameters {
        put_cstring(&mut out, key);
        put_cstring(&mut out, value);
    }
    out.put_u8(0);
    let len = out.len() as u32;
    BigEndian::write_u32(&mut out[0..4], len);
    out.to_vec()
}

pub fn encode_ssl_request() -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&8u32.to_be_bytes());
    out.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    out
}

pub fn encode_cancel_request(process_id: u32, secret_key: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&16u32.to_be_bytes());
    out.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    out.extend_from_slice(&process_id.to_be_bytes());
    out.extend_from_slice(&secret_key.to_be_bytes());
    out
}

pub fn encode_frontend_message(message: &FrontendMessage) -> Vec<u8> {
    let mut out = BytesMut::new();
    match message {
        FrontendMessage::Query { sql } => {
            let at = begin_frame(&mut out, b'Q');
            put_cstring(&mut out, sql);
            end_frame(&mut out, at);
        }
        FrontendMessage::Parse {
            statement_name,
            query,
            parameter_types,
        } => {
            let at = begin_frame(&mut out, b'P');
            put_cstring(&mut out, statement_name);
            put_cstring(&mut out, query);
            out.put_i16(parameter_types.len() as i16);
            for oid in parameter_types {
                out.put_u32(*oid);
            }
            end_frame(&mut out, at);
        }
        FrontendMessage::Bind {
            portal_name,
            statement_name,
            param_formats,
            params,
            result_formats,
        } => {
            let at = begin_frame(&mut out, b'B');
            put_cstring(&mut out, portal_name);
            put_cstring(&mut out, statement_name);
            out.put_i16(param_formats.len() as i16);
            for format in param_formats {
                out.put_i16(*format);
            }
            out.put_i16(params.len() as i16);
            for param in params {
                match param {
                    Some(raw) => {
                        out.put_i32(raw.len() as i32);
                        out.put_slice(raw);
                    }
                    None => out.put_i32(-1),
                }
            }
            out.put_i16(result_formats.len() as i16);
            for format in result_formats {
                out.put_i16(*format);
            }
            end_frame(&mut out, at);
        }
        FrontendMessage::Execute {
            portal_name,
            max_rows,
        } => {
            let at = begin_frame(&mut out, b'E');
            put_cstring(&mut out, portal_name);
            out.put_i32(*max_rows);
            end_frame(&mut out, at);
        }
        FrontendMessage::DescribeStatement { statement_name } => {
            let at = begin_frame(&mut out, b'D');
            out.put_u8(b'S');
            put_cstring(&mut out, statement_name);
            end_frame(&mut out, at);
        }
        FrontendMessage::DescribePortal { portal_name } => {
            let at = begin_frame(&mut out, b'D');
            out.put_u8(b'P');
            put_cstring(&mut out, portal_name);
            end_frame(&mut out, at);
        }
        FrontendMessage::CloseStatement { statement_name } => {
            let at = begin_frame(&mut out, b'C');
            out.put_u8(b'S');
            put_cstring(&mut out, statement_name);
            end_frame(&mut out, at);
        }
        FrontendMessage::ClosePortal { portal_name } => {
            let at = begin_frame(&mut out, b'C');
            out.put_u8(b'P');
            put_cstring(&mut out, portal_name);
            end_frame(&mut out, at);
        }
        FrontendMessage::AuthResponse { data } => {
            let at = begin_frame(&mut out, b'p');
            out.put_slice(data);
            end_frame(&mut out, at);
        }
        FrontendMessage::Flush => empty_frame(&mut out, b'H'),
        FrontendMessage::Sync => empty_frame(&mut out, b'S'),
        FrontendMessage::Terminate => empty_frame(&mut out, b'X'),
    }
    out.to_vec()
}

pub fn decode_backend_message(tag: u8, payload: &[u8]) -> Result<BackendMessage, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let message = match tag {
        b'R' => match cursor.read_i32()? {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let raw = cursor.read_bytes(4)?;
                BackendMessage::AuthenticationMd5Password {
                    salt: [raw[0], raw[1], raw[2], raw[3]],
                }
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mechanism = cursor.read_cstring()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                BackendMessage::AuthenticationSasl { mechanisms }
            }
            11 => BackendMessage::AuthenticationSaslContinue {
                data: cursor.read_bytes(cursor.remaining())?.to_vec(),
            },
            12 => BackendMessage::AuthenticationSaslFinal {
                data: cursor.read_bytes(cursor.remaining())?.to_vec(),
            },
            _ => return Err(ProtocolError::Malformed("unknown authentication request")),
        },
        b'S' => BackendMessage::ParameterStatus {
            name: cursor.read_cstring()?,
            value: cursor.read_cstring()?,
        },
        b'K' => BackendMessage::BackendKeyData {
            process_id: cursor.read_i32()? as u32,
            secret_key: cursor.read_i32()? as u32,
        },
        b'Z' => BackendMessage::ReadyForQuery {
            status: match cursor.read_u8()? {
                b'I' => ReadyForQueryStatus::Idle,
                b'T' => ReadyForQueryStatus::InTransaction,
                b'E' => ReadyForQueryStatus::FailedTransaction,
                _ => return Err(ProtocolError::Malformed("unknown transaction status")),
            },
        },
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'I' => BackendMessage::EmptyQueryResponse,
        b'n' => BackendMessage::NoData,
        b's' => BackendMessage::PortalSuspended,
        b'D' => {
            let count = cursor.read_count()?;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let len = cursor.read_i32()?;
                if len < 0 {
                    values.push(None);
                } else {
                    let raw = cursor.read_bytes(len as usize)?;
                    values.push(Some(decode_utf8(raw, "data row value")?));
                }
            }
            BackendMessage::DataRow { values }
        }
        b'C' => BackendMessage::CommandComplete {
            tag: cursor.read_cstring()?,
        },
        b't' => {
            let count = cursor.read_count()?;
            let mut parameter_types = Vec::with_capacity(count);
            for _ in 0..count {
                parameter_types.push(cursor.read_i32()? as u32);
            }
            BackendMessage::ParameterDescription { parameter_types }
        }
        b'T' => {
            let count = cursor.read_count()?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(RowDescriptionField {
                    name: cursor.read_cstring()?,
                    table_oid: cursor.read_i32()? as u32,
                    column_attr: cursor.read_i16()?,
                    type_oid: cursor.read_i32()? as u32,
                    type_size: cursor.read_i16()?,
                    type_modifier: cursor.read_i32()?,
                    format_code: cursor.read_i16()?,
                });
            }
            BackendMessage::RowDescription { fields }
        }
        b'E' | b'N' => {
            let mut code = String::new();
            let mut message = String::new();
            let mut detail = None;
            let mut hint = None;
            loop {
                let field = cursor.read_u8()?;
                if field == 0 {
                    break;
                }
                let value = cursor.read_cstring()?;
                match field {
                    b'C' => code = value,
                    b'M' => message = value,
                    b'D' => detail = Some(value),
                    b'H' => hint = Some(value),
                    _ => {}
                }
            }
            if tag == b'N' {
                BackendMessage::NoticeResponse { code, message }
            } else {
                BackendMessage::ErrorResponse {
                    code,
                    message,
                    detail,
                    hint,
                }
            }
        }
        other => return Err(ProtocolError::UnknownMessage(other)),
    };
    cursor.ensure_consumed()?;
    Ok(message)
}

fn find_zero(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|b| *b == 0)
        .map(|offset| from + offset)
}

fn decode_utf8(bytes: &[u8], context: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(context))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    idx: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, idx: 0 }
    }

    fn ensure_consumed(&self) -> Result<(), ProtocolError> {
        if self.idx == self.bytes.len() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes)
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.idx)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if len > self.remaining() {
            return Err(ProtocolError::Truncated);
        }
        let out = &self.bytes[self.idx..self.idx + len];
        self.idx += len;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(BigEndian::read_i16(self.read_bytes(2)?))
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(BigEndian::read_i32(self.read_bytes(4)?))
    }

    fn read_count(&mut self) -> Result<usize, ProtocolError> {
        let count = self.read_i16()?;
        if count < 0 {
            return Err(ProtocolError::Malformed("negative element count"));
        }
        Ok(count as usize)
    }

    fn read_cstring(&mut self) -> Result<String, ProtocolError> {
        let start = self.idx;
        let end = find_zero(self.bytes, start).ok_or(ProtocolError::MissingTerminator)?;
        self.idx = end + 1;
        decode_utf8(&self.bytes[start..end], "cstring")
    }
}
