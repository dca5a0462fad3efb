//! The slice of the PostgreSQL wire protocol the pooler relies on.
//!
//! The pooler relays almost every message verbatim, so this module only
//! frames messages and understands the tags which drive pooling decisions.
//! It can also build the handful of messages the pooler sends on its own.
//!
//! For more information, see the official Postgres docs:
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

// Postgres won't allocate memory greater 1GiB, which gives us an upper bound
// to prevent a misbehaving peer from exhausting our memory.
const MAX_MESSAGE_SIZE: usize = 1 << 30;

// Startup packets are small; anything larger is not a real startup packet.
const MAX_STARTUP_SIZE: usize = 10_000;

/// Protocol version 3.0
pub const PROTOCOL_VERSION: u32 = 196_608;

/// The "version" sent by a client which wants to negotiate TLS.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;

/// The "version" sent by a client which wants to cancel a query.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// The "version" sent by a client which wants to negotiate GSS encryption.
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid message length {0}")]
    InvalidLength(usize),

    #[error("Truncated {0} message")]
    Truncated(&'static str),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Startup packet did not name a user")]
    MissingUser,
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// The first byte of every regular message, identifying its type.
///
/// Some tags mean different things depending on the direction of the
/// message (e.g. `S` is "Sync" from a client, and "ParameterStatus" from a
/// server), so the constants are named by meaning rather than by value.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u8);

impl Tag {
    // Sent by servers
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const COPY_IN_RESPONSE: Self = Self(b'G');
    pub const COPY_OUT_RESPONSE: Self = Self(b'H');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const READY_FOR_QUERY: Self = Self(b'Z');

    // Sent by either side
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');

    // Sent by clients
    pub const COPY_FAIL: Self = Self(b'f');
    pub const FUNCTION_CALL: Self = Self(b'F');
    pub const FLUSH: Self = Self(b'H');
    pub const PASSWORD: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    /// Returns true if a client message with this tag is answered with a
    /// ReadyForQuery once the server has processed it.
    pub fn expects_ready(self) -> bool {
        matches!(self, Tag::QUERY | Tag::SYNC | Tag::FUNCTION_CALL)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    // Builds a message with this tag, filling in the length once the body
    // has been written.
    fn frame(self, buf: &mut BytesMut, f: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        let start = buf.len();
        buf.put_u32(0);
        f(buf);
        let len = (buf.len() - start) as u32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

impl From<u8> for Tag {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0 as char)
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({})", self.0 as char)
    }
}

/// One complete message, exactly as it appeared on the wire.
#[derive(Clone, Debug)]
pub struct Message {
    raw: BytesMut,
}

impl Message {
    pub fn tag(&self) -> Tag {
        Tag(self.raw[0])
    }

    /// The message payload, without the tag and length.
    pub fn body(&self) -> &[u8] {
        &self.raw[5..]
    }

    /// The whole message, including the tag and length.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Splits one complete message off the front of `buf`, if one has been
/// fully received.
pub(crate) fn split_message(buf: &mut BytesMut) -> Result<Option<Message>, Error> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(Error::InvalidLength(len));
    }
    if buf.len() < len + 1 {
        buf.reserve(len + 1 - buf.len());
        return Ok(None);
    }
    Ok(Some(Message {
        raw: buf.split_to(len + 1),
    }))
}

/// Splits one complete startup packet (which has no tag) off the front of
/// `buf`, if one has been fully received.
pub(crate) fn split_startup(buf: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(8..=MAX_STARTUP_SIZE).contains(&len) {
        return Err(Error::InvalidLength(len));
    }
    if buf.len() < len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(len)))
}

/// A `(pid, secret)` pair which authorizes a CancelRequest.
///
/// Servers hand one out to the pooler, and the pooler hands its own to each
/// client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CancelKey {
    pub pid: u32,
    pub secret: u32,
}

impl CancelKey {
    /// Generates a fresh key for a client, derived from its id.
    pub(crate) fn generate(client: crate::ClientId) -> Self {
        Self {
            pid: client.0 as u32,
            secret: rand::random::<u32>() | 1,
        }
    }
}

/// Transaction status reported by a ReadyForQuery message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block (`I`)
    Idle,
    /// In a transaction block (`T`)
    InTransaction,
    /// In a failed transaction block (`E`)
    Failed,
}

impl TransactionStatus {
    fn as_u8(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Decodes the status byte of a ReadyForQuery message.
pub fn ready_status(msg: &Message) -> Result<TransactionStatus, Error> {
    match msg.body().first() {
        Some(b'I') => Ok(TransactionStatus::Idle),
        Some(b'T') => Ok(TransactionStatus::InTransaction),
        Some(b'E') => Ok(TransactionStatus::Failed),
        _ => Err(Error::Truncated("ReadyForQuery")),
    }
}

/// Decodes the request code of an Authentication message.
pub fn auth_code(msg: &Message) -> Result<u32, Error> {
    let mut body = msg.body();
    if body.len() < 4 {
        return Err(Error::Truncated("Authentication"));
    }
    Ok(body.get_u32())
}

/// Decodes a BackendKeyData message.
pub fn backend_key(msg: &Message) -> Result<CancelKey, Error> {
    let mut body = msg.body();
    if body.len() < 8 {
        return Err(Error::Truncated("BackendKeyData"));
    }
    Ok(CancelKey {
        pid: body.get_u32(),
        secret: body.get_u32(),
    })
}

// Reads a null-terminated string, advancing past the terminator.
fn read_cstr<'a>(body: &mut &'a [u8]) -> Option<&'a [u8]> {
    let end = body.iter().position(|b| *b == 0)?;
    let (value, rest) = body.split_at(end);
    *body = &rest[1..];
    Some(value)
}

/// Decodes a ParameterStatus message into its name and value.
pub fn parameter_status(msg: &Message) -> Result<(String, String), Error> {
    let mut body = msg.body();
    let name = read_cstr(&mut body).ok_or(Error::Truncated("ParameterStatus"))?;
    let value = read_cstr(&mut body).ok_or(Error::Truncated("ParameterStatus"))?;
    Ok((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

/// The fields of an ErrorResponse (or NoticeResponse) worth logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.severity, self.code, self.message)
    }
}

/// Decodes an ErrorResponse message.
pub fn error_fields(msg: &Message) -> ErrorFields {
    let mut fields = ErrorFields::default();
    let mut body = msg.body();
    while let Some((&kind, rest)) = body.split_first() {
        if kind == 0 {
            break;
        }
        body = rest;
        let Some(value) = read_cstr(&mut body) else {
            break;
        };
        let value = String::from_utf8_lossy(value).into_owned();
        match kind {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            _ => (),
        }
    }
    fields
}

/// The first packet sent by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartupPacket {
    SslRequest,
    GssEncRequest,
    Cancel(CancelKey),
    Startup(Startup),
}

/// The parameters of a StartupMessage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Startup {
    pub params: Vec<(String, String)>,
}

impl Startup {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.param("user")
    }

    /// The requested database, which defaults to the user name.
    pub fn database(&self) -> Option<&str> {
        self.param("database").or_else(|| self.user())
    }

    /// All parameters other than the user and database.
    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter(|(key, _)| key != "user" && key != "database")
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// Decodes a startup packet, as split by [split_startup].
pub fn parse_startup(packet: &[u8]) -> Result<StartupPacket, Error> {
    let mut body = packet
        .get(4..)
        .ok_or(Error::Truncated("StartupMessage"))?;
    if body.len() < 4 {
        return Err(Error::Truncated("StartupMessage"));
    }
    let code = body.get_u32();
    match code {
        SSL_REQUEST_CODE => Ok(StartupPacket::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupPacket::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            if body.len() < 8 {
                return Err(Error::Truncated("CancelRequest"));
            }
            Ok(StartupPacket::Cancel(CancelKey {
                pid: body.get_u32(),
                secret: body.get_u32(),
            }))
        }
        PROTOCOL_VERSION => {
            let mut startup = Startup::default();
            loop {
                let name = read_cstr(&mut body).ok_or(Error::Truncated("StartupMessage"))?;
                if name.is_empty() {
                    break;
                }
                let value = read_cstr(&mut body).ok_or(Error::Truncated("StartupMessage"))?;
                startup.params.push((
                    String::from_utf8_lossy(name).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                ));
            }
            if startup.user().is_none() {
                return Err(Error::MissingUser);
            }
            Ok(StartupPacket::Startup(startup))
        }
        version => Err(Error::UnsupportedVersion(version)),
    }
}

// The messages the pooler writes on its own.

pub fn put_startup_message(buf: &mut BytesMut, params: &[(&str, &str)]) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_u32(PROTOCOL_VERSION);
    for (name, value) in params {
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);
    let len = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

pub fn put_ssl_request(buf: &mut BytesMut) {
    buf.put_u32(8);
    buf.put_u32(SSL_REQUEST_CODE);
}

pub fn put_cancel_request(buf: &mut BytesMut, key: CancelKey) {
    buf.put_u32(16);
    buf.put_u32(CANCEL_REQUEST_CODE);
    buf.put_u32(key.pid);
    buf.put_u32(key.secret);
}

pub fn put_query(buf: &mut BytesMut, sql: &str) {
    Tag::QUERY.frame(buf, |b| {
        b.put_slice(sql.as_bytes());
        b.put_u8(0);
    });
}

pub fn put_terminate(buf: &mut BytesMut) {
    Tag::TERMINATE.frame(buf, |_| {});
}

pub fn put_password(buf: &mut BytesMut, password: &str) {
    Tag::PASSWORD.frame(buf, |b| {
        b.put_slice(password.as_bytes());
        b.put_u8(0);
    });
}

/// Authentication request `code`: 0 is "ok", 3 asks for a cleartext password.
pub fn put_authentication(buf: &mut BytesMut, code: u32) {
    Tag::AUTHENTICATION.frame(buf, |b| b.put_u32(code));
}

pub fn put_backend_key_data(buf: &mut BytesMut, key: CancelKey) {
    Tag::BACKEND_KEY_DATA.frame(buf, |b| {
        b.put_u32(key.pid);
        b.put_u32(key.secret);
    });
}

pub fn put_parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
    Tag::PARAMETER_STATUS.frame(buf, |b| {
        b.put_slice(name.as_bytes());
        b.put_u8(0);
        b.put_slice(value.as_bytes());
        b.put_u8(0);
    });
}

pub fn put_ready_for_query(buf: &mut BytesMut, status: TransactionStatus) {
    Tag::READY_FOR_QUERY.frame(buf, |b| b.put_u8(status.as_u8()));
}

pub fn put_error_response(buf: &mut BytesMut, severity: &str, code: &str, message: &str) {
    Tag::ERROR_RESPONSE.frame(buf, |b| {
        for (kind, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
            b.put_u8(kind);
            b.put_slice(value.as_bytes());
            b.put_u8(0);
        }
        b.put_u8(0);
    });
}

/// Reads the password out of a PasswordMessage.
pub fn password(msg: &Message) -> Result<String, Error> {
    let mut body = msg.body();
    let value = read_cstr(&mut body).ok_or(Error::Truncated("PasswordMessage"))?;
    Ok(String::from_utf8_lossy(value).into_owned())
}
