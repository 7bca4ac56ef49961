use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::codec::{get_cstring, write_cstring};
use crate::protocol::error::ProtocolError;

/// SQLSTATE codes the gateway reports to clients.
pub mod sql_state {
    pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
    pub const CONNECTION_FAILURE: &str = "08006";
}

/// Messages the gateway writes to the client.
#[derive(Debug)]
pub enum BackendMessage {
    /// 'R' - Authentication response (AuthenticationOk)
    AuthenticationOk,
    /// 'E' - Error response
    ErrorResponse { fields: Vec<ErrorField> },
}

impl BackendMessage {
    /// Builds a FATAL ErrorResponse with the given SQLSTATE and message.
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        BackendMessage::ErrorResponse {
            fields: vec![
                ErrorField::new(ErrorFieldCode::Severity, "FATAL"),
                ErrorField::new(ErrorFieldCode::SeverityNonLocalized, "FATAL"),
                ErrorField::new(ErrorFieldCode::SqlState, code),
                ErrorField::new(ErrorFieldCode::Message, message),
            ],
        }
    }

    /// Appends a detail field to an ErrorResponse. No-op for other messages.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        if let BackendMessage::ErrorResponse { fields } = &mut self {
            fields.push(ErrorField::new(ErrorFieldCode::Detail, detail));
        }
        self
    }

    /// Write this message to the stream.
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        match self {
            BackendMessage::AuthenticationOk => {
                w.write_u8(b'R').await?;
                w.write_i32(8).await?; // length
                w.write_i32(0).await?; // auth type 0 = Ok
            }
            BackendMessage::ErrorResponse { fields } => {
                w.write_u8(b'E').await?;
                let body_len: usize =
                    fields.iter().map(|f| 1 + f.value.len() + 1).sum::<usize>() + 1;
                w.write_i32((4 + body_len) as i32).await?;
                for field in fields {
                    w.write_u8(field.code.as_u8()).await?;
                    write_cstring(w, &field.value).await?;
                }
                w.write_u8(0).await?; // terminator
            }
        }
        w.flush().await
    }
}

/// Error/Notice field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorField {
    pub code: ErrorFieldCode,
    pub value: String,
}

impl ErrorField {
    pub fn new(code: ErrorFieldCode, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }
}

/// Error and notice message field type codes.
/// See: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorFieldCode {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    Severity = b'S',
    /// Severity (non-localized): Same as Severity but never localized
    SeverityNonLocalized = b'V',
    /// SQLSTATE code
    SqlState = b'C',
    /// Primary human-readable error message
    Message = b'M',
    /// Optional detail message
    Detail = b'D',
}

impl ErrorFieldCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A tagged message received from the upstream during its startup phase.
#[derive(Debug)]
pub struct UpstreamMessage {
    pub tag: u8,
    pub body: BytesMut,
}

/// Authentication request codes carried by an upstream 'R' message.
#[derive(Debug, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    Other(i32),
}

impl UpstreamMessage {
    /// Interprets an 'R' message.
    pub fn authentication(&self) -> Result<Authentication, ProtocolError> {
        if self.tag != b'R' {
            return Err(ProtocolError::UnexpectedMessageType(self.tag));
        }
        let mut body = self.body.clone();
        if body.len() < 4 {
            return Err(ProtocolError::InvalidMessage);
        }
        let auth = match body.get_i32() {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                if body.len() < 4 {
                    return Err(ProtocolError::InvalidMessage);
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Authentication::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mechanism = get_cstring(&mut body)?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Authentication::Sasl { mechanisms }
            }
            other => Authentication::Other(other),
        };
        Ok(auth)
    }

    /// Extracts the primary message of an 'E' message.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        if self.tag != b'E' {
            return Err(ProtocolError::UnexpectedMessageType(self.tag));
        }
        let mut body = self.body.clone();
        let mut message = None;
        while !body.is_empty() {
            let code = body.get_u8();
            if code == 0 {
                break;
            }
            let value = get_cstring(&mut body)?;
            if code == ErrorFieldCode::Message.as_u8() {
                message = Some(value);
            }
        }
        Ok(message.unwrap_or_else(|| "unknown upstream error".to_string()))
    }
}
