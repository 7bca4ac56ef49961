use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::codec::{get_cstring, put_cstring, write_cstring};
use crate::protocol::error::ProtocolError;

/// Protocol version 3.0
pub const PROTOCOL_VERSION_3: i32 = 3 << 16;

// Request codes that share the version slot of a startup packet.
pub const CANCEL_REQUEST_CODE: i32 = (1234 << 16) | 5678;
pub const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679;
pub const GSSENC_REQUEST_CODE: i32 = (1234 << 16) | 5680;

/// What a client may send before its session starts.
#[derive(Debug)]
pub enum StartupMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup {
        protocol_version: i32,
        parameters: StartupParameters,
    },
}

impl StartupMessage {
    /// Decodes a framed packet whose length prefix has been stripped.
    pub(crate) fn decode(mut body: BytesMut) -> Result<Self, ProtocolError> {
        let code = body.get_i32();
        match code {
            SSL_REQUEST_CODE => Ok(Self::SslRequest),
            GSSENC_REQUEST_CODE => Ok(Self::GssEncRequest),
            CANCEL_REQUEST_CODE => {
                if body.remaining() < 8 {
                    return Err(ProtocolError::InvalidMessage);
                }
                Ok(Self::CancelRequest {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            version if version >> 16 == 3 => Ok(Self::Startup {
                protocol_version: version,
                parameters: StartupParameters::decode(body)?,
            }),
            _ => Err(ProtocolError::UnsupportedProtocolVersion(code)),
        }
    }
}

/// Name/value pairs from a StartupMessage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParameters {
    pub user: String,
    pub database: Option<String>,
    pub application_name: Option<String>,
    pub client_encoding: Option<String>,
    /// Everything else, forwarded upstream untouched.
    pub other: BTreeMap<String, String>,
}

impl StartupParameters {
    fn decode(mut body: BytesMut) -> Result<Self, ProtocolError> {
        let mut params = Self::default();

        // A lone NUL ends the list; tolerate a missing one at the very end.
        while !body.is_empty() {
            let name = get_cstring(&mut body)?;
            if name.is_empty() {
                break;
            }
            let value = get_cstring(&mut body)?;
            match name.as_str() {
                "user" => params.user = value,
                "database" => params.database = Some(value),
                "application_name" => params.application_name = Some(value),
                "client_encoding" => params.client_encoding = Some(value),
                _ => {
                    params.other.insert(name, value);
                }
            }
        }

        if params.user.is_empty() {
            return Err(ProtocolError::MissingParameter("user"));
        }
        Ok(params)
    }

    fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        let known = [
            ("user", Some(self.user.as_str())),
            ("database", self.database.as_deref()),
            ("application_name", self.application_name.as_deref()),
            ("client_encoding", self.client_encoding.as_deref()),
        ];
        known
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, value)))
            .chain(
                self.other
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            )
    }

    /// Sends these parameters as a protocol 3.0 StartupMessage.
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        let mut packet = BytesMut::new();
        packet.put_i32(0);
        packet.put_i32(PROTOCOL_VERSION_3);
        for (name, value) in self.pairs() {
            put_cstring(&mut packet, name);
            put_cstring(&mut packet, value);
        }
        packet.put_u8(0);

        let len = packet.len() as i32;
        packet[..4].copy_from_slice(&len.to_be_bytes());
        w.write_all(&packet).await?;
        w.flush().await
    }
}

/// Answers an upstream cleartext password request.
pub async fn write_password_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    password: &str,
) -> std::io::Result<()> {
    w.write_u8(b'p').await?;
    w.write_i32((4 + password.len() + 1) as i32).await?;
    write_cstring(w, password).await?;
    w.flush().await
}
