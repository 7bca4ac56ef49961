use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::{
    BackendMessage, ProtocolError, StartupCodec, StartupMessage, StartupParameters, sql_state,
};
use crate::session::{ClientStream, SessionError};

/// Time a client gets to finish its startup phase, as PostgreSQL's
/// `authentication_timeout`.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

pub enum HandshakeResult {
    /// Startup completed, ready for the upstream leg.
    Startup {
        stream: ClientStream,
        parameters: StartupParameters,
        /// Bytes the client sent after its StartupMessage.
        buffered: BytesMut,
    },
    /// Handshake was a CancelRequest.
    CancelRequested { process_id: i32 },
}

/// Client-side startup negotiation.
///
/// Runs SSL/GSSENC negotiation and reads the StartupMessage. The client is
/// not asked for a password: its identity was already settled by the
/// policy decision. SSL and GSSENC may each be negotiated once.
pub struct Handshake {
    socket: TcpStream,
    tls: Option<TlsAcceptor>,
    require_tls: bool,
    timeout: Duration,
}

impl Handshake {
    pub fn new(socket: TcpStream, tls: Option<TlsAcceptor>, require_tls: bool) -> Self {
        Self {
            socket,
            tls,
            require_tls,
            timeout: STARTUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(self) -> Result<HandshakeResult, SessionError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.negotiate())
            .await
            .map_err(|_| SessionError::StartupTimeout)?
    }

    async fn negotiate(self) -> Result<HandshakeResult, SessionError> {
        let mut framed = Framed::new(ClientStream::Plain(self.socket), StartupCodec::new());
        let mut ssl_negotiated = false;
        let mut gss_negotiated = false;

        loop {
            let message = match framed.next().await {
                Some(message) => message?,
                None => return Err(SessionError::ClientClosed),
            };

            match message {
                StartupMessage::SslRequest => {
                    if std::mem::replace(&mut ssl_negotiated, true) {
                        return Err(ProtocolError::InvalidMessage.into());
                    }
                    match &self.tls {
                        Some(acceptor) => framed = upgrade(framed, acceptor).await?,
                        None => decline(&mut framed).await?,
                    }
                }
                StartupMessage::GssEncRequest => {
                    if std::mem::replace(&mut gss_negotiated, true) {
                        return Err(ProtocolError::InvalidMessage.into());
                    }
                    decline(&mut framed).await?;
                }
                StartupMessage::Startup { parameters, .. } => {
                    if self.require_tls && !framed.get_ref().is_tls() {
                        BackendMessage::fatal(
                            sql_state::INVALID_AUTHORIZATION_SPECIFICATION,
                            "SSL connection is required",
                        )
                        .write(framed.get_mut())
                        .await?;
                        return Err(SessionError::TlsRequired);
                    }

                    debug!(
                        user = %parameters.user,
                        database = ?parameters.database,
                        tls = framed.get_ref().is_tls(),
                        "Client startup"
                    );

                    let parts = framed.into_parts();
                    return Ok(HandshakeResult::Startup {
                        stream: parts.io,
                        parameters,
                        buffered: parts.read_buf,
                    });
                }
                StartupMessage::CancelRequest { process_id, .. } => {
                    return Ok(HandshakeResult::CancelRequested { process_id });
                }
            }
        }
    }
}

/// Rejects an encryption request with 'N'.
async fn decline(framed: &mut Framed<ClientStream, StartupCodec>) -> Result<(), SessionError> {
    let stream = framed.get_mut();
    stream.write_all(b"N").await?;
    stream.flush().await?;
    Ok(())
}

/// Accepts an SSLRequest with 'S' and runs the TLS handshake.
async fn upgrade(
    framed: Framed<ClientStream, StartupCodec>,
    acceptor: &TlsAcceptor,
) -> Result<Framed<ClientStream, StartupCodec>, SessionError> {
    // Plaintext pipelined behind an SSLRequest would otherwise be treated as
    // if it had arrived over TLS.
    if !framed.read_buffer().is_empty() {
        return Err(ProtocolError::InvalidMessage.into());
    }

    let parts = framed.into_parts();
    let ClientStream::Plain(mut socket) = parts.io else {
        return Err(ProtocolError::InvalidMessage.into());
    };

    socket.write_all(b"S").await?;
    socket.flush().await?;

    let tls = acceptor.accept(socket).await.map_err(SessionError::Tls)?;
    Ok(Framed::new(
        ClientStream::Tls(Box::new(tls)),
        StartupCodec::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn startup_bytes(user: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(3 << 16);
        body.extend_from_slice(b"user\0");
        body.extend_from_slice(user.as_bytes());
        body.push(0);
        body.push(0);

        let mut buf = Vec::new();
        buf.put_i32(4 + body.len() as i32);
        buf.extend_from_slice(&body);
        buf
    }

    fn ssl_request_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_i32(8);
        buf.put_i32(80877103);
        buf
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_plain_startup() {
        let (mut client, server) = pair().await;
        client.write_all(&startup_bytes("alice")).await.unwrap();
        client.write_all(b"Qextra").await.unwrap();

        let result = Handshake::new(server, None, false).run().await.unwrap();
        let HandshakeResult::Startup {
            stream,
            parameters,
            buffered,
        } = result
        else {
            panic!("expected startup");
        };
        assert!(!stream.is_tls());
        assert_eq!(parameters.user, "alice");
        // Pipelined bytes may or may not have arrived with the startup packet.
        assert!(b"Qextra".starts_with(&buffered));
    }

    #[tokio::test]
    async fn test_ssl_declined_without_tls() {
        let (mut client, server) = pair().await;
        let handshake = tokio::spawn(Handshake::new(server, None, false).run());

        client.write_all(&ssl_request_bytes()).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), b'N');

        client.write_all(&startup_bytes("bob")).await.unwrap();
        let result = handshake.await.unwrap().unwrap();
        assert!(matches!(result, HandshakeResult::Startup { .. }));
    }

    #[tokio::test]
    async fn test_plaintext_rejected_when_tls_required() {
        let (mut client, server) = pair().await;
        client.write_all(&startup_bytes("carol")).await.unwrap();

        let err = Handshake::new(server, None, true).run().await.err().unwrap();
        assert!(matches!(err, SessionError::TlsRequired));
        assert_eq!(client.read_u8().await.unwrap(), b'E');
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let (mut client, server) = pair().await;
        let mut buf = Vec::new();
        buf.put_i32(16);
        buf.put_i32(80877102);
        buf.put_i32(11);
        buf.put_i32(22);
        client.write_all(&buf).await.unwrap();

        let result = Handshake::new(server, None, false).run().await.unwrap();
        assert!(matches!(
            result,
            HandshakeResult::CancelRequested { process_id: 11 }
        ));
    }

    #[tokio::test]
    async fn test_repeated_ssl_request_rejected() {
        let (mut client, server) = pair().await;
        let handshake = tokio::spawn(Handshake::new(server, None, false).run());

        client.write_all(&ssl_request_bytes()).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), b'N');
        client.write_all(&ssl_request_bytes()).await.unwrap();

        let err = handshake.await.unwrap().err().unwrap();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::InvalidMessage)
        ));
    }

    #[tokio::test]
    async fn test_repeated_gssenc_request_rejected() {
        let (mut client, server) = pair().await;
        let handshake = tokio::spawn(Handshake::new(server, None, false).run());

        client.write_all(&ssl_request_bytes()).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), b'N');
        let mut gssenc = Vec::new();
        gssenc.put_i32(8);
        gssenc.put_i32(80877104);
        client.write_all(&gssenc).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), b'N');
        client.write_all(&gssenc).await.unwrap();

        let err = handshake.await.unwrap().err().unwrap();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::InvalidMessage)
        ));
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let (_client, server) = pair().await;
        let err = Handshake::new(server, None, false)
            .with_timeout(Duration::from_millis(50))
            .run()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::StartupTimeout));
    }

    #[tokio::test]
    async fn test_client_hangs_up() {
        let (client, server) = pair().await;
        drop(client);
        let err = Handshake::new(server, None, false).run().await.err().unwrap();
        assert!(matches!(err, SessionError::ClientClosed));
    }
}
