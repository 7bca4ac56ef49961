use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::balancer::LoadBalancer;
use crate::policy::{AuthResponse, RequestContext};
use crate::protocol::{
    Authentication, BackendCodec, BackendMessage, ProtocolError, StartupParameters,
    sql_state, write_password_message,
};
use crate::secret::SecretStore;
use crate::service::Service;
use crate::session::handshake::{Handshake, HandshakeResult};
use crate::session::{ClientStream, SessionError, SessionFactory, SessionHandler};

/// One side of a session plus whatever was read past its startup phase.
struct Leg<S> {
    stream: S,
    buffered: BytesMut,
}

/// Builds [`PgSession`]s from freshly admitted sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgSessionFactory;

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn handshake(
        &self,
        socket: TcpStream,
        tls: Option<TlsAcceptor>,
        service: &Service,
        auth: &AuthResponse,
    ) -> Result<Arc<dyn SessionHandler>, SessionError> {
        match Handshake::new(socket, tls, service.tls).run().await? {
            HandshakeResult::Startup {
                stream,
                parameters,
                buffered,
            } => Ok(Arc::new(PgSession::new(
                stream,
                parameters,
                buffered,
                auth.request_context.clone(),
            ))),
            HandshakeResult::CancelRequested { process_id } => {
                debug!(process_id, "Dropping cancel request");
                Err(SessionError::CancelRequest)
            }
        }
    }
}

/// A PostgreSQL session relayed between a client and one upstream server.
pub struct PgSession {
    id: String,
    created_at: DateTime<Utc>,
    startup: StartupParameters,
    request_context: RequestContext,
    downstream: Mutex<Option<Leg<ClientStream>>>,
    upstream: Mutex<Option<Leg<TcpStream>>>,
    closed: CancellationToken,
}

impl PgSession {
    pub fn new(
        stream: ClientStream,
        startup: StartupParameters,
        buffered: BytesMut,
        request_context: RequestContext,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            startup,
            request_context,
            downstream: Mutex::new(Some(Leg { stream, buffered })),
            upstream: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Startup parameters sent upstream: configured identity first, the
    /// client's own otherwise. Protocol extension options (`_pq_.*`) are
    /// negotiated per hop and stay behind.
    fn upstream_parameters(&self, service: &Service) -> StartupParameters {
        let pg = &service.postgres;
        let mut params = StartupParameters {
            user: pg.user.clone().unwrap_or_else(|| self.startup.user.clone()),
            database: pg.database.clone().or_else(|| self.startup.database.clone()),
            ..self.startup.clone()
        };
        params.other.retain(|name, _| !name.starts_with("_pq_."));
        params
    }

    async fn password(
        &self,
        service: &Service,
        secrets: &dyn SecretStore,
    ) -> Result<String, SessionError> {
        let Some(name) = &service.postgres.password_secret else {
            return Err(SessionError::PasswordUnavailable);
        };
        let secret = secrets.get_secret(name).await?;
        Ok(secret.as_value()?.to_string())
    }

    /// Dials the upstream and completes its authentication exchange.
    async fn establish(
        &self,
        balancer: &dyn LoadBalancer,
        service: &Service,
        secrets: &dyn SecretStore,
    ) -> Result<Leg<TcpStream>, SessionError> {
        let stream = balancer.select_and_connect(service).await?;
        let mut framed = Framed::new(stream, BackendCodec::new());
        self.upstream_parameters(service)
            .write(framed.get_mut())
            .await?;

        loop {
            let message = match framed.next().await {
                Some(message) => message?,
                None => return Err(SessionError::UpstreamClosed),
            };

            match message.tag {
                b'R' => match message.authentication()? {
                    Authentication::Ok => break,
                    Authentication::CleartextPassword => {
                        let password = self.password(service, secrets).await?;
                        write_password_message(framed.get_mut(), &password).await?;
                    }
                    Authentication::Md5Password { .. } => {
                        return Err(SessionError::UnsupportedAuthentication("md5".to_string()));
                    }
                    Authentication::Sasl { mechanisms } => {
                        return Err(SessionError::UnsupportedAuthentication(format!(
                            "SASL ({})",
                            mechanisms.join(", ")
                        )));
                    }
                    Authentication::Other(code) => {
                        return Err(SessionError::UnsupportedAuthentication(format!(
                            "code {code}"
                        )));
                    }
                },
                b'E' => return Err(SessionError::UpstreamRejected(message.error_message()?)),
                // NoticeResponse
                b'N' => {}
                // NegotiateProtocolVersion: the upstream speaks an older minor
                // version or ignored some options. Either way 3.0 still holds.
                b'v' => debug!(session_id = %self.id, "Upstream negotiated protocol version"),
                tag => return Err(ProtocolError::UnexpectedMessageType(tag).into()),
            }
        }

        let parts = framed.into_parts();
        Ok(Leg {
            stream: parts.io,
            buffered: parts.read_buf,
        })
    }

    /// Tells the client why its session could not be established.
    async fn report_failure(&self, error: &SessionError) {
        let mut downstream = self.downstream.lock().await;
        if let Some(leg) = downstream.as_mut() {
            let _ = BackendMessage::fatal(
                sql_state::CONNECTION_FAILURE,
                "could not establish upstream connection",
            )
            .with_detail(error.to_string())
            .write(&mut leg.stream)
            .await;
        }
    }
}

#[async_trait]
impl SessionHandler for PgSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        balancer: &dyn LoadBalancer,
        service: &Service,
        secrets: &dyn SecretStore,
    ) -> Result<(), SessionError> {
        let result = tokio::select! {
            res = self.establish(balancer, service, secrets) => res,
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = self.closed.cancelled() => Err(SessionError::Closed),
        };

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                self.report_failure(&e).await;
                return Err(e);
            }
        };

        {
            let mut downstream = self.downstream.lock().await;
            let leg = downstream.as_mut().ok_or(SessionError::Closed)?;
            BackendMessage::AuthenticationOk
                .write(&mut leg.stream)
                .await?;
        }
        *self.upstream.lock().await = Some(upstream);

        debug!(
            session_id = %self.id,
            principal = ?self.request_context.principal,
            "Upstream established"
        );
        Ok(())
    }

    async fn serve(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let downstream = self.downstream.lock().await.take();
        let upstream = self.upstream.lock().await.take();
        let (Some(mut downstream), Some(mut upstream)) = (downstream, upstream) else {
            return Err(SessionError::NotConnected);
        };

        let relay = async {
            if !downstream.buffered.is_empty() {
                upstream.stream.write_all(&downstream.buffered).await?;
            }
            if !upstream.buffered.is_empty() {
                downstream.stream.write_all(&upstream.buffered).await?;
                downstream.stream.flush().await?;
            }
            copy_bidirectional(&mut downstream.stream, &mut upstream.stream).await
        };

        tokio::select! {
            res = relay => {
                let (to_upstream, to_downstream) = res?;
                debug!(session_id = %self.id, to_upstream, to_downstream, "Relay finished");
            }
            _ = self.closed.cancelled() => {
                debug!(session_id = %self.id, "Session closed");
            }
            _ = cancel.cancelled() => {
                debug!(session_id = %self.id, "Session cancelled by shutdown");
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
        // Release sockets that never reached serve(). While serve() runs it
        // owns both legs and exits on the token above.
        if let Ok(mut downstream) = self.downstream.try_lock() {
            downstream.take();
        }
        if let Ok(mut upstream) = self.upstream.try_lock() {
            upstream.take();
        }
    }
}
