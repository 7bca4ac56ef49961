use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::access_log::{AccessLogEntry, AccessLogSink, SessionEvent, TracingAccessLog};
use crate::balancer::LoadBalancer;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::policy::{AuthResponse, DownstreamRequest, PolicyClient};
use crate::secret::{Secret, SecretStore};
use crate::server::admission::{Admission, AdmissionGate};
use crate::server::registry::Registry;
use crate::server::tls::CredentialManager;
use crate::server::DEFAULT_CLUSTER_CERTIFICATE_SECRET;
use crate::service::{Service, ServiceCache};
use crate::session::{PgSessionFactory, SessionFactory, SessionHandler};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Consecutive accept failures between warnings.
const ACCEPT_FAILURE_WARN_INTERVAL: u64 = 50;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators and settings for a [`Server`].
pub struct ServerOptions {
    pub services: Arc<ServiceCache>,
    pub policy: Arc<dyn PolicyClient>,
    pub secrets: Arc<dyn SecretStore>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub sessions: Arc<dyn SessionFactory>,
    pub access_log: Arc<dyn AccessLogSink>,
    pub cluster_certificate_secret: String,
    /// Upper bound on waiting for connection tasks during `close`.
    pub drain_timeout: Duration,
}

impl ServerOptions {
    pub fn new(
        services: Arc<ServiceCache>,
        policy: Arc<dyn PolicyClient>,
        secrets: Arc<dyn SecretStore>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        Self {
            services,
            policy,
            secrets,
            balancer,
            sessions: Arc::new(PgSessionFactory),
            access_log: Arc::new(TracingAccessLog),
            cluster_certificate_secret: DEFAULT_CLUSTER_CERTIFICATE_SECRET.to_string(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_session_factory(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_access_log(mut self, access_log: Arc<dyn AccessLogSink>) -> Self {
        self.access_log = access_log;
        self
    }

    pub fn with_cluster_certificate_secret(mut self, name: impl Into<String>) -> Self {
        self.cluster_certificate_secret = name.into();
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

enum Phase {
    Constructed,
    Running { accept_loop: JoinHandle<()> },
    Closed,
}

/// Lifecycle supervisor for one exposed service.
///
/// `run` binds the listener and starts accepting; `close` stops accepting,
/// drains every live session and fires the completion signal. A closed
/// server cannot be run again.
pub struct Server {
    shared: Arc<Shared>,
    // Held across the whole of run/close, which makes close idempotent and
    // lets concurrent callers return only after teardown has finished.
    phase: Mutex<Phase>,
}

/// State reachable from the accept loop and every connection task.
struct Shared {
    services: Arc<ServiceCache>,
    secrets: Arc<dyn SecretStore>,
    balancer: Arc<dyn LoadBalancer>,
    sessions: Arc<dyn SessionFactory>,
    access_log: Arc<dyn AccessLogSink>,
    cluster_certificate_secret: String,
    drain_timeout: Duration,
    bound: OnceLock<SocketAddr>,
    tls: RwLock<Option<TlsAcceptor>>,
    /// Fired by `close`; observed by the accept loop and every connection.
    cancel: CancellationToken,
    /// Fired once teardown has finished.
    done: CancellationToken,
    tracker: TaskTracker,
    registry: Registry,
    credentials: CredentialManager,
    metrics: Arc<SessionMetrics>,
    gate: AdmissionGate,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let metrics = Arc::new(SessionMetrics::new());
        let gate = AdmissionGate::new(
            options.policy,
            options.access_log.clone(),
            metrics.clone(),
        );
        Self {
            shared: Arc::new(Shared {
                services: options.services,
                secrets: options.secrets,
                balancer: options.balancer,
                sessions: options.sessions,
                access_log: options.access_log,
                cluster_certificate_secret: options.cluster_certificate_secret,
                drain_timeout: options.drain_timeout,
                bound: OnceLock::new(),
                tls: RwLock::new(None),
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
                tracker: TaskTracker::new(),
                registry: Registry::new(),
                credentials: CredentialManager::new(),
                metrics,
                gate,
            }),
            phase: Mutex::new(Phase::Constructed),
        }
    }

    /// Binds the listening socket, configures TLS when the service requires
    /// it, and starts the accept loop. Returns once the server is accepting.
    pub async fn run(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Constructed => {}
            Phase::Running { .. } => return Err(Error::AlreadyRunning),
            Phase::Closed => return Err(Error::Closed),
        }

        let shared = &self.shared;
        let service = shared.services.get().ok_or(Error::ServiceUnavailable)?;
        let addr = service.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        if service.tls {
            shared.load_cluster_certificate().await?;
            let config = shared.credentials.server_config()?;
            *shared.tls.write() = Some(TlsAcceptor::from(config));
        }

        let _ = shared.bound.set(local_addr);
        info!(service = %service.name, addr = %local_addr, tls = service.tls, "Listening");

        let dispatcher = shared.clone();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            shared.cancel.clone(),
            shared.metrics.clone(),
            move |socket, source| {
                let conn = dispatcher.clone();
                dispatcher
                    .tracker
                    .spawn(async move { conn.handle_conn(socket, source).await });
            },
        ));

        *phase = Phase::Running { accept_loop };
        Ok(())
    }

    /// Shuts the server down. Idempotent; every caller returns after
    /// teardown has completed.
    pub async fn close(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        let accept_loop = match std::mem::replace(&mut *phase, Phase::Closed) {
            Phase::Closed => return Ok(()),
            Phase::Constructed => None,
            Phase::Running { accept_loop } => Some(accept_loop),
        };

        let shared = &self.shared;
        info!("Closing server");
        shared.cancel.cancel();

        let drained = shared.registry.close_all();

        // The listener is dropped when the loop returns.
        if let Some(accept_loop) = accept_loop {
            if let Err(e) = accept_loop.await {
                warn!(error = %e, "Accept loop task failed");
            }
        }

        shared.tracker.close();
        if tokio::time::timeout(shared.drain_timeout, shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = shared.tracker.len(),
                "Connection tasks still running after drain timeout"
            );
        }

        shared.done.cancel();
        info!(drained, "Server closed");
        Ok(())
    }

    /// Resolves once `close` has finished.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.bound.get().copied()
    }

    /// Installs (or with `None`, removes) the cluster certificate. Applies
    /// to handshakes that start after this returns.
    pub fn set_cluster_certificate(&self, secret: Option<&Secret>) -> Result<()> {
        self.shared.credentials.set_cluster_certificate(secret)?;
        Ok(())
    }

    /// Re-reads the cluster certificate secret and installs it. A missing
    /// secret leaves the current certificate in place.
    pub async fn reload_cluster_certificate(&self) -> Result<()> {
        self.shared.load_cluster_certificate().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    async fn load_cluster_certificate(&self) -> Result<()> {
        let name = &self.cluster_certificate_secret;
        match self.secrets.get_secret(name).await {
            Ok(secret) => self.credentials.set_cluster_certificate(Some(&secret))?,
            Err(e) if e.is_not_found() => {
                warn!(secret = %name, "Cluster certificate not found; TLS handshakes will fail until one is installed");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn handle_conn(&self, socket: TcpStream, source: SocketAddr) {
        let started_at = Utc::now();
        debug!(%source, "Accepted connection");

        let Some(service) = self.services.get() else {
            warn!(%source, "No service descriptor available; dropping connection");
            return;
        };

        let destination = socket.local_addr().unwrap_or_else(|_| service.listen_addr());
        let request = DownstreamRequest {
            source,
            destination,
        };
        let auth = match self
            .gate
            .admit(request, &service, started_at, &self.cancel)
            .await
        {
            Admission::Admitted(auth) => auth,
            Admission::Unauthenticated | Admission::Unauthorized(_) | Admission::Cancelled => {
                return;
            }
        };

        let tls = if service.tls {
            self.tls.read().clone()
        } else {
            None
        };
        let session = tokio::select! {
            res = self.sessions.handshake(socket, tls, &service, &auth) => match res {
                Ok(session) => session,
                Err(e) => {
                    debug!(%source, error = %e, "Downstream handshake failed");
                    return;
                }
            },
            _ = self.cancel.cancelled() => return,
        };

        if let Err(e) = session
            .connect(
                &self.cancel,
                self.balancer.as_ref(),
                &service,
                self.secrets.as_ref(),
            )
            .await
        {
            self.metrics.record_establish_failure();
            error!(%source, session_id = session.id(), error = %e, "Failed to establish session");
            session.close();
            return;
        }

        let entry = |event| self.session_entry(event, &service, session.as_ref(), source, started_at, &auth);
        self.access_log.emit(entry(SessionEvent::SessionStart));

        match self.registry.register(session.clone()) {
            Ok(registration) => {
                self.metrics.at_session_start();
                if let Err(e) = session.serve(&self.cancel).await {
                    debug!(session_id = session.id(), error = %e, "Session ended with error");
                }
                drop(registration);
                self.metrics.at_session_end(session.created_at());
            }
            Err(e) => debug!(session_id = session.id(), error = %e, "Session refused"),
        }

        self.access_log.emit(entry(SessionEvent::SessionEnd));
        session.close();
    }

    fn session_entry(
        &self,
        event: SessionEvent,
        service: &Service,
        session: &dyn SessionHandler,
        source: SocketAddr,
        started_at: DateTime<Utc>,
        auth: &AuthResponse,
    ) -> AccessLogEntry {
        AccessLogEntry {
            event,
            service: service.name.clone(),
            session_id: Some(session.id().to_string()),
            source,
            started_at,
            timestamp: Utc::now(),
            is_authenticated: auth.is_authenticated,
            is_authorized: auth.is_authorized,
            request_context: auth.request_context.clone(),
            reason: auth.reason.clone(),
        }
    }
}

/// Source of inbound connections for [`accept_loop`].
trait Accept: Send {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accepts until `cancel` fires, handing each connection to `dispatch`.
///
/// Accept errors never end the loop on their own: the loop sleeps for
/// [`ACCEPT_RETRY_DELAY`] and tries again, checking for shutdown first.
async fn accept_loop<L, F>(
    mut listener: L,
    cancel: CancellationToken,
    metrics: Arc<SessionMetrics>,
    mut dispatch: F,
) where
    L: Accept,
    F: FnMut(TcpStream, SocketAddr) + Send,
{
    let mut consecutive_failures: u64 = 0;

    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = cancel.cancelled() => break,
        };

        match accepted {
            Ok((socket, source)) => {
                consecutive_failures = 0;
                dispatch(socket, source);
            }
            Err(e) => {
                metrics.record_accept_error();
                consecutive_failures += 1;

                if e.kind() != io::ErrorKind::TimedOut && cancel.is_cancelled() {
                    break;
                }
                if consecutive_failures % ACCEPT_FAILURE_WARN_INTERVAL == 1 {
                    warn!(error = %e, consecutive_failures, "Accept failed; retrying");
                } else {
                    debug!(error = %e, consecutive_failures, "Accept failed; retrying");
                }

                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobin;
    use crate::policy::{StaticPolicy, StaticPolicyConfig};
    use crate::secret::{MemorySecretStore, SecretError};
    use crate::service::PostgresUpstream;
    use crate::access_log::testing::RecordingAccessLog;
    use crate::session::SessionError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Fails with each queued error kind before accepting for real.
    struct FlakyListener {
        inner: TcpListener,
        failures: VecDeque<io::ErrorKind>,
        attempts: Arc<AtomicUsize>,
    }

    impl Accept for FlakyListener {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.failures.pop_front() {
                Some(kind) => Err(io::Error::from(kind)),
                None => self.inner.accept().await,
            }
        }
    }

    /// Always fails.
    struct BrokenListener;

    impl Accept for BrokenListener {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            Err(io::Error::from(io::ErrorKind::ConnectionAborted))
        }
    }

    #[tokio::test]
    async fn test_accept_loop_survives_transient_errors() {
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = FlakyListener {
            inner,
            failures: VecDeque::from([
                io::ErrorKind::TimedOut,
                io::ErrorKind::ConnectionAborted,
                io::ErrorKind::Other,
            ]),
            attempts: attempts.clone(),
        };

        let cancel = CancellationToken::new();
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(
            listener,
            cancel.clone(),
            metrics.clone(),
            move |_socket, source| {
                let _ = tx.send(source);
            },
        ));

        let client = TcpStream::connect(addr).await.unwrap();
        let source = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source, client.local_addr().unwrap());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.snapshot().accept_errors, 3);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_cancel_while_failing() {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(SessionMetrics::new());
        let task = tokio::spawn(accept_loop(
            BrokenListener,
            cancel.clone(),
            metrics.clone(),
            |_socket, _source| unreachable!(),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(metrics.snapshot().accept_errors >= 2);
    }

    fn service(port: u16, tls: bool) -> Service {
        Service {
            name: "orders".to_string(),
            listen_address: "127.0.0.1".parse().unwrap(),
            port,
            tls,
            upstreams: vec!["127.0.0.1:1".to_string()],
            postgres: PostgresUpstream::default(),
        }
    }

    fn options(service: Service, secrets: Arc<dyn SecretStore>) -> ServerOptions {
        ServerOptions::new(
            Arc::new(ServiceCache::new(service)),
            Arc::new(StaticPolicy::new(StaticPolicyConfig::default())),
            secrets,
            Arc::new(RoundRobin::default()),
        )
        .with_drain_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_run_and_close_lifecycle() {
        let server = Server::new(options(service(0, false), Arc::new(MemorySecretStore::new())));
        assert!(server.local_addr().is_none());

        server.run().await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(server.run().await, Err(Error::AlreadyRunning)));

        server.close().await.unwrap();
        server.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .unwrap();
        assert!(matches!(server.run().await, Err(Error::Closed)));

        // The listening socket is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_close_before_run() {
        let server = Server::new(options(service(0, false), Arc::new(MemorySecretStore::new())));
        server.close().await.unwrap();
        server.closed().await;
        assert!(matches!(server.run().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = Server::new(options(service(port, false), Arc::new(MemorySecretStore::new())));
        let err = server.run().await.unwrap_err();
        assert!(matches!(err, Error::Bind { addr, .. } if addr.port() == port));
    }

    #[tokio::test]
    async fn test_missing_service_descriptor() {
        let mut options = options(service(0, false), Arc::new(MemorySecretStore::new()));
        options.services = Arc::new(ServiceCache::default());
        let server = Server::new(options);
        assert!(matches!(server.run().await, Err(Error::ServiceUnavailable)));
    }

    #[tokio::test]
    async fn test_tls_without_certificate_is_not_fatal() {
        let server = Server::new(options(service(0, true), Arc::new(MemorySecretStore::new())));
        server.run().await.unwrap();
        assert!(server.shared.credentials.current_certificate().is_none());
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_loads_cluster_certificate() {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.insert(Secret::tls(
            "gateway-cert",
            ck.cert.pem(),
            ck.key_pair.serialize_pem(),
        ));

        let server = Server::new(
            options(service(0, true), secrets).with_cluster_certificate_secret("gateway-cert"),
        );
        server.run().await.unwrap();
        let installed = server.shared.credentials.current_certificate().unwrap();
        assert_eq!(installed.cert[0].to_vec(), ck.cert.der().to_vec());
        server.close().await.unwrap();
    }

    struct FailingSecretStore;

    #[async_trait]
    impl SecretStore for FailingSecretStore {
        async fn get_secret(&self, name: &str) -> std::result::Result<Secret, SecretError> {
            Err(SecretError::Io {
                name: name.to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
        }
    }

    #[tokio::test]
    async fn test_tls_secret_failure_is_fatal() {
        let server = Server::new(options(service(0, true), Arc::new(FailingSecretStore)));
        assert!(matches!(server.run().await, Err(Error::Secret(_))));
    }

    #[tokio::test]
    async fn test_reload_keeps_certificate_when_secret_removed() {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.insert(Secret::tls(
            DEFAULT_CLUSTER_CERTIFICATE_SECRET,
            ck.cert.pem(),
            ck.key_pair.serialize_pem(),
        ));

        let server = Server::new(options(service(0, true), secrets.clone()));
        server.run().await.unwrap();
        assert!(server.shared.credentials.current_certificate().is_some());

        secrets.remove(DEFAULT_CLUSTER_CERTIFICATE_SECRET);
        server.reload_cluster_certificate().await.unwrap();
        assert!(server.shared.credentials.current_certificate().is_some());

        server.set_cluster_certificate(None).unwrap();
        assert!(server.shared.credentials.current_certificate().is_none());
        server.close().await.unwrap();
    }

    /// Shared between the test and the session it stalls.
    #[derive(Default)]
    struct Stall {
        connecting: Notify,
        release: Notify,
        closes: AtomicUsize,
        access_log: Arc<RecordingAccessLog>,
        entries_at_close: AtomicUsize,
    }

    /// A session whose upstream connect blocks until released, even
    /// through shutdown.
    struct StalledSession {
        created_at: DateTime<Utc>,
        stall: Arc<Stall>,
    }

    #[async_trait]
    impl SessionHandler for StalledSession {
        fn id(&self) -> &str {
            "stalled"
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.created_at
        }

        async fn connect(
            &self,
            _cancel: &CancellationToken,
            _balancer: &dyn LoadBalancer,
            _service: &Service,
            _secrets: &dyn SecretStore,
        ) -> std::result::Result<(), SessionError> {
            self.stall.connecting.notify_one();
            self.stall.release.notified().await;
            Ok(())
        }

        async fn serve(&self, _cancel: &CancellationToken) -> std::result::Result<(), SessionError> {
            Ok(())
        }

        fn close(&self) {
            self.stall.closes.fetch_add(1, Ordering::SeqCst);
            self.stall
                .entries_at_close
                .store(self.stall.access_log.entries().len(), Ordering::SeqCst);
        }
    }

    struct StalledSessionFactory(Arc<Stall>);

    #[async_trait]
    impl SessionFactory for StalledSessionFactory {
        async fn handshake(
            &self,
            _socket: TcpStream,
            _tls: Option<TlsAcceptor>,
            _service: &Service,
            _auth: &AuthResponse,
        ) -> std::result::Result<Arc<dyn SessionHandler>, SessionError> {
            Ok(Arc::new(StalledSession {
                created_at: Utc::now(),
                stall: self.0.clone(),
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_connecting_during_close_is_refused() {
        let stall = Arc::new(Stall::default());
        let access_log = stall.access_log.clone();
        let server = Arc::new(Server::new(
            options(service(0, false), Arc::new(MemorySecretStore::new()))
                .with_session_factory(Arc::new(StalledSessionFactory(stall.clone())))
                .with_access_log(access_log.clone())
                .with_drain_timeout(Duration::from_secs(5)),
        ));
        server.run().await.unwrap();

        let _client = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), stall.connecting.notified())
            .await
            .unwrap();

        let closing = tokio::spawn({
            let server = server.clone();
            async move { server.close().await }
        });
        while !server.shared.registry.is_draining() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stall.release.notify_one();

        tokio::time::timeout(Duration::from_secs(5), closing)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let events: Vec<_> = access_log.entries().iter().map(|e| e.event).collect();
        assert_eq!(events, [SessionEvent::SessionStart, SessionEvent::SessionEnd]);
        assert_eq!(stall.closes.load(Ordering::SeqCst), 1);
        // Released only after its end-of-session entry.
        assert_eq!(stall.entries_at_close.load(Ordering::SeqCst), 2);
        assert_eq!(server.active_sessions(), 0);
        assert_eq!(server.metrics().started, 0);
    }
}
