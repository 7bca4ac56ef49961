use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::SessionHandler;

/// Returned by [`Registry::register`] once draining has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("registry is draining")]
pub struct RegistryClosed;

/// A registry of live sessions.
///
/// Used to find every session at shutdown. Draining flips the registry
/// closed under the same lock that enumerates it, so a session admitted
/// concurrently with shutdown is either drained or refused, never missed.
pub struct Registry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    // session id -> handler
    sessions: HashMap<String, Arc<dyn SessionHandler>>,
    draining: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a session. The entry is removed when the returned
    /// registration is dropped, however the session ends.
    pub fn register(
        &self,
        session: Arc<dyn SessionHandler>,
    ) -> Result<Registration<'_>, RegistryClosed> {
        let id = session.id().to_string();
        let mut state = self.inner.lock();
        if state.draining {
            return Err(RegistryClosed);
        }
        state.sessions.insert(id.clone(), session);
        Ok(Registration { registry: self, id })
    }

    /// Removes a session. No-op if absent.
    pub fn unregister(&self, id: &str) {
        self.inner.lock().sessions.remove(id);
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Refuses further registrations and closes every live session.
    /// Returns the number of sessions closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.inner.lock();
            state.draining = true;
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            session.close();
        }
        drained.len()
    }
}

/// Keeps a session registered for as long as it lives.
#[must_use = "the session is unregistered when this is dropped"]
pub struct Registration<'a> {
    registry: &'a Registry,
    id: String,
}

impl Registration<'_> {
    #[cfg(test)]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::LoadBalancer;
    use crate::secret::SecretStore;
    use crate::service::Service;
    use crate::session::SessionError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct CountingSession {
        id: String,
        closes: AtomicUsize,
    }

    impl CountingSession {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionHandler for CountingSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn created_at(&self) -> DateTime<Utc> {
            Utc::now()
        }

        async fn connect(
            &self,
            _cancel: &CancellationToken,
            _balancer: &dyn LoadBalancer,
            _service: &Service,
            _secrets: &dyn SecretStore,
        ) -> Result<(), SessionError> {
            Ok(())
        }

        async fn serve(&self, _cancel: &CancellationToken) -> Result<(), SessionError> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_registration_lifecycle() {
        let registry = Registry::new();
        let session = CountingSession::new("a");

        let registration = registry.register(session.clone()).unwrap();
        assert_eq!(registration.id(), "a");
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);

        drop(registration);
        assert!(registry.is_empty());
        assert_eq!(session.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = Registry::new();
        registry.unregister("missing");
        let _registration = registry.register(CountingSession::new("a")).unwrap();
        registry.unregister("a");
        registry.unregister("a");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all_closes_and_refuses() {
        let registry = Registry::new();
        let a = CountingSession::new("a");
        let b = CountingSession::new("b");
        let reg_a = registry.register(a.clone()).unwrap();
        let reg_b = registry.register(b.clone()).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert!(registry.is_draining());
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);

        assert_eq!(
            registry.register(CountingSession::new("c")).err(),
            Some(RegistryClosed)
        );

        // Late guards find nothing to remove.
        drop(reg_a);
        drop(reg_b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_and_drain() {
        let registry = Registry::new();
        let sessions: Vec<_> = (0..64)
            .map(|i| CountingSession::new(&format!("s{i}")))
            .collect();

        std::thread::scope(|scope| {
            for session in &sessions {
                let registry = &registry;
                scope.spawn(move || {
                    if let Ok(registration) = registry.register(session.clone()) {
                        std::mem::forget(registration);
                    }
                });
            }
            scope.spawn(|| registry.close_all());
        });
        registry.close_all();

        // Every session either got drained (closed once) or was refused.
        assert!(registry.is_empty());
        for session in &sessions {
            assert!(session.closes.load(Ordering::SeqCst) <= 1);
        }
    }
}
