//! Process-wide registry of live sessions.
//!
//! One mutex guards the `cid → session` map. Registration happens *before*
//! the session connects to its agent: under a storm of concurrent `hello`
//! requests for the same container, exactly one caller wins the map slot
//! and everyone else fails deterministically with `AlreadyRegistered`. The
//! loser of a failed connect must deregister its own entry.

use std::{collections::HashMap, path::Path, sync::Arc};

use tokio::sync::Mutex;

use crate::{error::ProxyError, session::Session};

/// Mapping from container identifier to session.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Created` session for `cid`.
    ///
    /// The caller is expected to `connect()` the returned session next and
    /// to [`Registry::deregister`] it if that fails.
    ///
    /// # Errors
    ///
    /// `ProxyError::AlreadyRegistered` if `cid` is already present.
    pub async fn register(
        &self,
        cid: &str,
        ctl_path: &Path,
        io_path: &Path,
    ) -> Result<Arc<Session>, ProxyError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(cid) {
            return Err(ProxyError::AlreadyRegistered);
        }

        let session = Arc::new(Session::new(cid, ctl_path, io_path));
        sessions.insert(cid.to_owned(), Arc::clone(&session));

        tracing::debug!(cid, "registered session");
        Ok(session)
    }

    /// Look up the session for `cid`, if any.
    pub async fn lookup(&self, cid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(cid).cloned()
    }

    /// Remove the entry for `cid`, returning it if present.
    ///
    /// Removal happens before the session's own teardown so a new `hello`
    /// for the same container can re-register while the old session is
    /// still draining.
    pub async fn deregister(&self, cid: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().await.remove(cid);
        if removed.is_some() {
            tracing::debug!(cid, "deregistered session");
        }
        removed
    }

    /// Remove `session`'s entry, but only if the registry still maps its
    /// cid to this very session.
    ///
    /// Fault handling can race: by the time one observer of a dead session
    /// gets around to deregistering it, the cid may already belong to a
    /// fresh session. The identity check keeps the newcomer safe.
    pub async fn deregister_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(session.cid()).is_some_and(|current| Arc::ptr_eq(current, session)) {
            sessions.remove(session.cid());
            tracing::debug!(cid = session.cid(), "deregistered session");
            return true;
        }
        false
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (&'static Path, &'static Path) {
        (Path::new("/run/vm/ctl.sock"), Path::new("/run/vm/io.sock"))
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = Registry::new();
        let (ctl, io) = paths();

        let session = registry.register("c1", ctl, io).await.unwrap();
        assert_eq!(session.cid(), "c1");

        let found = registry.lookup("c1").await.unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert!(registry.lookup("nope").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = Registry::new();
        let (ctl, io) = paths();

        registry.register("c1", ctl, io).await.unwrap();
        assert!(matches!(
            registry.register("c1", ctl, io).await,
            Err(ProxyError::AlreadyRegistered)
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn deregister_frees_the_cid() {
        let registry = Registry::new();
        let (ctl, io) = paths();

        registry.register("c1", ctl, io).await.unwrap();
        assert!(registry.deregister("c1").await.is_some());
        assert!(registry.deregister("c1").await.is_none());

        // The cid is reusable immediately.
        registry.register("c1", ctl, io).await.unwrap();
    }

    #[tokio::test]
    async fn deregister_session_checks_identity() {
        let registry = Registry::new();
        let (ctl, io) = paths();

        let stale = registry.register("c1", ctl, io).await.unwrap();
        registry.deregister("c1").await;

        // The cid now belongs to a fresh session; the stale handle must
        // not be able to evict it.
        let fresh = registry.register("c1", ctl, io).await.unwrap();
        assert!(!registry.deregister_session(&stale).await);
        assert!(registry.lookup("c1").await.is_some());

        assert!(registry.deregister_session(&fresh).await);
        assert!(registry.lookup("c1").await.is_none());
    }

    #[tokio::test]
    async fn racing_registrations_elect_one_winner() {
        let registry = Arc::new(Registry::new());
        let (ctl, io) = paths();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.register("same", ctl, io).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.len().await, 1);
    }
}
