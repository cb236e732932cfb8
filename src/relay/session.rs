// Cache of live relay sessions, one per broker endpoint

use crate::relay::error::RelayResult;
use crate::relay::transport::{endpoint_key, RelayConnector, RelaySession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shares one live session per `host:port` between concurrent callers.
///
/// Closed sessions are evicted when they are next looked up.
pub struct RelaySessionDirectory {
    connector: RelayConnector,
    sessions: Mutex<HashMap<String, Arc<RelaySession>>>,
}

impl RelaySessionDirectory {
    pub fn new(connector: RelayConnector) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn connector(&self) -> &RelayConnector {
        &self.connector
    }

    /// Return the live session for the endpoint, connecting if there is none
    pub async fn get_or_create(&self, host: &str, port: u16, secure: bool) -> RelayResult<Arc<RelaySession>> {
        let key = endpoint_key(host, port);

        // The lock is held across the connect so concurrent callers share one session
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = sessions.get(&key) {
            if !self.connector.is_closed(session) {
                return Ok(session.clone());
            }
            tracing::debug!("Evicting closed relay session {}", key);
            sessions.remove(&key);
        }

        let session = self.connector.connect(host, port, secure).await?;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Remove the session from the directory and close it
    pub async fn release(&self, session: &RelaySession) {
        let mut sessions = self.sessions.lock().await;

        let owned = sessions
            .get(session.endpoint())
            .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), session));
        if owned {
            sessions.remove(session.endpoint());
        }
        drop(sessions);

        self.connector.close(session);
    }

    /// Close every cached session
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (key, session) in sessions.drain() {
            tracing::debug!("Closing relay session {}", key);
            self.connector.close(&session);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::config::BrokerConfig;
    use crate::relay::server::BrokerInstance;
    use std::time::Duration;

    #[tokio::test]
    async fn test_session_reuse_and_eviction() {
        let broker = BrokerInstance::start(BrokerConfig::local()).await.unwrap();
        let port = broker.local_addr().port();
        let directory = RelaySessionDirectory::new(RelayConnector::new(Duration::from_secs(5)));

        let first = directory.get_or_create("127.0.0.1", port, false).await.unwrap();
        let second = directory.get_or_create("127.0.0.1", port, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(directory.len().await, 1);

        first.close();
        let third = directory.get_or_create("127.0.0.1", port, false).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(!third.is_closed());

        directory.release(&third).await;
        assert!(third.is_closed());
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_release_of_replaced_session_keeps_new_one() {
        let broker = BrokerInstance::start(BrokerConfig::local()).await.unwrap();
        let port = broker.local_addr().port();
        let directory = RelaySessionDirectory::new(RelayConnector::new(Duration::from_secs(5)));

        let old = directory.get_or_create("127.0.0.1", port, false).await.unwrap();
        old.close();
        let fresh = directory.get_or_create("127.0.0.1", port, false).await.unwrap();

        directory.release(&old).await;
        assert_eq!(directory.len().await, 1);
        assert!(!fresh.is_closed());

        directory.close_all().await;
        assert!(fresh.is_closed());
    }
}
