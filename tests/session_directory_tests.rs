// Integration tests for relay session caching

mod test_utils;

use futures::future::join_all;
use gatekeeper_relay::relay::{RelayError, RelaySessionDirectory};
use std::sync::Arc;
use test_utils::*;

#[tokio::test]
async fn test_concurrent_callers_share_one_session() {
    let broker = start_broker().await;
    let port = broker.local_addr().port();
    let directory = Arc::new(RelaySessionDirectory::new(connector()));

    let tasks = (0..8).map(|_| {
        let directory = directory.clone();
        tokio::spawn(async move { directory.get_or_create("127.0.0.1", port, false).await })
    });
    let sessions: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(directory.len().await, 1);
    assert_eq!(broker.stats().await.unwrap().topic_subscriptions, 0);
}

#[tokio::test]
async fn test_broker_loss_is_detected_on_next_use() {
    let broker = start_broker().await;
    let port = broker.local_addr().port();
    let directory = RelaySessionDirectory::new(connector());

    let session = directory.get_or_create("127.0.0.1", port, false).await.unwrap();
    let mut consumer = session.create_queue_consumer("REQ-cloud-a-idle").await.unwrap();
    broker.shutdown().unwrap();

    // Shutdown closes the connection without any traffic from the client
    let err = consumer.receive(LONG_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, RelayError::Connection { .. }));
    assert!(session.is_closed());

    // The stale entry is evicted and the listener is gone
    let err = directory.get_or_create("127.0.0.1", port, false).await.unwrap_err();
    assert!(matches!(err, RelayError::Connection { .. }));
    assert!(directory.is_empty().await);
}

#[tokio::test]
async fn test_distinct_endpoints_get_distinct_sessions() {
    let first = start_broker().await;
    let second = start_broker().await;
    let directory = RelaySessionDirectory::new(connector());

    let a = directory
        .get_or_create("127.0.0.1", first.local_addr().port(), false)
        .await
        .unwrap();
    let b = directory
        .get_or_create("127.0.0.1", second.local_addr().port(), false)
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(directory.len().await, 2);

    directory.close_all().await;
    assert!(a.is_closed() && b.is_closed());
    assert!(directory.is_empty().await);
}
