//! Client side of the relay broker connection.
//!
//! A [`RelaySession`] owns one TCP or TLS connection to a broker. Consumers
//! and producers are cheap handles multiplexed over it: each consumer gets a
//! subscription id, and the session's reader task routes `deliver` frames to
//! the matching consumer channel.
//!
//! Consumer creation waits for a ping round trip, so the subscription is
//! active on the broker when the call returns.

use crate::relay::config::{RelayClientConfig, TlsConfig};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::frame::{self, BrokerFrame, ClientFrame, Destination, MAX_FRAME_LEN};
use crate::relay::tls;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Opens sessions to relay brokers.
#[derive(Clone)]
pub struct RelayConnector {
    tls: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<String>,
    connect_timeout: Duration,
}

impl RelayConnector {
    /// Plain TCP connector
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            tls: None,
            server_name: None,
            connect_timeout,
        }
    }

    /// Enable secure connections with the given PEM material
    pub fn with_tls(mut self, tls_config: &TlsConfig) -> RelayResult<Self> {
        self.tls = Some(tls::client_config(tls_config)?);
        self.server_name = tls_config.server_name.clone();
        Ok(self)
    }

    pub fn from_config(config: &RelayClientConfig) -> RelayResult<Self> {
        let connector = Self::new(config.connect_timeout());
        match &config.tls {
            Some(tls_config) => connector.with_tls(tls_config),
            None => Ok(connector),
        }
    }

    /// Open a session to `host:port`. Nothing is kept when this fails.
    pub async fn connect(&self, host: &str, port: u16, secure: bool) -> RelayResult<Arc<RelaySession>> {
        if host.trim().is_empty() {
            return Err(RelayError::Validation("relay host is empty".to_string()));
        }
        if port == 0 {
            return Err(RelayError::Validation("relay port is zero".to_string()));
        }

        let endpoint = endpoint_key(host, port);
        tracing::debug!("Connecting to relay {} (secure: {})", endpoint, secure);

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RelayError::connection(&endpoint, "connect timed out"))?
            .map_err(|e| RelayError::connection(&endpoint, e))?;
        let _ = tcp.set_nodelay(true);

        let session = if secure {
            let config = self
                .tls
                .clone()
                .ok_or_else(|| RelayError::connection(&endpoint, "TLS is not configured"))?;

            let name = self.server_name.clone().unwrap_or_else(|| host.to_string());
            let server_name = ServerName::try_from(name)
                .map_err(|e| RelayError::connection(&endpoint, e))?;

            let stream = tokio::time::timeout(
                self.connect_timeout,
                TlsConnector::from(config).connect(server_name, tcp),
            )
            .await
            .map_err(|_| RelayError::connection(&endpoint, "TLS handshake timed out"))?
            .map_err(|e| RelayError::connection(&endpoint, e))?;

            RelaySession::start(endpoint, true, stream, self.connect_timeout)
        } else {
            RelaySession::start(endpoint, false, tcp, self.connect_timeout)
        };

        // The broker must answer before the session is handed out
        if let Err(e) = session.ping().await {
            session.close();
            return Err(e);
        }

        tracing::info!("Connected to relay {}", session.endpoint());
        Ok(session)
    }

    /// Close a session; errors are logged and swallowed
    pub fn close(&self, session: &RelaySession) {
        session.close();
    }

    pub fn is_closed(&self, session: &RelaySession) -> bool {
        session.is_closed()
    }
}

/// Directory key of a broker endpoint.
pub fn endpoint_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// State shared by the session and every handle created from it.
struct SessionLink {
    endpoint: String,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    routes: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl SessionLink {
    fn routes(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<String>>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pongs(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<()>>> {
        self.pongs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: ClientFrame) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::connection(&self.endpoint, "session is closed"));
        }
        self.outgoing
            .send(frame)
            .map_err(|_| RelayError::connection(&self.endpoint, "session writer stopped"))
    }

    /// Mark closed and drop every route, waking blocked consumers
    fn shut(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        self.routes().clear();
        self.pongs().clear();
        was_open
    }
}

/// One live connection to a relay broker.
pub struct RelaySession {
    link: Arc<SessionLink>,
    secure: bool,
    next_subscription: AtomicU64,
    barrier_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelaySession {
    /// Start the reader and writer tasks over an established stream
    pub fn start<S>(endpoint: String, secure: bool, stream: S, barrier_timeout: Duration) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let link = Arc::new(SessionLink {
            endpoint,
            outgoing: outgoing_tx,
            routes: Mutex::new(HashMap::new()),
            pongs: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        let (read_half, mut write_half) = tokio::io::split(stream);

        let writer_link = link.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let bytes = match frame::to_line(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Failed to serialize frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&bytes).await {
                    tracing::debug!("Write to relay {} failed: {}", writer_link.endpoint, e);
                    break;
                }
            }
            writer_link.shut();
            let _ = write_half.shutdown().await;
        });

        let reader_link = link.clone();
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
            loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match frame::from_line::<BrokerFrame>(&line) {
                            Ok(frame) => Self::dispatch(&reader_link, frame),
                            Err(e) => tracing::warn!("Unparseable frame from relay: {}", e),
                        }
                    }
                    None => {
                        tracing::debug!("Relay {} closed the connection", reader_link.endpoint);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Read from relay {} failed: {}", reader_link.endpoint, e);
                        break;
                    }
                }
            }
            reader_link.shut();
        });

        Arc::new(Self {
            link,
            secure,
            next_subscription: AtomicU64::new(1),
            barrier_timeout,
            tasks: Mutex::new(vec![reader, writer]),
        })
    }

    fn dispatch(link: &SessionLink, frame: BrokerFrame) {
        match frame {
            BrokerFrame::Deliver {
                subscription_id,
                body,
            } => {
                let route = link.routes().get(&subscription_id).cloned();
                match route {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::debug!("Delivery for released subscription {}", subscription_id),
                }
            }
            BrokerFrame::Pong => {
                if let Some(waiter) = link.pongs().pop_front() {
                    let _ = waiter.send(());
                }
            }
            BrokerFrame::Error { message } => {
                tracing::warn!("Relay {} reported: {}", link.endpoint, message);
            }
        }
    }

    /// `host:port` of the broker
    pub fn endpoint(&self) -> &str {
        &self.link.endpoint
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Round trip to the broker; every frame sent before has been processed on return
    pub async fn ping(&self) -> RelayResult<()> {
        let (tx, rx) = oneshot::channel();
        self.link.pongs().push_back(tx);
        self.link.send(ClientFrame::Ping)?;

        match tokio::time::timeout(self.barrier_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::connection(self.endpoint(), "session closed")),
            Err(_) => Err(RelayError::connection(self.endpoint(), "broker did not answer ping")),
        }
    }

    pub async fn create_topic_consumer(&self, topic: &str) -> RelayResult<MessageConsumer> {
        self.create_consumer(Destination::topic(topic)).await
    }

    pub async fn create_queue_consumer(&self, queue: &str) -> RelayResult<MessageConsumer> {
        self.create_consumer(Destination::queue(queue)).await
    }

    pub fn create_topic_producer(&self, topic: &str) -> RelayResult<MessageProducer> {
        self.create_producer(Destination::topic(topic))
    }

    pub fn create_queue_producer(&self, queue: &str) -> RelayResult<MessageProducer> {
        self.create_producer(Destination::queue(queue))
    }

    async fn create_consumer(&self, destination: Destination) -> RelayResult<MessageConsumer> {
        if destination.name.is_empty() {
            return Err(RelayError::Validation("destination name is empty".to_string()));
        }

        let subscription_id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.routes().insert(subscription_id, tx);

        let mut consumer = MessageConsumer {
            link: self.link.clone(),
            subscription_id,
            destination: destination.clone(),
            rx,
            closed: false,
        };

        // Dropping the consumer on an error path unsubscribes it
        self.link.send(ClientFrame::Subscribe {
            subscription_id,
            destination,
        })?;
        if let Err(e) = self.ping().await {
            consumer.close();
            return Err(e);
        }

        tracing::debug!("Subscribed to {} as {}", consumer.destination, subscription_id);
        Ok(consumer)
    }

    fn create_producer(&self, destination: Destination) -> RelayResult<MessageProducer> {
        if destination.name.is_empty() {
            return Err(RelayError::Validation("destination name is empty".to_string()));
        }
        if self.is_closed() {
            return Err(RelayError::connection(self.endpoint(), "session is closed"));
        }

        Ok(MessageProducer {
            link: self.link.clone(),
            destination,
            closed: false,
        })
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.link.shut() {
            tracing::debug!("Closing relay session {}", self.endpoint());
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("endpoint", &self.link.endpoint)
            .field("secure", &self.secure)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Subscription to a topic or queue. Unsubscribes on close and on drop.
pub struct MessageConsumer {
    link: Arc<SessionLink>,
    subscription_id: u64,
    destination: Destination,
    rx: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

impl MessageConsumer {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Wait for the next message; `Ok(None)` when `timeout` elapses first
    pub async fn receive(&mut self, timeout: Duration) -> RelayResult<Option<String>> {
        if self.closed {
            return Err(RelayError::connection(&self.link.endpoint, "consumer is closed"));
        }

        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(body)) => Ok(Some(body)),
            Ok(None) => Err(RelayError::connection(&self.link.endpoint, "session closed")),
        }
    }

    /// Release the broker subscription. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.link.routes().remove(&self.subscription_id);

        if !self.link.is_closed() {
            if let Err(e) = self.link.send(ClientFrame::Unsubscribe {
                subscription_id: self.subscription_id,
            }) {
                tracing::debug!("Unsubscribe from {} failed: {}", self.destination, e);
            }
        }
        self.rx.close();
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Publisher bound to one topic or queue.
pub struct MessageProducer {
    link: Arc<SessionLink>,
    destination: Destination,
    closed: bool,
}

impl MessageProducer {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn send(&self, body: String) -> RelayResult<()> {
        if self.closed {
            return Err(RelayError::connection(&self.link.endpoint, "producer is closed"));
        }
        self.link.send(ClientFrame::Publish {
            destination: self.destination.clone(),
            body,
        })
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::config::BrokerConfig;
    use crate::relay::server::BrokerInstance;

    async fn start_broker() -> (BrokerInstance, RelayConnector) {
        let broker = BrokerInstance::start(BrokerConfig::local()).await.unwrap();
        (broker, RelayConnector::new(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_queue_exchange() {
        let (broker, connector) = start_broker().await;
        let port = broker.local_addr().port();
        let session = connector.connect("127.0.0.1", port, false).await.unwrap();
        assert_eq!(session.endpoint(), format!("127.0.0.1:{port}"));

        let mut consumer = session.create_queue_consumer("REQ-b-1").await.unwrap();
        let producer = session.create_queue_producer("REQ-b-1").unwrap();
        producer.send("hello".to_string()).unwrap();

        let received = consumer.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.as_deref(), Some("hello"));

        let nothing = consumer.receive(Duration::from_millis(50)).await.unwrap();
        assert!(nothing.is_none());

        broker.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_consumer_drop_releases_subscription() {
        let (broker, connector) = start_broker().await;
        let session = connector
            .connect("127.0.0.1", broker.local_addr().port(), false)
            .await
            .unwrap();

        {
            let _consumer = session.create_topic_consumer("adverts").await.unwrap();
            assert_eq!(broker.stats().await.unwrap().topic_subscriptions, 1);
        }

        session.ping().await.unwrap();
        assert_eq!(broker.stats().await.unwrap().topic_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (broker, connector) = start_broker().await;
        let session = connector
            .connect("127.0.0.1", broker.local_addr().port(), false)
            .await
            .unwrap();
        let mut consumer = session.create_queue_consumer("q").await.unwrap();

        connector.close(&session);
        connector.close(&session);
        assert!(connector.is_closed(&session));

        assert!(matches!(
            consumer.receive(Duration::from_secs(1)).await,
            Err(RelayError::Connection { .. })
        ));
        assert!(session.create_queue_producer("q").is_err());
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let connector = RelayConnector::new(Duration::from_secs(1));
        assert!(matches!(
            connector.connect("", 61616, false).await,
            Err(RelayError::Validation(_))
        ));

        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connector.connect("127.0.0.1", port, false).await.unwrap_err();
        assert!(err.is_retryable());

        let (broker, _) = start_broker().await;
        let err = connector
            .connect("127.0.0.1", broker.local_addr().port(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }));
    }
}
