// Relay broker: topic fan-out and queue routing

use crate::relay::client::ClientManager;
use crate::relay::frame::{BrokerFrame, ClientFrame, Destination, DestinationKind};
use crate::relay::queue::PendingMessages;
use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Handle for communicating with the broker
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(tx: mpsc::UnboundedSender<BrokerCommand>) -> Self {
        Self { tx }
    }

    /// Send a command to the broker
    pub fn send_command(&self, cmd: BrokerCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .context("Failed to send command to broker")
    }

    /// Snapshot of the broker's routing tables
    pub async fn stats(&self) -> Result<BrokerStats> {
        let (reply, rx) = oneshot::channel();
        self.send_command(BrokerCommand::Stats { reply })?;
        rx.await.context("Broker stopped before answering")
    }
}

/// Commands that can be sent to the broker
#[derive(Debug)]
pub enum BrokerCommand {
    /// Client sent a frame
    ClientFrame { client_id: String, frame: ClientFrame },
    /// Client disconnected
    ClientDisconnected { client_id: String },
    /// Report routing statistics
    Stats { reply: oneshot::Sender<BrokerStats> },
    /// Shutdown the broker
    Shutdown,
}

/// Routing statistics, mostly useful to check that handles were released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    pub topic_subscriptions: usize,
    pub queue_consumers: usize,
    pub pending_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Subscriber {
    client_id: String,
    subscription_id: u64,
}

struct QueueState {
    consumers: VecDeque<Subscriber>,
    pending: PendingMessages,
}

/// Message broker that routes published frames to subscribers
pub struct MessageBroker {
    client_manager: Arc<ClientManager>,
    topics: HashMap<String, Vec<Subscriber>>,
    queues: HashMap<String, QueueState>,
    subscriptions: HashMap<Subscriber, Destination>,
    ttl: Duration,
    max_queue_size: usize,
    rx: mpsc::UnboundedReceiver<BrokerCommand>,
}

impl MessageBroker {
    /// Create a new message broker
    pub fn new(ttl: Duration, max_queue_size: usize) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let broker = Self {
            client_manager: Arc::new(ClientManager::new()),
            topics: HashMap::new(),
            queues: HashMap::new(),
            subscriptions: HashMap::new(),
            ttl,
            max_queue_size,
            rx,
        };

        (broker, BrokerHandle::new(tx))
    }

    /// Get the client manager
    pub fn client_manager(&self) -> Arc<ClientManager> {
        self.client_manager.clone()
    }

    /// Run the broker event loop
    pub async fn run(mut self) {
        tracing::info!("Relay broker started");

        let mut cleanup = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(BrokerCommand::ClientFrame { client_id, frame }) => {
                            self.handle_frame(&client_id, frame).await;
                        }
                        Some(BrokerCommand::ClientDisconnected { client_id }) => {
                            self.drop_client(&client_id);
                            self.client_manager.unregister(&client_id).await;
                        }
                        Some(BrokerCommand::Stats { reply }) => {
                            let _ = reply.send(self.stats());
                        }
                        Some(BrokerCommand::Shutdown) | None => {
                            tracing::info!("Broker shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup.tick() => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        tracing::debug!("Cleaned up {} expired messages", purged);
                    }
                }
            }
        }

        // Closing every writer ends the connection pumps and clients see EOF
        let dropped = self.client_manager.disconnect_all().await;
        tracing::info!("Relay broker stopped, {} clients disconnected", dropped);
    }

    /// Drop expired messages and forget queues left with no consumers or backlog
    fn purge_expired(&mut self) -> usize {
        let purged = self
            .queues
            .values_mut()
            .map(|q| q.pending.purge_expired())
            .sum();
        self.queues
            .retain(|_, q| !q.consumers.is_empty() || !q.pending.is_empty());
        purged
    }

    /// Handle a frame from a client
    async fn handle_frame(&mut self, client_id: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::Subscribe {
                subscription_id,
                destination,
            } => {
                self.subscribe(client_id, subscription_id, destination).await;
            }
            ClientFrame::Unsubscribe { subscription_id } => {
                self.unsubscribe(&Subscriber {
                    client_id: client_id.to_string(),
                    subscription_id,
                });
            }
            ClientFrame::Publish { destination, body } => {
                self.publish(client_id, destination, body).await;
            }
            ClientFrame::Ping => {
                if let Err(e) = self.client_manager.deliver(client_id, BrokerFrame::Pong).await {
                    tracing::debug!("Pong not delivered: {}", e);
                }
            }
        }
    }

    async fn subscribe(&mut self, client_id: &str, subscription_id: u64, destination: Destination) {
        let subscriber = Subscriber {
            client_id: client_id.to_string(),
            subscription_id,
        };

        if self.subscriptions.contains_key(&subscriber) {
            let _ = self
                .client_manager
                .deliver(
                    client_id,
                    BrokerFrame::Error {
                        message: format!("subscription {subscription_id} already exists"),
                    },
                )
                .await;
            return;
        }

        tracing::debug!("Client {} subscribed to {}", client_id, destination);
        self.subscriptions.insert(subscriber.clone(), destination.clone());

        match destination.kind {
            DestinationKind::Topic => {
                self.topics
                    .entry(destination.name)
                    .or_default()
                    .push(subscriber);
            }
            DestinationKind::Queue => {
                let (ttl, max) = (self.ttl, self.max_queue_size);
                let queue = self
                    .queues
                    .entry(destination.name.clone())
                    .or_insert_with(|| QueueState {
                        consumers: VecDeque::new(),
                        pending: PendingMessages::new(ttl, max),
                    });
                queue.consumers.push_back(subscriber);

                let backlog = queue.pending.drain();
                for message in backlog {
                    tracing::debug!("Delivering buffered message {} from {}", message.id, message.from);
                    self.route_to_queue(&destination.name, client_id, message.body).await;
                }
            }
        }
    }

    fn unsubscribe(&mut self, subscriber: &Subscriber) {
        let Some(destination) = self.subscriptions.remove(subscriber) else {
            return;
        };

        tracing::debug!(
            "Client {} unsubscribed from {}",
            subscriber.client_id,
            destination
        );

        match destination.kind {
            DestinationKind::Topic => {
                if let Some(subscribers) = self.topics.get_mut(&destination.name) {
                    subscribers.retain(|s| s != subscriber);
                    if subscribers.is_empty() {
                        self.topics.remove(&destination.name);
                    }
                }
            }
            DestinationKind::Queue => {
                if let Some(queue) = self.queues.get_mut(&destination.name) {
                    queue.consumers.retain(|s| s != subscriber);
                    if queue.consumers.is_empty() && queue.pending.is_empty() {
                        self.queues.remove(&destination.name);
                    }
                }
            }
        }
    }

    fn drop_client(&mut self, client_id: &str) {
        let owned: Vec<Subscriber> = self
            .subscriptions
            .keys()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect();

        for subscriber in owned {
            self.unsubscribe(&subscriber);
        }
    }

    async fn publish(&mut self, client_id: &str, destination: Destination, body: String) {
        match destination.kind {
            DestinationKind::Topic => {
                let subscribers = self.topics.get(&destination.name).cloned().unwrap_or_default();
                tracing::debug!(
                    "Fan-out on {} to {} subscribers",
                    destination,
                    subscribers.len()
                );

                for subscriber in subscribers {
                    let frame = BrokerFrame::Deliver {
                        subscription_id: subscriber.subscription_id,
                        body: body.clone(),
                    };
                    if let Err(e) = self.client_manager.deliver(&subscriber.client_id, frame).await {
                        tracing::warn!("Dropping topic subscriber {}: {}", subscriber.client_id, e);
                        self.unsubscribe(&subscriber);
                    }
                }
            }
            DestinationKind::Queue => {
                self.route_to_queue(&destination.name, client_id, body).await;
            }
        }
    }

    /// Deliver to one consumer of the queue (round-robin) or buffer the message
    async fn route_to_queue(&mut self, name: &str, from: &str, body: String) {
        let (ttl, max) = (self.ttl, self.max_queue_size);
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                consumers: VecDeque::new(),
                pending: PendingMessages::new(ttl, max),
            });

        let mut stale = Vec::new();
        let mut delivered = false;

        while let Some(consumer) = queue.consumers.pop_front() {
            let frame = BrokerFrame::Deliver {
                subscription_id: consumer.subscription_id,
                body: body.clone(),
            };
            match self.client_manager.deliver(&consumer.client_id, frame).await {
                Ok(()) => {
                    queue.consumers.push_back(consumer);
                    delivered = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Dropping queue consumer {}: {}", consumer.client_id, e);
                    stale.push(consumer);
                }
            }
        }

        if !delivered {
            let message = queue.pending.push(from.to_string(), body);
            tracing::debug!("Message {} buffered on queue://{}", message.id, name);
        }

        for subscriber in stale {
            self.subscriptions.remove(&subscriber);
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_subscriptions: self.topics.values().map(Vec::len).sum(),
            queue_consumers: self.queues.values().map(|q| q.consumers.len()).sum(),
            pending_messages: self.queues.values().map(|q| q.pending.len()).sum(),
        }
    }
}
