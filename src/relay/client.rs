// Connected relay clients, as seen by the broker

use crate::relay::frame::{self, BrokerFrame, ClientFrame, MAX_FRAME_LEN};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, LinesCodec};
use uuid::Uuid;

/// One accepted connection and the channel its frames are written from
pub struct ClientConnection {
    pub id: String,
    pub peer: String,
    pub secure: bool,
    connected_at: Instant,
    tx: mpsc::UnboundedSender<BrokerFrame>,
}

impl ClientConnection {
    pub fn new(peer: impl Into<String>, secure: bool, tx: mpsc::UnboundedSender<BrokerFrame>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.into(),
            secure,
            connected_at: Instant::now(),
            tx,
        }
    }

    /// Queue a frame for the connection's writer
    pub fn deliver(&self, frame: BrokerFrame) -> Result<()> {
        self.tx
            .send(frame)
            .with_context(|| format!("Client {} is no longer writable", self.id))
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Registry of live connections, keyed by client id
#[derive(Default)]
pub struct ClientManager {
    clients: RwLock<HashMap<String, ClientConnection>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client: ClientConnection) -> String {
        let id = client.id.clone();
        tracing::info!(
            "Relay client {} connected from {} ({})",
            id,
            client.peer,
            if client.secure { "tls" } else { "tcp" }
        );
        self.clients.write().await.insert(id.clone(), client);
        id
    }

    /// Forget a client; its writer stops once the last frame is flushed
    pub async fn unregister(&self, id: &str) {
        if let Some(client) = self.clients.write().await.remove(id) {
            tracing::info!(
                "Relay client {} disconnected after {:.1}s",
                id,
                client.connected_for().as_secs_f64()
            );
        }
    }

    /// Drop every connection, returning how many were open
    pub async fn disconnect_all(&self) -> usize {
        let mut clients = self.clients.write().await;
        let count = clients.len();
        for (id, client) in clients.drain() {
            tracing::debug!("Closing relay client {} from {}", id, client.peer);
        }
        count
    }

    pub async fn deliver(&self, id: &str, frame: BrokerFrame) -> Result<()> {
        match self.clients.read().await.get(id) {
            Some(client) => client.deliver(frame),
            None => anyhow::bail!("Unknown relay client: {}", id),
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

/// Move frames between a client stream and the broker until either side stops.
///
/// Lines read from the stream go to `incoming_tx`; frames from `outgoing_rx`
/// are written back as JSON lines. Returns when the peer hangs up, the broker
/// stops reading, or the connection is unregistered. A line longer than
/// [`MAX_FRAME_LEN`] ends the pump with an error.
pub async fn pump_client_stream<S>(
    stream: S,
    mut outgoing_rx: mpsc::UnboundedReceiver<BrokerFrame>,
    incoming_tx: mpsc::UnboundedSender<ClientFrame>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else {
                    break;
                };
                let line = line.context("Failed to read from client")?;
                if line.trim().is_empty() {
                    continue;
                }
                match frame::from_line::<ClientFrame>(&line) {
                    Ok(frame) => {
                        if incoming_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping unparseable client frame: {}", e),
                }
            }
            outgoing = outgoing_rx.recv() => {
                let Some(frame) = outgoing else {
                    break;
                };
                let bytes = frame::to_line(&frame).context("Failed to serialize frame")?;
                write_half
                    .write_all(&bytes)
                    .await
                    .context("Failed to write to client")?;
            }
        }
    }

    let _ = write_half.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_client_registry() {
        let manager = ClientManager::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager
            .register(ClientConnection::new("127.0.0.1:5000", false, tx))
            .await;
        assert_eq!(manager.len().await, 1);

        manager.deliver(&id, BrokerFrame::Pong).await.unwrap();
        assert_eq!(rx.recv().await, Some(BrokerFrame::Pong));

        manager.unregister(&id).await;
        assert!(manager.is_empty().await);
        assert!(manager.deliver(&id, BrokerFrame::Pong).await.is_err());

        // The writer side sees the channel close
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stream_pump() {
        let (client_side, broker_side) = tokio::io::duplex(4096);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump_client_stream(broker_side, outgoing_rx, incoming_tx));

        let (read_half, mut write_half) = tokio::io::split(client_side);
        write_half.write_all(b"\nnot a frame\n").await.unwrap();
        write_half
            .write_all(&frame::to_line(&ClientFrame::Ping).unwrap())
            .await
            .unwrap();
        assert_eq!(incoming_rx.recv().await, Some(ClientFrame::Ping));

        outgoing_tx.send(BrokerFrame::Pong).unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(frame::from_line::<BrokerFrame>(&line).unwrap(), BrokerFrame::Pong);

        // Unregistering drops the sender and ends the pump
        drop(outgoing_tx);
        pump.await.unwrap().unwrap();
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_line_ends_pump() {
        let (client_side, broker_side) = tokio::io::duplex(4096);
        let (_outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump_client_stream(broker_side, outgoing_rx, incoming_tx));

        let (_read_half, mut write_half) = tokio::io::split(client_side);
        tokio::spawn(async move {
            let flood = vec![b'a'; MAX_FRAME_LEN + 1];
            let _ = write_half.write_all(&flood).await;
        });

        assert!(pump.await.unwrap().is_err());
        assert_eq!(incoming_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let manager = ClientManager::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        manager.register(ClientConnection::new("a", false, tx_a)).await;
        manager.register(ClientConnection::new("b", true, tx_b)).await;

        assert_eq!(manager.disconnect_all().await, 2);
        assert!(manager.is_empty().await);
        assert_eq!(rx_a.recv().await, None);
        assert_eq!(rx_b.recv().await, None);
    }
}
