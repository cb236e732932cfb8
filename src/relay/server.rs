// Relay broker instance: TCP/TLS listener in front of the routing loop

use crate::relay::broker::{BrokerCommand, BrokerHandle, BrokerStats, MessageBroker};
use crate::relay::client::{pump_client_stream, ClientConnection, ClientManager};
use crate::relay::config::BrokerConfig;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::tls;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// A running relay broker
pub struct BrokerInstance {
    local_addr: SocketAddr,
    secure: bool,
    broker_handle: BrokerHandle,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl BrokerInstance {
    /// Bind the listener and start routing
    pub async fn start(config: BrokerConfig) -> RelayResult<Self> {
        config.validate()?;

        let acceptor = match &config.tls {
            Some(tls_config) => Some(TlsAcceptor::from(tls::server_config(tls_config)?)),
            None => None,
        };

        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| RelayError::connection(&config.bind_address, e))?;
        let local_addr = listener.local_addr()?;

        let (broker, handle) = MessageBroker::new(config.message_ttl(), config.max_queue_size);

        // Get client manager before moving broker
        let client_manager = broker.client_manager();

        tokio::spawn(async move {
            broker.run().await;
        });

        let secure = acceptor.is_some();
        tracing::info!(
            "Relay broker listening on {} ({})",
            local_addr,
            if secure { "tls" } else { "tcp" }
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        let broker_tx = handle.clone();
        tokio::spawn(async move {
            Self::run_listener(listener, acceptor, broker_tx, client_manager, &mut shutdown_rx).await;
        });

        Ok(Self {
            local_addr,
            secure,
            broker_handle: handle,
            shutdown_tx,
        })
    }

    async fn run_listener(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        broker_handle: BrokerHandle,
        client_manager: Arc<ClientManager>,
        shutdown_rx: &mut mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let acceptor = acceptor.clone();
                            let broker_handle = broker_handle.clone();
                            let client_manager = client_manager.clone();

                            tokio::spawn(async move {
                                let _ = stream.set_nodelay(true);
                                match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            Self::handle_connection(tls_stream, peer, true, broker_handle, client_manager).await;
                                        }
                                        Err(e) => tracing::warn!("TLS handshake with {} failed: {}", peer, e),
                                    },
                                    None => {
                                        Self::handle_connection(stream, peer, false, broker_handle, client_manager).await;
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Listener shutting down");
                    client_manager.disconnect_all().await;
                    break;
                }
            }
        }
    }

    /// Handle a new client connection
    async fn handle_connection<S>(
        stream: S,
        peer: SocketAddr,
        secure: bool,
        broker_handle: BrokerHandle,
        client_manager: Arc<ClientManager>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();

        let client = ClientConnection::new(peer.to_string(), secure, outgoing_tx);
        let client_id = client_manager.register(client).await;

        // Forward incoming frames to the broker
        let broker_handle_clone = broker_handle.clone();
        let client_id_clone = client_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(frame) = incoming_rx.recv().await {
                if broker_handle_clone
                    .send_command(BrokerCommand::ClientFrame {
                        client_id: client_id_clone.clone(),
                        frame,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        if let Err(e) = pump_client_stream(stream, outgoing_rx, incoming_tx).await {
            tracing::debug!("Client {} stream ended: {:#}", peer, e);
        }

        // Let queued frames reach the broker before the disconnect
        let _ = forward.await;

        let _ = broker_handle.send_command(BrokerCommand::ClientDisconnected { client_id });
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn handle(&self) -> BrokerHandle {
        self.broker_handle.clone()
    }

    pub async fn stats(&self) -> Result<BrokerStats> {
        self.broker_handle.stats().await
    }

    /// Shutdown the broker
    pub fn shutdown(&self) -> Result<()> {
        self.broker_handle
            .send_command(BrokerCommand::Shutdown)
            .context("Failed to send shutdown command")?;

        self.shutdown_tx
            .send(())
            .context("Failed to send listener shutdown")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::frame::{self, BrokerFrame, ClientFrame};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_broker_ping() {
        let broker = BrokerInstance::start(BrokerConfig::local()).await.unwrap();
        assert!(!broker.is_secure());

        let stream = TcpStream::connect(broker.local_addr()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(&frame::to_line(&ClientFrame::Ping).unwrap())
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(frame::from_line::<BrokerFrame>(&line).unwrap(), BrokerFrame::Pong);

        broker.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_client_connections() {
        let broker = BrokerInstance::start(BrokerConfig::local()).await.unwrap();

        let stream = TcpStream::connect(broker.local_addr()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(&frame::to_line(&ClientFrame::Ping).unwrap())
            .await
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        assert!(lines.next_line().await.unwrap().is_some());

        broker.shutdown().unwrap();

        let eof = tokio::time::timeout(std::time::Duration::from_secs(5), lines.next_line())
            .await
            .expect("connection should close on shutdown");
        assert_eq!(eof.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let config = BrokerConfig {
            bind_address: "not-an-address".to_string(),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            BrokerInstance::start(config).await,
            Err(RelayError::Config(_))
        ));
    }
}
