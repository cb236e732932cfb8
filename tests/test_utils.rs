//! Test utilities and fixtures for gatekeeper-relay
//!
//! Shared by the integration tests: an in-process broker on an ephemeral port
//! and pairs of clouds with fresh keys.

#![allow(dead_code)]

use gatekeeper_relay::relay::{
    BrokerConfig, BrokerInstance, GatekeeperRelayClient, RelayConnector, RelayKeyPair, RelaySession,
};
use std::sync::Arc;
use std::time::Duration;

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(300);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a plain TCP broker on 127.0.0.1
pub async fn start_broker() -> BrokerInstance {
    BrokerInstance::start(BrokerConfig::local())
        .await
        .expect("Failed to start broker")
}

/// A cloud with its own key pair and protocol client
pub struct TestCloud {
    pub keys: Arc<RelayKeyPair>,
    pub client: GatekeeperRelayClient,
}

impl TestCloud {
    pub fn new(name: &str, timeout: Duration) -> Self {
        let keys = Arc::new(RelayKeyPair::generate());
        let client = GatekeeperRelayClient::new(name, keys.clone(), timeout)
            .expect("Failed to create relay client");
        Self { keys, client }
    }
}

pub fn connector() -> RelayConnector {
    RelayConnector::new(LONG_TIMEOUT)
}

/// Open a fresh session to the broker
pub async fn connect(broker: &BrokerInstance) -> Arc<RelaySession> {
    connector()
        .connect("127.0.0.1", broker.local_addr().port(), false)
        .await
        .expect("Failed to connect to broker")
}
