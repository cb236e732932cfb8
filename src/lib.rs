//! gatekeeper-relay - Inter-cloud gatekeeper communication through a shared relay broker
//!
//! This library lets two local clouds that cannot reach each other exchange
//! authenticated, confidential request/response messages through a message
//! broker neither of them controls, and choose which relay to use.

pub mod relay;

pub use relay::{
    select_relay, BrokerConfig, BrokerInstance, GatekeeperRelayClient, RelayConnector, RelayError,
    RelayKeyPair, RelayResult, RelaySessionDirectory,
};
