// Gatekeeper relay module
//
// Two local clouds that cannot open connections to each other exchange
// signed, encrypted, session-scoped requests through a shared message broker
// neither of them controls. This module provides the protocol client, the
// message envelope, session caching, relay selection and a small broker.

pub mod error;
pub mod crypto;
pub mod message;
pub mod frame;
pub mod queue;
pub mod config;
pub mod tls;
pub mod types;
pub mod matchmaking;
pub mod client;
pub mod broker;
pub mod server;
pub mod transport;
pub mod session;
pub mod protocol;
pub mod cli;
pub mod commands;

pub use error::{RelayError, RelayResult, RemoteErrorKind};
pub use crypto::{DecodedMessage, MessageCryptographer, RelayKeyPair};
pub use message::{MessageType, RequestPayload, ResponsePayload, GENERAL_ADVERTISEMENT_TOPIC};
pub use config::{BrokerConfig, RelayClientConfig, TlsConfig, TlsServerConfig};
pub use types::{Cloud, MatchmakingParameters, Relay, RelayDescriptor, RelayRole, RelayType};
pub use matchmaking::{select_relay, PublicRelayRegistry, RelaySelectionStrategy};
pub use broker::{BrokerHandle, BrokerStats, MessageBroker};
pub use server::BrokerInstance;
pub use transport::{MessageConsumer, MessageProducer, RelayConnector, RelaySession};
pub use session::RelaySessionDirectory;
pub use protocol::{
    AdvertisementListener, GatekeeperRelayClient, GatekeeperRelayRequest, GatekeeperRelayResponse,
    GeneralAdvertisementResult,
};
pub use cli::{RelayCli, RelayCommand};
pub use commands::execute_command;
