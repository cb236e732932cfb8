// Relay and cloud records consumed by matchmaking and the connector

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a relay plays for the clouds using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayType {
    GatekeeperRelay,
    GatewayRelay,
    GeneralRelay,
}

impl fmt::Display for RelayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayType::GatekeeperRelay => "GATEKEEPER_RELAY",
            RelayType::GatewayRelay => "GATEWAY_RELAY",
            RelayType::GeneralRelay => "GENERAL_RELAY",
        };
        f.write_str(name)
    }
}

/// A broker endpoint known to the cloud registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relay {
    address: String,
    port: u16,
    #[serde(rename = "type")]
    relay_type: RelayType,
    #[serde(default)]
    exclusive: bool,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    authentication_info: Option<String>,
}

impl Relay {
    pub fn new(address: impl Into<String>, port: u16, relay_type: RelayType) -> Self {
        Self {
            address: address.into(),
            port,
            relay_type,
            exclusive: false,
            secure: false,
            authentication_info: None,
        }
    }

    /// Mark the relay as dedicated to a single cloud
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Require TLS when connecting
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn with_authentication_info(mut self, info: impl Into<String>) -> Self {
        self.authentication_info = Some(info.into());
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn relay_type(&self) -> RelayType {
        self.relay_type
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn authentication_info(&self) -> Option<&str> {
        self.authentication_info.as_deref()
    }

    /// Whether both records denote the same relay
    pub fn same_relay(&self, other: &Relay) -> bool {
        match (self.authentication_info(), other.authentication_info()) {
            (Some(a), Some(b)) => a == b,
            _ => self.address.eq_ignore_ascii_case(&other.address) && self.port == other.port,
        }
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.address, self.port, self.relay_type)
    }
}

/// A candidate relay supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayDescriptor {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub authentication_info: Option<String>,
}

impl RelayDescriptor {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            authentication_info: None,
        }
    }

    pub fn with_authentication_info(mut self, info: impl Into<String>) -> Self {
        self.authentication_info = Some(info.into());
        self
    }

    /// Authentication info decides when both sides carry it, address and port otherwise
    pub fn matches(&self, relay: &Relay) -> bool {
        match (self.authentication_info.as_deref(), relay.authentication_info()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => self.address.eq_ignore_ascii_case(relay.address()) && self.port == relay.port(),
        }
    }
}

impl From<&Relay> for RelayDescriptor {
    fn from(relay: &Relay) -> Self {
        Self {
            address: relay.address().to_string(),
            port: relay.port(),
            authentication_info: relay.authentication_info.clone(),
        }
    }
}

/// A local cloud and the relays associated with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cloud {
    pub operator: String,
    pub name: String,
    #[serde(default)]
    pub gatekeeper_relays: Vec<Relay>,
    #[serde(default)]
    pub gateway_relays: Vec<Relay>,
}

impl Cloud {
    pub fn new(operator: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_gatekeeper_relay(mut self, relay: Relay) -> Self {
        self.gatekeeper_relays.push(relay);
        self
    }

    pub fn with_gateway_relay(mut self, relay: Relay) -> Self {
        self.gateway_relays.push(relay);
        self
    }
}

/// Which of the cloud's relay sets a selection works on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    #[default]
    Gatekeeper,
    Gateway,
}

impl RelayRole {
    /// Dedicated relay kind for this role
    pub fn relay_type(&self) -> RelayType {
        match self {
            RelayRole::Gatekeeper => RelayType::GatekeeperRelay,
            RelayRole::Gateway => RelayType::GatewayRelay,
        }
    }

    pub fn cloud_relays<'a>(&self, cloud: &'a Cloud) -> &'a [Relay] {
        match self {
            RelayRole::Gatekeeper => &cloud.gatekeeper_relays,
            RelayRole::Gateway => &cloud.gateway_relays,
        }
    }
}

/// Input of every selection strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingParameters {
    pub cloud: Cloud,
    #[serde(default)]
    pub preferred_relays: Vec<RelayDescriptor>,
    #[serde(default)]
    pub known_relays: Vec<RelayDescriptor>,
    pub random_seed: i64,
    #[serde(default)]
    pub role: RelayRole,
}

impl MatchmakingParameters {
    pub fn new(cloud: Cloud, random_seed: i64) -> Self {
        Self {
            cloud,
            preferred_relays: Vec::new(),
            known_relays: Vec::new(),
            random_seed,
            role: RelayRole::Gatekeeper,
        }
    }

    pub fn with_preferred_relays(mut self, relays: Vec<RelayDescriptor>) -> Self {
        self.preferred_relays = relays;
        self
    }

    pub fn with_known_relays(mut self, relays: Vec<RelayDescriptor>) -> Self {
        self.known_relays = relays;
        self
    }

    pub fn with_role(mut self, role: RelayRole) -> Self {
        self.role = role;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_identity() {
        let a = Relay::new("relay.example.com", 61616, RelayType::GeneralRelay);
        let b = Relay::new("RELAY.example.com", 61616, RelayType::GatekeeperRelay).exclusive();
        assert!(a.same_relay(&b));

        let c = a.clone().with_authentication_info("cert-a");
        let d = Relay::new("10.0.0.1", 1234, RelayType::GeneralRelay).with_authentication_info("cert-a");
        assert!(c.same_relay(&d));
        assert!(!c.same_relay(&b.with_authentication_info("cert-b")));
    }

    #[test]
    fn test_descriptor_precedence() {
        let relay = Relay::new("10.0.0.1", 61616, RelayType::GeneralRelay).with_authentication_info("x");

        assert!(RelayDescriptor::new("10.0.0.1", 61616).matches(&relay));
        assert!(!RelayDescriptor::new("10.0.0.1", 61616)
            .with_authentication_info("y")
            .matches(&relay));
        assert!(RelayDescriptor::new("elsewhere", 1)
            .with_authentication_info("x")
            .matches(&relay));
    }

    #[test]
    fn test_relay_wire_format() {
        let relay = Relay::new("10.0.0.1", 61616, RelayType::GatekeeperRelay).secure();
        let json = serde_json::to_string(&relay).unwrap();
        assert!(json.contains("\"type\":\"GATEKEEPER_RELAY\""));

        let parsed: Relay = serde_json::from_str(r#"{"address":"h","port":1,"type":"GENERAL_RELAY"}"#).unwrap();
        assert!(!parsed.is_exclusive());
        assert!(parsed.authentication_info().is_none());
    }
}
