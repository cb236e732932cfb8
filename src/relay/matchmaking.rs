//! Relay selection policies.
//!
//! Every policy is a pure function of [`MatchmakingParameters`] and the public
//! relays returned by a [`PublicRelayRegistry`]. Random picks are seeded with
//! `random_seed`, so the same parameters always yield the same relay.
//!
//! The dedicated kind is `GATEKEEPER_RELAY` for [`RelayRole::Gatekeeper`] and
//! `GATEWAY_RELAY` for [`RelayRole::Gateway`]; `GENERAL_RELAY` relays serve
//! both roles.

use crate::relay::types::{MatchmakingParameters, Relay, RelayDescriptor, RelayRole, RelayType};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lookup of the relays any cloud may use.
pub trait PublicRelayRegistry {
    fn public_relays_by_type(&self, relay_type: RelayType) -> Vec<Relay>;
}

impl PublicRelayRegistry for [Relay] {
    fn public_relays_by_type(&self, relay_type: RelayType) -> Vec<Relay> {
        self.iter()
            .filter(|relay| !relay.is_exclusive() && relay.relay_type() == relay_type)
            .cloned()
            .collect()
    }
}

impl PublicRelayRegistry for Vec<Relay> {
    fn public_relays_by_type(&self, relay_type: RelayType) -> Vec<Relay> {
        self.as_slice().public_relays_by_type(relay_type)
    }
}

/// Named selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelaySelectionStrategy {
    /// First dedicated relay, then first public relay of the kind, then first public general relay
    FirstAvailable,
    /// Seeded pick among dedicated relays, then general ones, then public ones
    RandomExclusivePreferred,
    /// Seeded pick among the cloud's preferred relays, then known public relays
    CommonPreferredFirst,
    /// Seeded pick among the cloud's gatekeeper relays only
    GatekeeperOnly,
}

impl RelaySelectionStrategy {
    pub const ALL: [RelaySelectionStrategy; 4] = [
        RelaySelectionStrategy::FirstAvailable,
        RelaySelectionStrategy::RandomExclusivePreferred,
        RelaySelectionStrategy::CommonPreferredFirst,
        RelaySelectionStrategy::GatekeeperOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelaySelectionStrategy::FirstAvailable => "first-available",
            RelaySelectionStrategy::RandomExclusivePreferred => "random-exclusive-preferred",
            RelaySelectionStrategy::CommonPreferredFirst => "common-preferred-first",
            RelaySelectionStrategy::GatekeeperOnly => "gatekeeper-only",
        }
    }
}

impl fmt::Display for RelaySelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelaySelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("unknown selection strategy: {s}"))
    }
}

/// Choose a relay with `strategy`, or `None` when no candidate exists.
pub fn select_relay<R>(
    strategy: RelaySelectionStrategy,
    params: &MatchmakingParameters,
    registry: &R,
) -> Option<Relay>
where
    R: PublicRelayRegistry + ?Sized,
{
    let selected = match strategy {
        RelaySelectionStrategy::FirstAvailable => first_available(params, registry),
        RelaySelectionStrategy::RandomExclusivePreferred => random_exclusive_preferred(params, registry),
        RelaySelectionStrategy::CommonPreferredFirst => common_preferred_first(params, registry),
        RelaySelectionStrategy::GatekeeperOnly => gatekeeper_only(params),
    };

    match &selected {
        Some(relay) => tracing::debug!("{} selected relay {}", strategy, relay),
        None => tracing::debug!("{} found no relay for cloud {}", strategy, params.cloud.name),
    }
    selected
}

fn first_available<R>(params: &MatchmakingParameters, registry: &R) -> Option<Relay>
where
    R: PublicRelayRegistry + ?Sized,
{
    let kind = params.role.relay_type();

    params
        .role
        .cloud_relays(&params.cloud)
        .iter()
        .find(|relay| relay.relay_type() == kind)
        .cloned()
        .or_else(|| registry.public_relays_by_type(kind).into_iter().next())
        .or_else(|| {
            registry
                .public_relays_by_type(RelayType::GeneralRelay)
                .into_iter()
                .next()
        })
}

fn random_exclusive_preferred<R>(params: &MatchmakingParameters, registry: &R) -> Option<Relay>
where
    R: PublicRelayRegistry + ?Sized,
{
    let mut rng = seeded(params.random_seed);

    if let Some(relay) = pick_partitioned(params.role, params.role.cloud_relays(&params.cloud), &mut rng) {
        return Some(relay);
    }

    let public = registry.public_relays_by_type(params.role.relay_type());
    if let Some(relay) = public.choose(&mut rng) {
        return Some(relay.clone());
    }

    registry
        .public_relays_by_type(RelayType::GeneralRelay)
        .choose(&mut rng)
        .cloned()
}

fn common_preferred_first<R>(params: &MatchmakingParameters, registry: &R) -> Option<Relay>
where
    R: PublicRelayRegistry + ?Sized,
{
    let mut rng = seeded(params.random_seed);

    let preferred: Vec<Relay> = params
        .role
        .cloud_relays(&params.cloud)
        .iter()
        .filter(|relay| is_listed(&params.preferred_relays, relay))
        .cloned()
        .collect();
    if let Some(relay) = preferred.choose(&mut rng) {
        return Some(relay.clone());
    }

    let mut known = registry.public_relays_by_type(params.role.relay_type());
    known.extend(registry.public_relays_by_type(RelayType::GeneralRelay));
    known.retain(|relay| is_listed(&params.known_relays, relay));

    pick_partitioned(params.role, &known, &mut rng)
}

fn gatekeeper_only(params: &MatchmakingParameters) -> Option<Relay> {
    let mut rng = seeded(params.random_seed);
    pick_partitioned(RelayRole::Gatekeeper, &params.cloud.gatekeeper_relays, &mut rng)
}

/// Seeded pick among relays of the dedicated kind, then among general relays
fn pick_partitioned(role: RelayRole, relays: &[Relay], rng: &mut StdRng) -> Option<Relay> {
    let kind = role.relay_type();
    let (dedicated, general): (Vec<&Relay>, Vec<&Relay>) = relays
        .iter()
        .filter(|relay| relay.relay_type() == kind || relay.relay_type() == RelayType::GeneralRelay)
        .partition(|relay| relay.relay_type() == kind);

    dedicated
        .choose(rng)
        .or_else(|| general.choose(rng))
        .map(|relay| (*relay).clone())
}

fn is_listed(descriptors: &[RelayDescriptor], relay: &Relay) -> bool {
    descriptors.iter().any(|descriptor| descriptor.matches(relay))
}

fn seeded(seed: i64) -> StdRng {
    StdRng::seed_from_u64(seed as u64)
}
