// Wire frames exchanged between relay clients and the broker

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of broker destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Fan-out to every current subscriber, nothing is buffered.
    Topic,
    /// Point-to-point, buffered until a consumer attaches.
    Queue,
}

/// A named topic or queue on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Topic => write!(f, "topic://{}", self.name),
            DestinationKind::Queue => write!(f, "queue://{}", self.name),
        }
    }
}

/// Frames sent by a client to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        destination: Destination,
    },
    Unsubscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
    },
    Publish {
        destination: Destination,
        body: String,
    },
    Ping,
}

/// Frames sent by the broker to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    Deliver {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        body: String,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Longest frame line either side accepts, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Serialize a frame as one newline-terminated JSON line.
pub fn to_line<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one JSON line (without its newline).
pub fn from_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}
