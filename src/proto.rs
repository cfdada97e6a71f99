//! Protocol implementation, as state machines without IO.
//!
//! Everything here is pure state: inputs arrive as [`InEvent`], outputs drain
//! as [`OutEvent`], and timers are requested through
//! [`OutEvent::ScheduleTimer`] and come back as [`InEvent::TimerExpired`].
//! The embedding layer (the simulated network in tests, or the tokio actor in
//! [`crate::net`]) owns all IO. Run-to-completion between events stands in
//! for the single-threaded cooperative scheduling the protocol assumes.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash as StdHash;
use std::time::Duration;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::hash::Hash;
use crate::store::StoreEvent;

pub mod gossip;
pub mod pod;
pub mod sync;
pub mod util;

#[cfg(test)]
mod tests;

/// A peer's identifier or address.
///
/// The protocol implementation is generic over this trait. When embedding the
/// protocol, a concrete type must be chosen that will then be used throughout
/// the implementation to identify and index individual peers.
pub trait Endpoint: StdHash + Eq + Copy + fmt::Debug + Serialize + DeserializeOwned {}
impl<T> Endpoint for T where T: StdHash + Eq + Copy + fmt::Debug + Serialize + DeserializeOwned {}

/// Identifier of an agent within a pod and across the gossip layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash, Serialize, Deserialize)]
pub struct AgentId([u8; 32]);

impl AgentId {
    /// Create from a byte array.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The id of the terminal-ops sync agent for a mutable object.
    pub fn terminal_ops_agent(obj: &Hash) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"terminal-ops-agent");
        hasher.update(obj.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{}", text)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        write!(f, "AgentId({}…)", text)
    }
}

/// A wire message between two pods.
#[derive(Debug, Clone, Serialize, Deserialize, derive_more::From)]
pub enum Message {
    /// State gossip traffic.
    Gossip(gossip::Message),
    /// Terminal-ops sync traffic.
    Sync(sync::Message),
}

impl Message {
    /// Encode for the transport.
    pub fn encode(&self) -> anyhow::Result<Bytes> {
        Ok(postcard::to_stdvec(self)?.into())
    }

    /// Decode from the transport.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// A command from the application.
#[derive(Debug, Clone)]
pub enum Command {
    /// Start syncing a mutable object in this peer group.
    TrackObject {
        /// The object identity.
        obj: Hash,
        /// Mutation op classes the object accepts.
        accepted_classes: BTreeSet<String>,
    },
}

/// Input event to the pod state handler.
#[derive(Debug, Clone)]
pub enum InEvent<PA> {
    /// Message received from the network.
    RecvMessage(PA, Message),
    /// Notification from the local store.
    StoreEvent(StoreEvent),
    /// Execute a command from the application.
    Command(Command),
    /// Trigger a previously scheduled timer.
    TimerExpired(Timer<PA>),
    /// A peer joined the peer group.
    PeerJoined(PA),
    /// A peer left the peer group.
    PeerLost(PA),
}

/// An output event from the pod state handler.
#[derive(Debug)]
pub enum OutEvent<PA> {
    /// Send a message on the network.
    SendMessage(PA, Message),
    /// Schedule a timer. The runtime is responsible for sending an
    /// [`InEvent::TimerExpired`] after the duration.
    ScheduleTimer(Duration, Timer<PA>),
    /// Emit an event to the application.
    EmitEvent(Event),
}

/// A timer to be delivered back to the pod.
#[derive(Debug, Clone)]
pub enum Timer<PA> {
    /// Gossip agent timer.
    Gossip(gossip::Timer<PA>),
    /// Sync agent timer, scoped to its mutable object.
    Sync(Hash, sync::Timer),
}

/// An event emitted to the application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    /// The local terminal-ops state of an object changed.
    StateUpdated {
        /// The mutable object.
        target: Hash,
        /// The new state hash.
        state_hash: Hash,
    },
    /// Remote ops were validated and persisted locally.
    OpsSynced {
        /// The mutable object.
        target: Hash,
        /// The persisted op hashes.
        ops: Vec<Hash>,
    },
}
