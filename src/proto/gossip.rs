//! The state gossip agent.
//!
//! Diffuses, per peer group, a map of `agent id -> state hash` for every
//! tracked local agent, and triggers full-state retrieval on mismatch. The
//! agent never interprets states; it moves literals around and hands them to
//! the tracked agent through [`OutEvent::DeliverState`], whose outcome comes
//! back as [`InEvent::DeliveryOutcome`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::hash::Hash;
use crate::literal::Literal;
use crate::proto::util::IndexSet;
use crate::proto::{AgentId, Endpoint};

/// Configuration for the gossip agent.
///
/// The expectation is that the configuration is the same for all peers in a
/// peer group.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on peer-group size, as reported by the membership layer.
    /// Together with `peer_gossip_fraction` it determines the gossip fanout.
    pub max_peers: usize,
    /// Fraction of `max_peers` a state update is gossiped to.
    pub peer_gossip_fraction: f32,
    /// Probability of forwarding a state that was received from another peer
    /// (re-gossip damping; locally originated updates always go out).
    pub peer_gossip_prob: f32,
    /// Lower bound on the gossip fanout, regardless of the fraction.
    pub min_gossip_peers: usize,
    /// How many superseded local state hashes to remember per agent, used to
    /// recognize stale states received from peers.
    pub max_cached_prev_states: usize,
    /// How often a failing state delivery to the tracked agent is retried.
    pub new_state_error_retries: usize,
    /// Pacing between delivery retries.
    pub new_state_error_delay: Duration,
    /// Upper bound on the random delay before re-gossiping a remotely
    /// received state.
    pub max_gossip_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 20,
            peer_gossip_fraction: 0.2,
            peer_gossip_prob: 0.5,
            min_gossip_peers: 4,
            max_cached_prev_states: 50,
            new_state_error_retries: 3,
            new_state_error_delay: Duration::from_millis(1500),
            max_gossip_delay: Duration::from_millis(5000),
        }
    }
}

/// Gossip wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// The sender's full `agent id -> state hash` map.
    SendFullState {
        /// One entry per tracked agent.
        entries: Vec<(AgentId, Hash)>,
    },
    /// A full state object for one agent.
    SendStateObject {
        /// The agent the state belongs to.
        agent: AgentId,
        /// The state literal.
        state: Literal,
        /// Sender-local update counter; informational.
        timestamp: u64,
    },
    /// Ask the peer for its full state map.
    RequestFullState,
    /// Ask the peer for one agent's state object.
    RequestStateObject {
        /// The agent whose state is requested.
        agent: AgentId,
    },
}

/// Gossip timers.
#[derive(Debug, Clone)]
pub enum Timer<PA> {
    /// Retry a failed state delivery to the tracked agent.
    RetryDeliver {
        /// Peer the state came from.
        from: PA,
        /// The agent the state belongs to.
        agent: AgentId,
    },
    /// Forward a remotely received state to a random peer subset.
    Regossip {
        /// The agent the state belongs to.
        agent: AgentId,
        /// The state hash to forward.
        hash: Hash,
    },
}

/// Outcome of handing a state object to the tracked agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The state taught the agent something new.
    New,
    /// The agent already knew everything in the state.
    Known,
    /// The agent failed to process the state.
    Failed,
}

/// Input event to the gossip state handler.
#[derive(Debug, Clone)]
pub enum InEvent<PA> {
    /// Message received from the network.
    RecvMessage(PA, Message),
    /// A tracked local agent published a new state.
    LocalState {
        /// The agent that updated.
        agent: AgentId,
        /// Its new state literal.
        state: Literal,
    },
    /// Start diffusing this agent's state.
    TrackAgent(AgentId),
    /// Stop diffusing this agent's state.
    UntrackAgent(AgentId),
    /// A peer joined the peer group.
    PeerJoined(PA),
    /// A peer left the peer group.
    PeerLost(PA),
    /// Result of a [`OutEvent::DeliverState`].
    DeliveryOutcome {
        /// Peer the state came from.
        from: PA,
        /// The agent the state was for.
        agent: AgentId,
        /// What the agent made of it.
        outcome: Delivery,
    },
    /// Trigger a previously scheduled timer.
    TimerExpired(Timer<PA>),
}

/// An output event from the gossip state handler.
#[derive(Debug)]
pub enum OutEvent<PA> {
    /// Send a message on the network.
    SendMessage(PA, Message),
    /// Schedule a timer.
    ScheduleTimer(Duration, Timer<PA>),
    /// Hand a received state object to the tracked agent. The embedder must
    /// answer with [`InEvent::DeliveryOutcome`].
    DeliverState {
        /// Peer the state came from.
        from: PA,
        /// The agent the state is for.
        agent: AgentId,
        /// The state literal.
        state: Literal,
    },
}

/// Message counters.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Full state maps sent to peers.
    pub full_states_sent: u64,
    /// State objects sent to peers.
    pub state_objects_sent: u64,
    /// State objects received from peers.
    pub state_objects_received: u64,
    /// Deliveries handed to the tracked agent.
    pub deliveries: u64,
    /// Delivery retries after agent errors.
    pub retries: u64,
    /// Own-state replies sent to heal a peer's stale view.
    pub stale_replies: u64,
}

struct PendingDelivery {
    state: Literal,
    attempt: usize,
}

/// The gossip agent state.
pub struct State<PA, R> {
    config: Config,
    rng: R,
    tracked: BTreeSet<AgentId>,
    local: BTreeMap<AgentId, Hash>,
    local_objects: BTreeMap<AgentId, Literal>,
    remote: HashMap<PA, BTreeMap<AgentId, Hash>>,
    remote_objects: HashMap<PA, BTreeMap<Hash, Literal>>,
    prev_states: BTreeMap<AgentId, VecDeque<Hash>>,
    peers: IndexSet<PA>,
    pending: HashMap<(PA, AgentId), PendingDelivery>,
    pending_regossip: HashMap<(AgentId, Hash), (PA, Literal)>,
    seq: u64,
    stats: Stats,
}

impl<PA: Endpoint, R: Rng> State<PA, R> {
    /// Initialize with a custom random number generator.
    pub fn with_rng(config: Config, rng: R) -> Self {
        Self {
            config,
            rng,
            tracked: Default::default(),
            local: Default::default(),
            local_objects: Default::default(),
            remote: Default::default(),
            remote_objects: Default::default(),
            prev_states: Default::default(),
            peers: Default::default(),
            pending: Default::default(),
            pending_regossip: Default::default(),
            seq: 0,
            stats: Default::default(),
        }
    }

    /// Message counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The last state hash a peer advertised for an agent.
    pub fn remote_state(&self, peer: &PA, agent: &AgentId) -> Option<&Hash> {
        self.remote.get(peer).and_then(|m| m.get(agent))
    }

    /// Handle an incoming event, pushing output events into `io`.
    pub fn handle(&mut self, event: InEvent<PA>, now: Instant, io: &mut VecDeque<OutEvent<PA>>) {
        let _ = now;
        match event {
            InEvent::PeerJoined(peer) => {
                if self.peers.insert(peer) {
                    trace!(?peer, "gossip: peer joined");
                    self.send_full_state(peer, io);
                    // the peer's own join event may not have fired yet
                    io.push_back(OutEvent::SendMessage(peer, Message::RequestFullState));
                }
            }
            InEvent::PeerLost(peer) => {
                self.peers.remove(&peer);
                self.remote.remove(&peer);
                self.remote_objects.remove(&peer);
                self.pending.retain(|(p, _), _| *p != peer);
            }
            InEvent::TrackAgent(agent) => {
                self.tracked.insert(agent);
            }
            InEvent::UntrackAgent(agent) => {
                self.tracked.remove(&agent);
                self.local.remove(&agent);
                self.local_objects.remove(&agent);
                self.prev_states.remove(&agent);
                self.pending.retain(|(_, a), _| *a != agent);
            }
            InEvent::LocalState { agent, state } => self.handle_local_state(agent, state, io),
            InEvent::RecvMessage(from, message) => self.handle_message(from, message, io),
            InEvent::DeliveryOutcome {
                from,
                agent,
                outcome,
            } => self.handle_delivery_outcome(from, agent, outcome, io),
            InEvent::TimerExpired(timer) => match timer {
                Timer::RetryDeliver { from, agent } => {
                    if let Some(pending) = self.pending.get(&(from, agent)) {
                        io.push_back(OutEvent::DeliverState {
                            from,
                            agent,
                            state: pending.state.clone(),
                        });
                        self.stats.deliveries += 1;
                    }
                }
                Timer::Regossip { agent, hash } => {
                    if let Some((exclude, state)) = self.pending_regossip.remove(&(agent, hash)) {
                        self.regossip_state(agent, state, exclude, io);
                    }
                }
            },
        }
    }

    fn handle_local_state(
        &mut self,
        agent: AgentId,
        state: Literal,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        if !self.tracked.contains(&agent) {
            return;
        }
        let hash = state.hash;
        if self.local.get(&agent) == Some(&hash) {
            return;
        }
        if let Some(old) = self.local.insert(agent, hash) {
            let cache = self.prev_states.entry(agent).or_default();
            cache.push_front(old);
            cache.truncate(self.config.max_cached_prev_states);
        }
        self.local_objects.insert(agent, state.clone());
        self.seq += 1;
        debug!(%agent, state = %hash.fmt_short(), "gossip: local state update");

        let fanout = self.fanout();
        let targets = self.peers.shuffled_and_capped(fanout, &mut self.rng);
        for peer in targets {
            io.push_back(OutEvent::SendMessage(
                peer,
                Message::SendStateObject {
                    agent,
                    state: state.clone(),
                    timestamp: self.seq,
                },
            ));
            self.stats.state_objects_sent += 1;
        }
    }

    fn handle_message(&mut self, from: PA, message: Message, io: &mut VecDeque<OutEvent<PA>>) {
        match message {
            Message::SendFullState { entries } => {
                for (agent, hash) in entries {
                    if !self.tracked.contains(&agent) {
                        continue;
                    }
                    if self.local.get(&agent) == Some(&hash) {
                        continue;
                    }
                    if self.is_prev_state(&agent, &hash) {
                        trace!(?from, %agent, "gossip: ignoring stale state hash");
                        continue;
                    }
                    self.remote.entry(from).or_default().insert(agent, hash);
                    // another peer may already have sent us this very state
                    if let Some(state) = self.find_cached_object(&hash) {
                        self.start_delivery(from, agent, state, io);
                    } else {
                        io.push_back(OutEvent::SendMessage(
                            from,
                            Message::RequestStateObject { agent },
                        ));
                    }
                }
            }
            Message::SendStateObject {
                agent,
                state,
                timestamp: _,
            } => {
                if let Err(err) = state.validate() {
                    warn!(?from, %agent, %err, "gossip: dropping state object");
                    return;
                }
                self.stats.state_objects_received += 1;
                let hash = state.hash;
                let known = self.local.get(&agent) == Some(&hash)
                    || self.remote.values().any(|m| m.get(&agent) == Some(&hash));
                self.remote.entry(from).or_default().insert(agent, hash);
                self.remote_objects
                    .entry(from)
                    .or_default()
                    .insert(hash, state.clone());
                if !self.tracked.contains(&agent) {
                    return;
                }
                if !known && !self.is_prev_state(&agent, &hash) {
                    self.schedule_regossip(from, agent, state.clone(), io);
                }
                if self.local.get(&agent) == Some(&hash) {
                    return;
                }
                self.start_delivery(from, agent, state, io);
            }
            Message::RequestFullState => {
                self.send_full_state(from, io);
            }
            Message::RequestStateObject { agent } => {
                if let Some(state) = self.local_objects.get(&agent) {
                    io.push_back(OutEvent::SendMessage(
                        from,
                        Message::SendStateObject {
                            agent,
                            state: state.clone(),
                            timestamp: self.seq,
                        },
                    ));
                    self.stats.state_objects_sent += 1;
                }
            }
        }
    }

    fn handle_delivery_outcome(
        &mut self,
        from: PA,
        agent: AgentId,
        outcome: Delivery,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        let Some(pending) = self.pending.remove(&(from, agent)) else {
            return;
        };
        match outcome {
            Delivery::New => {}
            Delivery::Known => {
                // the peer sent a state that taught us nothing; if our own
                // state differs the peer's view is stale, so heal it
                if self.local.get(&agent) != Some(&pending.state.hash) {
                    if let Some(state) = self.local_objects.get(&agent) {
                        debug!(?from, %agent, "gossip: replying with own state to heal stale peer");
                        io.push_back(OutEvent::SendMessage(
                            from,
                            Message::SendStateObject {
                                agent,
                                state: state.clone(),
                                timestamp: self.seq,
                            },
                        ));
                        self.stats.stale_replies += 1;
                        self.stats.state_objects_sent += 1;
                    }
                }
            }
            Delivery::Failed => {
                let attempt = pending.attempt + 1;
                if attempt > self.config.new_state_error_retries {
                    warn!(?from, %agent, "gossip: giving up on state delivery after {} retries",
                        self.config.new_state_error_retries);
                } else {
                    self.pending.insert(
                        (from, agent),
                        PendingDelivery {
                            state: pending.state,
                            attempt,
                        },
                    );
                    self.stats.retries += 1;
                    io.push_back(OutEvent::ScheduleTimer(
                        self.config.new_state_error_delay,
                        Timer::RetryDeliver { from, agent },
                    ));
                }
            }
        }
    }

    fn start_delivery(
        &mut self,
        from: PA,
        agent: AgentId,
        state: Literal,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        self.pending.insert(
            (from, agent),
            PendingDelivery {
                state: state.clone(),
                attempt: 0,
            },
        );
        self.stats.deliveries += 1;
        io.push_back(OutEvent::DeliverState { from, agent, state });
    }

    fn schedule_regossip(
        &mut self,
        from: PA,
        agent: AgentId,
        state: Literal,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        let hash = state.hash;
        if self
            .pending_regossip
            .insert((agent, hash), (from, state))
            .is_none()
        {
            let delay = self
                .config
                .max_gossip_delay
                .mul_f32(self.rng.gen_range(0.0..1.0));
            io.push_back(OutEvent::ScheduleTimer(delay, Timer::Regossip { agent, hash }));
        }
    }

    fn regossip_state(
        &mut self,
        agent: AgentId,
        state: Literal,
        exclude: PA,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        let fanout = self.fanout();
        let targets =
            self.peers
                .shuffled_without_and_capped(&[&exclude], fanout, &mut self.rng);
        for peer in targets {
            if self.rng.gen::<f32>() > self.config.peer_gossip_prob {
                continue;
            }
            io.push_back(OutEvent::SendMessage(
                peer,
                Message::SendStateObject {
                    agent,
                    state: state.clone(),
                    timestamp: self.seq,
                },
            ));
            self.stats.state_objects_sent += 1;
        }
    }

    fn send_full_state(&mut self, to: PA, io: &mut VecDeque<OutEvent<PA>>) {
        let entries: Vec<_> = self.local.iter().map(|(a, h)| (*a, *h)).collect();
        io.push_back(OutEvent::SendMessage(to, Message::SendFullState { entries }));
        self.stats.full_states_sent += 1;
    }

    fn is_prev_state(&self, agent: &AgentId, hash: &Hash) -> bool {
        self.prev_states
            .get(agent)
            .map_or(false, |cache| cache.contains(hash))
    }

    fn find_cached_object(&self, hash: &Hash) -> Option<Literal> {
        self.remote_objects
            .values()
            .find_map(|m| m.get(hash))
            .cloned()
    }

    /// The number of peers a state update is sent to, before clamping by the
    /// actual peer count.
    fn fanout(&self) -> usize {
        let by_fraction =
            (self.config.max_peers as f32 * self.config.peer_gossip_fraction).ceil() as usize;
        by_fraction.max(self.config.min_gossip_peers)
    }
}
