//! The agent pod: one gossip agent plus one sync agent per tracked object,
//! multiplexed behind a single event handler.
//!
//! The pod is the in-process bus of a node. It routes wire messages to the
//! right agent, delivers pod events between agents synchronously in
//! scheduling order (a sync agent's state update reaches the gossip agent
//! before the next external event is processed), and forwards store
//! notifications. Sync messages whose target has no agent are logged and
//! ignored.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use rand::Rng;
use tracing::{debug, warn};

use crate::hash::Hash;
use crate::literal::Literal;
use crate::proto::{
    gossip, sync, AgentId, Command, Endpoint, Event, InEvent, Message, OutEvent, Timer,
};
use crate::store::{Store, StoreEvent};

/// Pod configuration: one section per agent kind.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Gossip agent configuration.
    pub gossip: gossip::Config,
    /// Sync agent configuration, shared by every tracked object.
    pub sync: sync::Config,
}

enum Work<PA> {
    Gossip(gossip::InEvent<PA>),
    Sync(Hash, sync::InEvent<PA>),
    Deliver {
        from: PA,
        agent: AgentId,
        state: Literal,
    },
}

/// The pod state: the node-local agent set and its shared outbox.
pub struct Pod<S, PA, R> {
    store: S,
    config: Config,
    rng: R,
    gossip: gossip::State<PA, R>,
    syncs: HashMap<Hash, sync::State<S, PA, R>>,
    agents: HashMap<AgentId, Hash>,
    peers: Vec<PA>,
    outbox: VecDeque<OutEvent<PA>>,
}

impl<S: Store, PA: Endpoint, R: Rng + Clone> Pod<S, PA, R> {
    /// Create a pod over a store, with a seedable random number generator.
    pub fn with_rng(store: S, config: Config, rng: R) -> Self {
        let gossip = gossip::State::with_rng(config.gossip.clone(), rng.clone());
        Self {
            store,
            config,
            rng,
            gossip,
            syncs: Default::default(),
            agents: Default::default(),
            peers: Default::default(),
            outbox: Default::default(),
        }
    }

    /// The sync agent for an object, if tracked.
    pub fn sync_state(&self, obj: &Hash) -> Option<&sync::State<S, PA, R>> {
        self.syncs.get(obj)
    }

    /// The gossip agent.
    pub fn gossip_state(&self) -> &gossip::State<PA, R> {
        &self.gossip
    }

    /// The objects this pod syncs.
    pub fn tracked_objects(&self) -> impl Iterator<Item = &Hash> {
        self.syncs.keys()
    }

    /// Handle an incoming event.
    ///
    /// Returns an iterator of outgoing events that must be processed by the
    /// embedding layer.
    pub fn handle(
        &mut self,
        event: InEvent<PA>,
        now: Instant,
    ) -> impl Iterator<Item = OutEvent<PA>> + '_ {
        match event {
            InEvent::RecvMessage(from, Message::Gossip(message)) => {
                self.run(
                    [Work::Gossip(gossip::InEvent::RecvMessage(from, message))].into(),
                    now,
                );
            }
            InEvent::RecvMessage(from, Message::Sync(message)) => {
                let target = *message.target();
                if self.syncs.contains_key(&target) {
                    self.run(
                        [Work::Sync(target, sync::InEvent::RecvMessage(from, message))].into(),
                        now,
                    );
                } else {
                    debug!(obj = %target.fmt_short(), ?from,
                        "pod: sync message for untracked target, ignoring");
                }
            }
            InEvent::StoreEvent(StoreEvent::OpSaved { target, op }) => {
                if self.syncs.contains_key(&target) {
                    self.run([Work::Sync(target, sync::InEvent::OpSaved(op))].into(), now);
                }
            }
            InEvent::Command(Command::TrackObject {
                obj,
                accepted_classes,
            }) => {
                self.track_object(obj, accepted_classes, now);
            }
            InEvent::TimerExpired(Timer::Gossip(timer)) => {
                self.run([Work::Gossip(gossip::InEvent::TimerExpired(timer))].into(), now);
            }
            InEvent::TimerExpired(Timer::Sync(obj, timer)) => {
                if self.syncs.contains_key(&obj) {
                    self.run(
                        [Work::Sync(obj, sync::InEvent::TimerExpired(timer))].into(),
                        now,
                    );
                }
            }
            InEvent::PeerJoined(peer) => {
                if !self.peers.contains(&peer) {
                    self.peers.push(peer);
                }
                self.run([Work::Gossip(gossip::InEvent::PeerJoined(peer))].into(), now);
            }
            InEvent::PeerLost(peer) => {
                self.peers.retain(|p| *p != peer);
                let mut queue: VecDeque<Work<PA>> =
                    [Work::Gossip(gossip::InEvent::PeerLost(peer))].into();
                for obj in self.syncs.keys() {
                    queue.push_back(Work::Sync(*obj, sync::InEvent::PeerLost(peer)));
                }
                self.run(queue, now);
            }
        }
        self.outbox.drain(..)
    }

    /// Register a sync agent for a mutable object and announce it to the
    /// gossip layer. Idempotent.
    fn track_object(&mut self, obj: Hash, accepted_classes: BTreeSet<String>, now: Instant) {
        let agent = AgentId::terminal_ops_agent(&obj);
        if self.agents.contains_key(&agent) {
            return;
        }
        let mut sync = sync::State::new(
            obj,
            accepted_classes,
            self.store.clone(),
            self.config.sync.clone(),
            self.rng.clone(),
        );
        let mut sio = VecDeque::new();
        sync.load_initial(&mut sio);
        for peer in &self.peers {
            sync.start_sync(*peer, &mut sio);
        }
        self.syncs.insert(obj, sync);
        self.agents.insert(agent, obj);

        let mut queue = VecDeque::new();
        queue.push_back(Work::Gossip(gossip::InEvent::TrackAgent(agent)));
        self.drain_sync_out(obj, sio, &mut queue);
        self.run(queue, now);
    }

    /// The pod scheduler: run agents to completion, routing the events they
    /// raise for each other until the queue drains.
    fn run(&mut self, mut queue: VecDeque<Work<PA>>, now: Instant) {
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Gossip(event) => {
                    let mut io = VecDeque::new();
                    self.gossip.handle(event, now, &mut io);
                    for out in io {
                        match out {
                            gossip::OutEvent::SendMessage(to, message) => self
                                .outbox
                                .push_back(OutEvent::SendMessage(to, message.into())),
                            gossip::OutEvent::ScheduleTimer(delay, timer) => self
                                .outbox
                                .push_back(OutEvent::ScheduleTimer(delay, Timer::Gossip(timer))),
                            gossip::OutEvent::DeliverState { from, agent, state } => {
                                queue.push_back(Work::Deliver { from, agent, state });
                            }
                        }
                    }
                }
                Work::Deliver { from, agent, state } => {
                    let outcome = self.deliver_state(from, agent, &state, now, &mut queue);
                    queue.push_back(Work::Gossip(gossip::InEvent::DeliveryOutcome {
                        from,
                        agent,
                        outcome,
                    }));
                }
                Work::Sync(obj, event) => {
                    let mut io = VecDeque::new();
                    if let Some(sync) = self.syncs.get_mut(&obj) {
                        sync.handle(event, now, &mut io);
                    }
                    self.drain_sync_out(obj, io, &mut queue);
                }
            }
        }
    }

    fn deliver_state(
        &mut self,
        from: PA,
        agent: AgentId,
        state: &Literal,
        now: Instant,
        queue: &mut VecDeque<Work<PA>>,
    ) -> gossip::Delivery {
        let Some(obj) = self.agents.get(&agent).copied() else {
            return gossip::Delivery::Known;
        };
        let Some(sync) = self.syncs.get_mut(&obj) else {
            return gossip::Delivery::Known;
        };
        let mut io = VecDeque::new();
        let result = sync.receive_remote_state(from, state, now, &mut io);
        self.drain_sync_out(obj, io, queue);
        match result {
            Ok(true) => gossip::Delivery::New,
            Ok(false) => gossip::Delivery::Known,
            Err(err) => {
                warn!(%agent, ?from, %err, "pod: agent rejected remote state");
                gossip::Delivery::Failed
            }
        }
    }

    fn drain_sync_out(
        &mut self,
        obj: Hash,
        io: VecDeque<sync::OutEvent<PA>>,
        queue: &mut VecDeque<Work<PA>>,
    ) {
        for out in io {
            match out {
                sync::OutEvent::SendMessage(to, message) => self
                    .outbox
                    .push_back(OutEvent::SendMessage(to, Message::Sync(message))),
                sync::OutEvent::ScheduleTimer(delay, timer) => self
                    .outbox
                    .push_back(OutEvent::ScheduleTimer(delay, Timer::Sync(obj, timer))),
                sync::OutEvent::StateUpdated(literal) => {
                    self.outbox.push_back(OutEvent::EmitEvent(Event::StateUpdated {
                        target: obj,
                        state_hash: literal.hash,
                    }));
                    queue.push_back(Work::Gossip(gossip::InEvent::LocalState {
                        agent: AgentId::terminal_ops_agent(&obj),
                        state: literal,
                    }));
                }
                sync::OutEvent::OpsSynced(ops) => {
                    self.outbox
                        .push_back(OutEvent::EmitEvent(Event::OpsSynced { target: obj, ops }));
                }
            }
        }
    }
}
