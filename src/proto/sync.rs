//! The terminal-ops sync agent.
//!
//! One instance per `(mutable object, peer group)`. Reconciles the object's
//! op DAG with peers: publishes the local terminal-ops state when ops land,
//! fetches ops missing from received states together with just enough of
//! their dependency chains, verifies ownership proofs for omitted reference
//! dependencies, and buffers partially arrived ops until their dependencies
//! show up or a deadline passes.
//!
//! Two rules are enforced on every exchange:
//!
//! - every object request must carry a dependency chain rooted in an accepted
//!   op whose target is this agent's object, so peers cannot use the agent to
//!   exfiltrate arbitrary store content;
//! - an omitted dependency is only taken from the local store when the sender
//!   proved possession under the receiver-chosen secret, otherwise it is
//!   requested explicitly.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::hash::Hash;
use crate::keys::Identity;
use crate::literal::{DepKind, Literal, LiteralContext, OwnershipProof, ProofSecret};
use crate::model::{class_kind, ClassKind, MutationOp, TerminalOpsState};
use crate::proto::Endpoint;
use crate::store::{SaveOutcome, Store};

/// Configuration for the sync agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long an object we owe a peer may stay pending before the
    /// obligation expires.
    pub send_timeout: Duration,
    /// How long we wait for a requested object before the request expires.
    pub receive_timeout: Duration,
    /// How long a partially arrived op is buffered.
    pub incomplete_op_timeout: Duration,
    /// Cadence of the expiry sweep while any table is non-empty.
    pub sweep_interval: Duration,
    /// Cap on buffered incomplete ops.
    pub max_incomplete_ops: usize,
    /// At most this many concurrent requests for the same hash across
    /// distinct peers.
    pub max_requests_per_hash: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(90),
            incomplete_op_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(5),
            max_incomplete_ops: 512,
            max_requests_per_hash: 2,
        }
    }
}

/// One requested object, with the chain that proves it is reachable from an
/// accepted op: an ordered list of hashes from that op down to the requested
/// object's parent. Empty when the requested object is itself claimed to be
/// an op of the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRequest {
    /// The requested object.
    pub hash: Hash,
    /// Hashes from the rooting op down to the requested object's parent.
    pub dep_chain: Vec<Hash>,
}

/// Sync wire messages. Every message names its target object; messages for
/// untracked targets are logged and ignored by the pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Ask the peer for its terminal-ops state object.
    RequestState {
        /// The mutable object.
        target: Hash,
    },
    /// Reply with the terminal-ops state.
    SendState {
        /// The mutable object.
        target: Hash,
        /// The state literal.
        state: Literal,
    },
    /// Ask for listed objects, with reachability chains.
    RequestObjs {
        /// The mutable object.
        target: Hash,
        /// The objects and their chains.
        requests: Vec<ObjectRequest>,
        /// Receiver-chosen secret for ownership proofs in the reply.
        secret: ProofSecret,
    },
    /// Deliver literals and ownership proofs for omitted dependencies.
    SendObjs {
        /// The mutable object.
        target: Hash,
        /// The literal bundle.
        objects: LiteralContext,
        /// Proofs for reference dependencies omitted from the bundle.
        omitted: Vec<OwnershipProof>,
        /// Echo of the requester's secret.
        secret: Option<ProofSecret>,
    },
}

impl Message {
    /// The mutable object this message is about.
    pub fn target(&self) -> &Hash {
        match self {
            Message::RequestState { target }
            | Message::SendState { target, .. }
            | Message::RequestObjs { target, .. }
            | Message::SendObjs { target, .. } => target,
        }
    }
}

/// Sync timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Expire overdue movements and incomplete ops.
    Sweep,
}

/// Input event to the sync state handler.
#[derive(Debug, Clone)]
pub enum InEvent<PA> {
    /// Message received from the network.
    RecvMessage(PA, Message),
    /// The store persisted an op targeting this agent's object.
    OpSaved(Hash),
    /// A peer left the peer group.
    PeerLost(PA),
    /// Trigger a previously scheduled timer.
    TimerExpired(Timer),
}

/// An output event from the sync state handler.
#[derive(Debug)]
pub enum OutEvent<PA> {
    /// Send a message on the network.
    SendMessage(PA, Message),
    /// Schedule a timer.
    ScheduleTimer(Duration, Timer),
    /// The local terminal-ops state changed; the literal is ready to gossip.
    StateUpdated(Literal),
    /// Remote ops were validated and persisted.
    OpsSynced(Vec<Hash>),
}

/// Counters.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Local state publications.
    pub states_published: u64,
    /// Objects requested from peers.
    pub objs_requested: u64,
    /// Objects served to peers.
    pub objs_sent: u64,
    /// Remote ops persisted.
    pub ops_persisted: u64,
    /// Incomplete ops buffered.
    pub incomplete_created: u64,
    /// Incomplete ops completed.
    pub incomplete_completed: u64,
    /// Incomplete ops expired by the sweep.
    pub incomplete_expired: u64,
    /// Requests rejected for failing chain validation.
    pub invalid_requests: u64,
    /// Locally held dependencies that lacked a valid ownership proof.
    pub unproven_deps: u64,
}

/// A pending per-endpoint movement of one object.
#[derive(Debug, Clone)]
struct Movement {
    dep_chain: Vec<Hash>,
    secret: ProofSecret,
    deadline: Instant,
}

/// An op received before all of its dependencies.
#[derive(Debug)]
struct IncompleteOp<PA> {
    source: PA,
    /// Chain from the rooting op down to this op's parent, as originally
    /// requested. Prefixed to chains of re-requested dependencies.
    base_chain: Vec<Hash>,
    context: LiteralContext,
    missing: BTreeMap<Hash, Vec<Hash>>,
    deadline: Instant,
}

enum Resolution {
    /// The chain validates and the object is here.
    Serve(Literal),
    /// The chain could not be walked locally; send when the object arrives.
    Defer,
    /// The chain does not satisfy the reachability rule.
    Reject(&'static str),
}

/// The sync agent state.
pub struct State<S, PA, R> {
    obj: Hash,
    accepted: BTreeSet<String>,
    store: S,
    config: Config,
    rng: R,
    state: Option<TerminalOpsState>,
    state_hash: Option<Hash>,
    /// Objects we owe peers, keyed by hash then endpoint.
    outgoing: BTreeMap<Hash, HashMap<PA, Movement>>,
    /// Objects we expect from peers, keyed by hash then endpoint.
    incoming: BTreeMap<Hash, HashMap<PA, Movement>>,
    incomplete: BTreeMap<Hash, IncompleteOp<PA>>,
    /// Reverse index: missing dependency -> incomplete ops waiting on it.
    ops_for_missing: BTreeMap<Hash, BTreeSet<Hash>>,
    sweep_scheduled: bool,
    stats: Stats,
}

impl<S: Store, PA: Endpoint, R: Rng> State<S, PA, R> {
    /// Create an agent for one mutable object.
    pub fn new(
        obj: Hash,
        accepted: BTreeSet<String>,
        store: S,
        config: Config,
        rng: R,
    ) -> Self {
        Self {
            obj,
            accepted,
            store,
            config,
            rng,
            state: None,
            state_hash: None,
            outgoing: Default::default(),
            incoming: Default::default(),
            incomplete: Default::default(),
            ops_for_missing: Default::default(),
            sweep_scheduled: false,
            stats: Default::default(),
        }
    }

    /// The object this agent syncs.
    pub fn obj(&self) -> &Hash {
        &self.obj
    }

    /// The current local terminal-ops state.
    pub fn state(&self) -> Option<&TerminalOpsState> {
        self.state.as_ref()
    }

    /// The current local state hash.
    pub fn state_hash(&self) -> Option<&Hash> {
        self.state_hash.as_ref()
    }

    /// Counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Load the persisted terminal ops and publish the initial state.
    pub fn load_initial(&mut self, io: &mut VecDeque<OutEvent<PA>>) {
        self.publish_state(io);
    }

    /// Ask a peer directly for its state; complements gossip on joins.
    pub fn start_sync(&mut self, peer: PA, io: &mut VecDeque<OutEvent<PA>>) {
        io.push_back(OutEvent::SendMessage(
            peer,
            Message::RequestState { target: self.obj },
        ));
    }

    /// Handle an incoming event, pushing output events into `io`.
    pub fn handle(&mut self, event: InEvent<PA>, now: Instant, io: &mut VecDeque<OutEvent<PA>>) {
        match event {
            InEvent::RecvMessage(from, message) => self.handle_message(from, message, now, io),
            InEvent::OpSaved(op) => self.handle_op_saved(op, now, io),
            InEvent::PeerLost(peer) => {
                for table in [&mut self.incoming, &mut self.outgoing] {
                    table.retain(|_, movements| {
                        movements.remove(&peer);
                        !movements.is_empty()
                    });
                }
            }
            InEvent::TimerExpired(Timer::Sweep) => self.sweep(now, io),
        }
    }

    /// Process a state object received through gossip.
    ///
    /// Returns whether the state taught us anything new; errors are reported
    /// to the gossip agent, which retries delivery a bounded number of times.
    pub fn receive_remote_state(
        &mut self,
        from: PA,
        state: &Literal,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) -> anyhow::Result<bool> {
        state.validate()?;
        let remote = TerminalOpsState::from_literal(state)?;
        anyhow::ensure!(
            remote.mutable_obj == self.obj,
            "state object for {} delivered to agent for {}",
            remote.mutable_obj,
            self.obj
        );
        if Some(&state.hash) == self.state_hash.as_ref() {
            return Ok(false);
        }
        let mut requests = Vec::new();
        for op in &remote.terminal_ops {
            if self.store.contains(op)? {
                continue;
            }
            if self.incomplete.contains_key(op) {
                continue;
            }
            if !self.may_request(op, &from) {
                continue;
            }
            // a terminal op roots its own chain
            requests.push(ObjectRequest {
                hash: *op,
                dep_chain: Vec::new(),
            });
        }
        if requests.is_empty() {
            return Ok(false);
        }
        debug!(obj = %self.obj.fmt_short(), ?from, n = requests.len(),
            "sync: requesting missing terminal ops");
        self.request_objs(from, requests, now, io);
        Ok(true)
    }

    fn handle_message(
        &mut self,
        from: PA,
        message: Message,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        if *message.target() != self.obj {
            warn!(obj = %message.target().fmt_short(), "sync: message for wrong target");
            return;
        }
        match message {
            Message::RequestState { .. } => {
                if let Some(state) = &self.state {
                    match state.to_literal() {
                        Ok(literal) => io.push_back(OutEvent::SendMessage(
                            from,
                            Message::SendState {
                                target: self.obj,
                                state: literal,
                            },
                        )),
                        Err(err) => warn!(%err, "sync: could not literalize state"),
                    }
                }
            }
            Message::SendState { state, .. } => {
                if let Err(err) = self.receive_remote_state(from, &state, now, io) {
                    warn!(?from, %err, "sync: failed to process peer state");
                }
            }
            Message::RequestObjs {
                requests, secret, ..
            } => self.handle_request_objs(from, requests, secret, now, io),
            Message::SendObjs {
                objects,
                omitted,
                secret,
                ..
            } => self.handle_send_objs(from, objects, omitted, secret, now, io),
        }
    }

    /// Publishing: reload the terminal ops, and if the state hash moved,
    /// hand the new state literal to the gossip layer.
    fn handle_op_saved(&mut self, op: Hash, now: Instant, io: &mut VecDeque<OutEvent<PA>>) {
        self.publish_state(io);

        // serve deferred obligations now that the object exists
        if let Some(waiters) = self.outgoing.remove(&op) {
            for (peer, movement) in waiters {
                let request = ObjectRequest {
                    hash: op,
                    dep_chain: movement.dep_chain,
                };
                self.handle_request_objs(peer, vec![request], movement.secret, now, io);
            }
        }

        // a locally persisted object may complete buffered ops
        let mut persisted = self.resolve_available(op, None, now, io);
        persisted.retain(|h| self.is_own_op(h));
        if !persisted.is_empty() {
            io.push_back(OutEvent::OpsSynced(persisted));
        }
    }

    /// Whether a persisted literal is an accepted op targeting this object.
    fn is_own_op(&self, hash: &Hash) -> bool {
        let Ok(Some(literal)) = self.store.load_literal(hash) else {
            return false;
        };
        if class_kind(&literal.class_name) != Some(ClassKind::MutationOp) {
            return false;
        }
        match MutationOp::from_literal(&literal) {
            Ok(op) => op.target == self.obj,
            Err(_) => false,
        }
    }

    fn publish_state(&mut self, io: &mut VecDeque<OutEvent<PA>>) {
        let state = match self.store.terminal_ops(&self.obj) {
            Ok(state) => state,
            Err(err) => {
                warn!(%err, "sync: failed to load terminal ops");
                return;
            }
        };
        let Some(state) = state else { return };
        let literal = match state.to_literal() {
            Ok(literal) => literal,
            Err(err) => {
                warn!(%err, "sync: could not literalize state");
                return;
            }
        };
        if Some(&literal.hash) == self.state_hash.as_ref() {
            return;
        }
        trace!(obj = %self.obj.fmt_short(), state = %literal.hash.fmt_short(),
            "sync: publishing state");
        self.state = Some(state);
        self.state_hash = Some(literal.hash);
        self.stats.states_published += 1;
        io.push_back(OutEvent::StateUpdated(literal));
    }

    /// Serving side: validate each request's dependency chain, bundle what we
    /// hold, prove what we omit, defer what we lack.
    fn handle_request_objs(
        &mut self,
        from: PA,
        requests: Vec<ObjectRequest>,
        secret: ProofSecret,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        let mut ctx = LiteralContext::new();
        let mut omitted: BTreeMap<Hash, OwnershipProof> = BTreeMap::new();
        for request in requests {
            match self.resolve_request(&request) {
                Resolution::Serve(literal) => {
                    self.serialize_into(&literal, &mut ctx, &mut omitted, &secret);
                    ctx.push_root(literal);
                    self.stats.objs_sent += 1;
                }
                Resolution::Defer => {
                    trace!(obj = %request.hash.fmt_short(), ?from,
                        "sync: deferring request until object arrives");
                    self.outgoing.entry(request.hash).or_default().insert(
                        from,
                        Movement {
                            dep_chain: request.dep_chain,
                            secret,
                            deadline: now + self.config.send_timeout,
                        },
                    );
                    self.ensure_sweep(io);
                }
                Resolution::Reject(reason) => {
                    self.stats.invalid_requests += 1;
                    warn!(obj = %request.hash.fmt_short(), ?from, reason,
                        "sync: rejecting object request");
                }
            }
        }
        if !ctx.root_hashes.is_empty() {
            io.push_back(OutEvent::SendMessage(
                from,
                Message::SendObjs {
                    target: self.obj,
                    objects: ctx,
                    omitted: omitted.into_values().collect(),
                    secret: Some(secret),
                },
            ));
        }
    }

    /// Walk a request's dependency chain. The top of the chain must resolve
    /// to an accepted op targeting this agent's object, and every link must
    /// be declared by its parent's dependency list.
    fn resolve_request(&self, request: &ObjectRequest) -> Resolution {
        let top = *request.dep_chain.first().unwrap_or(&request.hash);
        let Ok(Some(top_literal)) = self.store.load_literal(&top) else {
            return Resolution::Defer;
        };
        match MutationOp::from_literal(&top_literal) {
            Ok(op) if op.target == self.obj && self.accepted.contains(&op.class_name) => {}
            _ => return Resolution::Reject("chain not rooted in an accepted op"),
        }
        let mut links = request.dep_chain.clone();
        if links.is_empty() {
            return Resolution::Serve(top_literal);
        }
        links.push(request.hash);
        let mut current = top_literal;
        for next in &links[1..] {
            if current.dependency(next).is_none() {
                return Resolution::Reject("chain link is not a declared dependency");
            }
            match self.store.load_literal(next) {
                Ok(Some(literal)) => current = literal,
                _ => return Resolution::Defer,
            }
        }
        Resolution::Serve(current)
    }

    /// Bundle a literal's transitive subobject dependencies; for reference
    /// dependencies we hold, attach an ownership proof and omit the literal.
    fn serialize_into(
        &self,
        literal: &Literal,
        ctx: &mut LiteralContext,
        omitted: &mut BTreeMap<Hash, OwnershipProof>,
        secret: &ProofSecret,
    ) {
        let mut queue = vec![literal.clone()];
        while let Some(current) = queue.pop() {
            for dep in &current.dependencies {
                match dep.kind {
                    DepKind::Subobject => {
                        if ctx.contains(&dep.hash) {
                            continue;
                        }
                        match self.store.load_literal(&dep.hash) {
                            Ok(Some(sub)) => {
                                ctx.insert(sub.clone());
                                queue.push(sub);
                            }
                            _ => trace!(dep = %dep.hash.fmt_short(),
                                "sync: subobject not held, receiver will re-request"),
                        }
                    }
                    DepKind::Reference => {
                        if omitted.contains_key(&dep.hash) {
                            continue;
                        }
                        if let Ok(Some(held)) = self.store.load_literal(&dep.hash) {
                            match OwnershipProof::compute(&held, secret) {
                                Ok(proof) => {
                                    omitted.insert(dep.hash, proof);
                                }
                                Err(err) => warn!(%err, "sync: could not compute proof"),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Receiving side of `send-objs`.
    fn handle_send_objs(
        &mut self,
        from: PA,
        objects: LiteralContext,
        omitted: Vec<OwnershipProof>,
        secret: Option<ProofSecret>,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        if let Err(err) = objects.validate() {
            warn!(?from, %err, "sync: dropping send-objs with invalid context");
            return;
        }
        let proofs: BTreeMap<Hash, OwnershipProof> =
            omitted.into_iter().map(|p| (p.hash, p)).collect();
        let mut persisted = Vec::new();

        for root in objects.root_hashes.clone() {
            let Some(movement) = self
                .incoming
                .get(&root)
                .and_then(|m| m.get(&from))
                .cloned()
            else {
                trace!(obj = %root.fmt_short(), ?from, "sync: unsolicited object, ignoring");
                continue;
            };
            if secret != Some(movement.secret) {
                warn!(obj = %root.fmt_short(), ?from, "sync: secret mismatch, ignoring");
                continue;
            }
            // this movement is fulfilled either way
            if let Some(movements) = self.incoming.get_mut(&root) {
                movements.remove(&from);
                if movements.is_empty() {
                    self.incoming.remove(&root);
                }
            }

            let ctx = LiteralContext {
                root_hashes: vec![root],
                literals: objects.literals.clone(),
            };
            let mut missing: BTreeMap<Hash, Vec<Hash>> = BTreeMap::new();
            for (dep, ext) in ctx.missing_deps() {
                match self.store.load_literal(&dep) {
                    Ok(Some(held)) => {
                        let proven = proofs
                            .get(&dep)
                            .map_or(false, |proof| proof.matches(&held, &movement.secret));
                        if proven {
                            continue;
                        }
                        // held locally but the sender did not prove possession
                        self.stats.unproven_deps += 1;
                        missing.insert(dep, ext);
                    }
                    _ => {
                        missing.insert(dep, ext);
                    }
                }
            }

            if missing.is_empty() {
                match self.try_persist(&root, &ctx) {
                    Ok(saved) => {
                        for hash in &saved {
                            let more = self.resolve_available(*hash, None, now, io);
                            persisted.extend(more);
                        }
                        persisted.extend(saved);
                    }
                    Err(err) => {
                        warn!(obj = %root.fmt_short(), ?from, %err, "sync: dropping op");
                    }
                }
            } else {
                self.stash_incomplete(from, root, movement, ctx, missing, now, io);
            }
        }

        // anything that arrived may complete previously buffered ops
        for (hash, literal) in objects.literals.clone() {
            if self.incomplete.contains_key(&hash) {
                continue;
            }
            let more = self.resolve_available(hash, Some(&literal), now, io);
            persisted.extend(more);
        }

        persisted.retain(|h| self.is_own_op(h));
        if !persisted.is_empty() {
            persisted.sort();
            persisted.dedup();
            self.stats.ops_persisted += persisted.len() as u64;
            io.push_back(OutEvent::OpsSynced(persisted));
        }
    }

    /// Buffer a partially arrived op and request its missing dependencies.
    #[allow(clippy::too_many_arguments)]
    fn stash_incomplete(
        &mut self,
        from: PA,
        root: Hash,
        movement: Movement,
        ctx: LiteralContext,
        missing: BTreeMap<Hash, Vec<Hash>>,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        let Some(root_literal) = ctx.get(&root) else {
            return;
        };
        let accepted_op = match MutationOp::from_literal(root_literal) {
            Ok(op) => op.target == self.obj && self.accepted.contains(&op.class_name),
            Err(_) => false,
        };
        if !accepted_op {
            trace!(obj = %root.fmt_short(), "sync: dropping partial non-op arrival");
            return;
        }
        if self.incomplete.len() >= self.config.max_incomplete_ops {
            warn!(obj = %root.fmt_short(), "sync: incomplete op cache full, dropping");
            return;
        }

        let mut requests = Vec::new();
        let mut full_missing = BTreeMap::new();
        for (dep, ext) in missing {
            let mut chain = movement.dep_chain.clone();
            chain.extend(ext);
            self.ops_for_missing.entry(dep).or_default().insert(root);
            if self.may_request(&dep, &from) {
                requests.push(ObjectRequest {
                    hash: dep,
                    dep_chain: chain.clone(),
                });
            }
            full_missing.insert(dep, chain);
        }

        debug!(obj = %root.fmt_short(), missing = full_missing.len(),
            "sync: buffering incomplete op");
        self.incomplete.insert(
            root,
            IncompleteOp {
                source: from,
                base_chain: movement.dep_chain,
                context: ctx,
                missing: full_missing,
                deadline: now + self.config.incomplete_op_timeout,
            },
        );
        self.stats.incomplete_created += 1;

        if !requests.is_empty() {
            self.request_objs(from, requests, now, io);
        }
        self.ensure_sweep(io);
    }

    /// An object became available, either persisted locally or carried by a
    /// context. Fold it into waiting incomplete ops, recompute what they
    /// still miss, and persist the ones that are complete. Completions
    /// cascade through the work list.
    fn resolve_available(
        &mut self,
        hash: Hash,
        literal: Option<&Literal>,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) -> Vec<Hash> {
        let mut persisted = Vec::new();
        let mut work: VecDeque<(Hash, Option<Literal>)> =
            [(hash, literal.cloned())].into_iter().collect();
        while let Some((avail, avail_literal)) = work.pop_front() {
            let Some(waiters) = self.ops_for_missing.remove(&avail) else {
                continue;
            };
            for op_hash in waiters {
                let Some(mut inc) = self.incomplete.remove(&op_hash) else {
                    continue;
                };
                if let Some(literal) = &avail_literal {
                    inc.context.insert(literal.clone());
                }
                inc.missing.remove(&avail);

                // recompute what the context still lacks; the store may have
                // caught up independently
                let mut still = BTreeMap::new();
                for (dep, ext) in inc.context.missing_deps() {
                    if self.store.contains(&dep).unwrap_or(false) {
                        continue;
                    }
                    let mut chain = inc.base_chain.clone();
                    chain.extend(ext);
                    still.insert(dep, chain);
                }

                if still.is_empty() {
                    match self.try_persist(&op_hash, &inc.context) {
                        Ok(saved) => {
                            self.stats.incomplete_completed += 1;
                            for s in &saved {
                                work.push_back((*s, None));
                            }
                            persisted.extend(saved);
                        }
                        Err(err) => {
                            warn!(obj = %op_hash.fmt_short(), %err,
                                "sync: dropping completed op that failed persistence");
                        }
                    }
                } else {
                    let source = inc.source;
                    let mut requests = Vec::new();
                    for (dep, chain) in &still {
                        self.ops_for_missing
                            .entry(*dep)
                            .or_default()
                            .insert(op_hash);
                        if self.may_request(dep, &source) {
                            requests.push(ObjectRequest {
                                hash: *dep,
                                dep_chain: chain.clone(),
                            });
                        }
                    }
                    inc.missing = still;
                    self.incomplete.insert(op_hash, inc);
                    if !requests.is_empty() {
                        self.request_objs(source, requests, now, io);
                    }
                }
            }
        }
        persisted
    }

    /// Persist a context root together with the bundled dependencies it
    /// needs, dependencies first. Ops targeting this agent's object are
    /// verified and indexed; everything else is stored as plain data.
    fn try_persist(&self, root: &Hash, ctx: &LiteralContext) -> anyhow::Result<Vec<Hash>> {
        let mut saved = Vec::new();
        let mut visited = BTreeSet::new();
        self.persist_rec(root, ctx, &mut visited, &mut saved)?;
        Ok(saved)
    }

    fn persist_rec(
        &self,
        hash: &Hash,
        ctx: &LiteralContext,
        visited: &mut BTreeSet<Hash>,
        saved: &mut Vec<Hash>,
    ) -> anyhow::Result<()> {
        if !visited.insert(*hash) {
            return Ok(());
        }
        if self.store.contains(hash)? {
            return Ok(());
        }
        let Some(literal) = ctx.get(hash) else {
            anyhow::bail!("literal {hash} neither bundled nor persisted");
        };
        for dep in &literal.dependencies {
            if ctx.contains(&dep.hash) {
                self.persist_rec(&dep.hash, ctx, visited, saved)?;
            }
        }
        let header = if class_kind(&literal.class_name) == Some(ClassKind::MutationOp) {
            let op = MutationOp::from_literal(literal)?;
            let identity_literal = ctx
                .get(&op.author)
                .cloned()
                .or(self.store.load_literal(&op.author)?)
                .ok_or_else(|| anyhow::anyhow!("author identity for op {hash} unavailable"))?;
            let identity = Identity::from_literal(&identity_literal)?;
            op.verify(&identity)?;
            if op.target == self.obj {
                if !self.accepted.contains(&op.class_name) {
                    anyhow::bail!("op class {:?} not accepted", op.class_name);
                }
                Some(op.header())
            } else {
                // ops of other objects are kept as evidence only; their own
                // sync agent indexes them
                None
            }
        } else {
            None
        };
        if let SaveOutcome::Saved = self.store.save(literal, header.as_ref())? {
            saved.push(*hash);
        }
        Ok(())
    }

    fn request_objs(
        &mut self,
        to: PA,
        requests: Vec<ObjectRequest>,
        now: Instant,
        io: &mut VecDeque<OutEvent<PA>>,
    ) {
        let secret = ProofSecret::random(&mut self.rng);
        for request in &requests {
            self.incoming.entry(request.hash).or_default().insert(
                to,
                Movement {
                    dep_chain: request.dep_chain.clone(),
                    secret,
                    deadline: now + self.config.receive_timeout,
                },
            );
        }
        self.stats.objs_requested += requests.len() as u64;
        io.push_back(OutEvent::SendMessage(
            to,
            Message::RequestObjs {
                target: self.obj,
                requests,
                secret,
            },
        ));
        self.ensure_sweep(io);
    }

    /// Backpressure: refuse more than `max_requests_per_hash` concurrent
    /// registrations for the same hash across distinct peers, and duplicate
    /// registrations for the same peer.
    fn may_request(&self, hash: &Hash, from: &PA) -> bool {
        match self.incoming.get(hash) {
            None => true,
            Some(movements) => {
                if movements.contains_key(from) {
                    false
                } else if movements.len() >= self.config.max_requests_per_hash {
                    trace!(obj = %hash.fmt_short(), "sync: request backpressure");
                    false
                } else {
                    true
                }
            }
        }
    }

    fn ensure_sweep(&mut self, io: &mut VecDeque<OutEvent<PA>>) {
        if !self.sweep_scheduled {
            self.sweep_scheduled = true;
            io.push_back(OutEvent::ScheduleTimer(
                self.config.sweep_interval,
                Timer::Sweep,
            ));
        }
    }

    /// Housekeeping: expire overdue movements and incomplete ops.
    fn sweep(&mut self, now: Instant, io: &mut VecDeque<OutEvent<PA>>) {
        self.sweep_scheduled = false;
        for table in [&mut self.incoming, &mut self.outgoing] {
            table.retain(|_, movements| {
                movements.retain(|_, m| m.deadline > now);
                !movements.is_empty()
            });
        }
        let expired: Vec<Hash> = self
            .incomplete
            .iter()
            .filter(|(_, inc)| inc.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            if let Some(inc) = self.incomplete.remove(&hash) {
                warn!(obj = %hash.fmt_short(), "sync: expiring incomplete op");
                self.stats.incomplete_expired += 1;
                for dep in inc.missing.keys() {
                    if let Some(waiters) = self.ops_for_missing.get_mut(dep) {
                        waiters.remove(&hash);
                        if waiters.is_empty() {
                            self.ops_for_missing.remove(dep);
                        }
                    }
                }
            }
        }
        if !self.incoming.is_empty() || !self.outgoing.is_empty() || !self.incomplete.is_empty() {
            self.ensure_sweep(io);
        }
    }
}
