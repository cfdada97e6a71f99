//! Run a protocol pod on tokio, against a transport-supplied message channel.
//!
//! The transport itself is out of scope: whoever owns the data channels
//! passes an outbound sender at spawn time and feeds inbound peer messages
//! and membership changes through the [`Node`] handle. Everything else
//! (timers, store notifications, event fan-out) is owned by the actor.

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::hash::Hash;
use crate::proto::pod::{Config, Pod};
use crate::proto::util::TimerMap;
use crate::proto::{Command, Endpoint, Event, InEvent, Message, OutEvent, Timer};
use crate::store::{Store, StoreEvent};

const TO_ACTOR_CAP: usize = 64;
const EVENT_CAP: usize = 1024;

/// Handle to a running node actor.
///
/// Cloning hands out another handle to the same actor; the actor stops when
/// [`Node::shutdown`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct Node<PA> {
    to_actor_tx: mpsc::Sender<ToActor<PA>>,
}

#[derive(Debug)]
enum ToActor<PA> {
    PeerMessage(PA, Bytes),
    PeerJoined(PA),
    PeerLost(PA),
    TrackObject {
        obj: Hash,
        accepted_classes: BTreeSet<String>,
    },
    Subscribe(oneshot::Sender<broadcast::Receiver<Event>>),
    Shutdown(oneshot::Sender<()>),
}

impl<PA: Endpoint + Send + Sync + 'static> Node<PA> {
    /// Spawn a node actor over a store.
    ///
    /// `outbound` receives every protocol message addressed to a peer; the
    /// transport is expected to deliver the bytes to that endpoint and feed
    /// whatever arrives back through [`Node::peer_message`].
    pub fn spawn<S: Store>(store: S, config: Config, outbound: mpsc::Sender<(PA, Bytes)>) -> Self {
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let (event_tx, _event_rx) = broadcast::channel(EVENT_CAP);
        let store_events = store.subscribe();
        let pod = Pod::with_rng(store, config, StdRng::from_entropy());
        let actor = Actor {
            pod,
            to_actor_rx,
            store_events,
            outbound,
            timers: Timers::new(),
            event_tx,
        };
        tokio::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    warn!("node actor closed with error: {err:?}");
                }
            }
            .instrument(error_span!("dagsync")),
        );
        Self { to_actor_tx }
    }

    /// Feed an inbound peer message.
    pub async fn peer_message(&self, from: PA, bytes: Bytes) -> Result<()> {
        self.send(ToActor::PeerMessage(from, bytes)).await
    }

    /// Tell the node a peer joined the peer group.
    pub async fn peer_joined(&self, peer: PA) -> Result<()> {
        self.send(ToActor::PeerJoined(peer)).await
    }

    /// Tell the node a peer left the peer group.
    pub async fn peer_lost(&self, peer: PA) -> Result<()> {
        self.send(ToActor::PeerLost(peer)).await
    }

    /// Start syncing a mutable object.
    pub async fn track_object(
        &self,
        obj: Hash,
        accepted_classes: BTreeSet<String>,
    ) -> Result<()> {
        self.send(ToActor::TrackObject {
            obj,
            accepted_classes,
        })
        .await
    }

    /// Subscribe to sync events.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<Event>> {
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Subscribe(tx)).await?;
        rx.await.map_err(|_| anyhow!("actor dropped"))
    }

    /// Stop the actor: halts the periodic sweeps and drops the store
    /// subscription.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ToActor::Shutdown(tx)).await?;
        rx.await.map_err(|_| anyhow!("actor dropped"))
    }

    async fn send(&self, msg: ToActor<PA>) -> Result<()> {
        self.to_actor_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("node actor is gone"))
    }
}

/// Actor holding the pod; sole owner of protocol state.
struct Actor<S: Store, PA: Endpoint> {
    pod: Pod<S, PA, StdRng>,
    to_actor_rx: mpsc::Receiver<ToActor<PA>>,
    store_events: flume::Receiver<StoreEvent>,
    outbound: mpsc::Sender<(PA, Bytes)>,
    timers: Timers<Timer<PA>>,
    event_tx: broadcast::Sender<Event>,
}

impl<S: Store, PA: Endpoint + Send + Sync + 'static> Actor<S, PA> {
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    match msg {
                        Some(ToActor::Shutdown(reply)) => {
                            debug!("node actor shutting down");
                            reply.send(()).ok();
                            break;
                        }
                        Some(msg) => self.handle_to_actor(msg).await,
                        None => {
                            debug!("all node handles dropped, stopping actor");
                            break;
                        }
                    }
                }
                event = self.store_events.recv_async() => {
                    match event {
                        Ok(event) => self.handle_in_event(InEvent::StoreEvent(event)).await,
                        Err(_) => break,
                    }
                }
                drained = self.timers.wait_and_drain() => {
                    for timer in drained {
                        self.handle_in_event(InEvent::TimerExpired(timer)).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_to_actor(&mut self, msg: ToActor<PA>) {
        trace!(?msg, "handle to_actor");
        match msg {
            ToActor::PeerMessage(from, bytes) => match Message::decode(&bytes) {
                Ok(message) => {
                    self.handle_in_event(InEvent::RecvMessage(from, message))
                        .await
                }
                Err(err) => warn!(?from, %err, "failed to decode peer message"),
            },
            ToActor::PeerJoined(peer) => self.handle_in_event(InEvent::PeerJoined(peer)).await,
            ToActor::PeerLost(peer) => self.handle_in_event(InEvent::PeerLost(peer)).await,
            ToActor::TrackObject {
                obj,
                accepted_classes,
            } => {
                self.handle_in_event(InEvent::Command(Command::TrackObject {
                    obj,
                    accepted_classes,
                }))
                .await
            }
            ToActor::Subscribe(reply) => {
                reply.send(self.event_tx.subscribe()).ok();
            }
            ToActor::Shutdown(_) => unreachable!("handled in run"),
        }
    }

    async fn handle_in_event(&mut self, event: InEvent<PA>) {
        let now = Instant::now();
        let out: Vec<_> = self.pod.handle(event, now).collect();
        for event in out {
            match event {
                OutEvent::SendMessage(to, message) => match message.encode() {
                    Ok(bytes) => {
                        if self.outbound.send((to, bytes)).await.is_err() {
                            // transport gone; re-gossip recovers once it returns
                            warn!(?to, "peer message send failure");
                        }
                    }
                    Err(err) => warn!(%err, "failed to encode message"),
                },
                OutEvent::ScheduleTimer(delay, timer) => {
                    self.timers.insert(now + delay, timer);
                }
                OutEvent::EmitEvent(event) => {
                    self.event_tx.send(event).ok();
                }
            }
        }
    }
}

/// Timer queue bridging the sans-IO [`TimerMap`] into the tokio select loop.
struct Timers<T> {
    map: TimerMap<T>,
}

impl<T> Timers<T> {
    fn new() -> Self {
        Self {
            map: TimerMap::new(),
        }
    }

    fn insert(&mut self, at: Instant, item: T) {
        self.map.insert(at, item);
    }

    /// Sleep until the earliest deadline, then drain everything due.
    /// Pends forever while empty.
    async fn wait_and_drain(&mut self) -> Vec<T> {
        match self.map.first() {
            Some(deadline) => {
                let deadline = *deadline;
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                self.map
                    .drain_until(&Instant::now())
                    .map(|(_, t)| t)
                    .collect()
            }
            None => futures::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Author;
    use crate::literal::Value;
    use crate::model::{register_class, ClassKind, MutableObject, MutationOp};
    use crate::store::memory::MemStore;
    use crate::store::SaveOutcome;
    use std::time::Duration;

    const CLASS: &str = "test/note";

    /// Forward one node's outbound messages into the other node, tagged with
    /// the sender's endpoint.
    fn pump(mut rx: mpsc::Receiver<(u8, Bytes)>, from: u8, to_node: Node<u8>) {
        tokio::spawn(async move {
            while let Some((_to, bytes)) = rx.recv().await {
                if to_node.peer_message(from, bytes).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn two_nodes_sync_an_op() -> Result<()> {
        register_class(CLASS, ClassKind::MutationOp).unwrap();

        let author = Author::new(&mut rand::rngs::OsRng);
        let identity = author.identity().to_literal().unwrap();
        let obj = MutableObject::new([CLASS.to_string()], &mut rand::thread_rng());
        let obj_literal = obj.to_literal().unwrap();
        let target = obj_literal.hash;

        let store_a = MemStore::new();
        let store_b = MemStore::new();
        for store in [&store_a, &store_b] {
            store.save(&identity, None).unwrap();
            store.save(&obj_literal, None).unwrap();
        }

        let (out_a_tx, out_a_rx) = mpsc::channel(64);
        let (out_b_tx, out_b_rx) = mpsc::channel(64);
        let node_a = Node::<u8>::spawn(store_a.clone(), Config::default(), out_a_tx);
        let node_b = Node::<u8>::spawn(store_b.clone(), Config::default(), out_b_tx);
        pump(out_a_rx, 0, node_b.clone());
        pump(out_b_rx, 1, node_a.clone());

        node_a.peer_joined(1).await?;
        node_b.peer_joined(0).await?;
        let accepted: BTreeSet<String> = [CLASS.to_string()].into_iter().collect();
        node_a.track_object(target, accepted.clone()).await?;
        node_b.track_object(target, accepted).await?;

        let events_b = store_b.subscribe();

        // author an op on node A only
        let mut op = MutationOp::new(
            CLASS,
            target,
            author.identity().hash().unwrap(),
            Value::Text("hello".into()),
        );
        op.sign(&author).unwrap();
        assert_eq!(
            store_a
                .save(&op.to_literal().unwrap(), Some(&op.header()))
                .unwrap(),
            SaveOutcome::Saved
        );

        // node B converges through gossip + terminal-ops sync
        let event = tokio::time::timeout(Duration::from_secs(10), events_b.recv_async()).await??;
        assert_eq!(
            event,
            StoreEvent::OpSaved {
                target,
                op: op.hash().unwrap()
            }
        );
        assert_eq!(
            store_b.terminal_ops(&target).unwrap().unwrap().terminal_ops,
            [op.hash().unwrap()].into_iter().collect()
        );

        node_a.shutdown().await?;
        node_b.shutdown().await?;
        Ok(())
    }
}
