/// Coordination endpoint for sync sessions
///
/// The SyncHub relays filter and highlight messages from one session to
/// every other attached session, keeps a `PeerSession` record per
/// connection, and tracks which chart ids each session currently hosts. It
/// holds no filter state of its own: sessions stay authoritative for their
/// data.
///
/// Pop-outs are request-scoped. A `popout` goes to every other session and
/// the hub collects the answers: the first `popout_ack` is forwarded to the
/// requester and every other asked session gets `popout_cancel`; a
/// `popout_fail` reaches the requester only once every asked session has
/// refused or left.
///
/// Transports plug in through `PeerSink`. In process, `SyncHub::connect()`
/// returns a `PeerLink` wired through tokio channels; the `server` feature
/// attaches one WebSocket actor per connection.
use crate::datastore::lock;
use crate::messages::SyncMessage;
use crate::sync::PeerLink;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Outbound half of a hub connection
pub trait PeerSink: Send + Sync {
    /// Queue a message for the peer. Returns false once the peer is gone.
    fn deliver(&self, message: &SyncMessage) -> bool;
}

impl PeerSink for mpsc::UnboundedSender<SyncMessage> {
    fn deliver(&self, message: &SyncMessage) -> bool {
        self.send(message.clone()).is_ok()
    }
}

/// One connected session as the hub sees it
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSession {
    pub connection_id: ConnectionId,
    /// Set by the session's `hello`
    pub session_id: Option<String>,
    /// Charts this session hosts after winning a pop-out
    pub charts: BTreeSet<String>,
}

struct Attached {
    session: PeerSession,
    sink: Arc<dyn PeerSink>,
}

/// A pop-out waiting for answers
struct PendingPopout {
    requester: ConnectionId,
    awaiting: BTreeSet<ConnectionId>,
}

type Delivery = (Vec<ConnectionId>, SyncMessage);

#[derive(Default)]
struct HubState {
    next_id: ConnectionId,
    peers: BTreeMap<ConnectionId, Attached>,
    popouts: HashMap<String, PendingPopout>,
}

impl HubState {
    fn others(&self, from: ConnectionId) -> Vec<ConnectionId> {
        self.peers.keys().copied().filter(|id| *id != from).collect()
    }

    /// Decide who receives a message from `from`
    fn dispatch(&mut self, from: ConnectionId, message: SyncMessage) -> Vec<Delivery> {
        match &message {
            SyncMessage::Hello { session_id } => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    log::debug!("Hub: connection {} is session {}", from, session_id);
                    peer.session.session_id = Some(session_id.clone());
                }
                Vec::new()
            }
            SyncMessage::Popout { chart_id, .. } => {
                let chart_id = chart_id.clone();
                let others = self.others(from);
                if others.is_empty() || self.popouts.contains_key(&chart_id) {
                    log::debug!("Hub: pop-out of '{}' has no taker", chart_id);
                    return vec![(vec![from], SyncMessage::PopoutFail { chart_id })];
                }
                self.popouts.insert(
                    chart_id,
                    PendingPopout {
                        requester: from,
                        awaiting: others.iter().copied().collect(),
                    },
                );
                vec![(others, message)]
            }
            SyncMessage::PopoutAck { chart_id, .. } => {
                let chart_id = chart_id.clone();
                let asked = self
                    .popouts
                    .get(&chart_id)
                    .is_some_and(|pending| pending.awaiting.contains(&from));
                let pending = if asked { self.popouts.remove(&chart_id) } else { None };
                let Some(pending) = pending else {
                    log::debug!("Hub: late ack for '{}' from {}", chart_id, from);
                    return vec![(vec![from], SyncMessage::PopoutCancel { chart_id })];
                };

                for (id, peer) in self.peers.iter_mut() {
                    if *id == from {
                        peer.session.charts.insert(chart_id.clone());
                    } else {
                        peer.session.charts.remove(&chart_id);
                    }
                }
                let losers: Vec<ConnectionId> =
                    pending.awaiting.into_iter().filter(|id| *id != from).collect();
                vec![
                    (vec![pending.requester], message),
                    (losers, SyncMessage::PopoutCancel { chart_id }),
                ]
            }
            SyncMessage::PopoutFail { chart_id } => {
                let Some(pending) = self.popouts.get_mut(chart_id) else {
                    return Vec::new();
                };
                if !pending.awaiting.remove(&from) || !pending.awaiting.is_empty() {
                    return Vec::new();
                }
                let requester = pending.requester;
                self.popouts.remove(chart_id);
                vec![(vec![requester], message)]
            }
            SyncMessage::PopoutCancel { chart_id } => {
                let withdrawn = self
                    .popouts
                    .get(chart_id)
                    .is_some_and(|pending| pending.requester == from);
                if withdrawn {
                    let awaiting = self
                        .popouts
                        .remove(chart_id)
                        .map(|pending| pending.awaiting.into_iter().collect())
                        .unwrap_or_default();
                    return vec![(awaiting, message)];
                }
                let hosts: Vec<ConnectionId> = self
                    .peers
                    .iter_mut()
                    .filter(|(id, _)| **id != from)
                    .filter_map(|(id, peer)| peer.session.charts.remove(chart_id).then_some(*id))
                    .collect();
                vec![(hosts, message)]
            }
            _ => vec![(self.others(from), message)],
        }
    }

    /// Settle the pop-outs a departing connection took part in
    fn abandon(&mut self, gone: ConnectionId) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        self.popouts.retain(|chart_id, pending| {
            if pending.requester == gone {
                deliveries.push((
                    pending.awaiting.iter().copied().collect(),
                    SyncMessage::PopoutCancel {
                        chart_id: chart_id.clone(),
                    },
                ));
                return false;
            }
            if pending.awaiting.remove(&gone) && pending.awaiting.is_empty() {
                deliveries.push((
                    vec![pending.requester],
                    SyncMessage::PopoutFail {
                        chart_id: chart_id.clone(),
                    },
                ));
                return false;
            }
            true
        });
        deliveries
    }
}

#[derive(Clone, Default)]
pub struct SyncHub {
    state: Arc<Mutex<HubState>>,
}

impl SyncHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: impl PeerSink + 'static) -> ConnectionId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let connection_id = state.next_id;
        state.peers.insert(
            connection_id,
            Attached {
                session: PeerSession {
                    connection_id,
                    session_id: None,
                    charts: BTreeSet::new(),
                },
                sink: Arc::new(sink),
            },
        );
        log::info!("Hub: connection {} attached", connection_id);
        connection_id
    }

    /// Drop a connection, settle its pop-outs and tell the remaining
    /// sessions it left
    pub fn detach(&self, connection_id: ConnectionId) {
        let (removed, deliveries) = {
            let mut state = lock(&self.state);
            let Some(removed) = state.peers.remove(&connection_id) else {
                return;
            };
            let deliveries = state.abandon(connection_id);
            (removed, deliveries)
        };
        log::info!(
            "Hub: connection {} detached ({} charts hosted)",
            connection_id,
            removed.session.charts.len()
        );

        for (targets, message) in deliveries {
            self.deliver(&targets, &message);
        }
        if let Some(session_id) = removed.session.session_id {
            self.relay(connection_id, &SyncMessage::PeerLeft { session_id });
        }
    }

    /// Handle one message from a connection
    pub fn route(&self, connection_id: ConnectionId, message: SyncMessage) {
        let deliveries = {
            let mut state = lock(&self.state);
            if !state.peers.contains_key(&connection_id) {
                log::warn!(
                    "Hub: dropping {} from unknown connection {}",
                    message.kind(),
                    connection_id
                );
                return;
            }
            state.dispatch(connection_id, message)
        };
        for (targets, message) in deliveries {
            self.deliver(&targets, &message);
        }
    }

    /// Deliver to every connection except `from`
    fn relay(&self, from: ConnectionId, message: &SyncMessage) {
        let targets = lock(&self.state).others(from);
        self.deliver(&targets, message);
    }

    /// Deliver to `targets`, detaching dead sinks
    fn deliver(&self, targets: &[ConnectionId], message: &SyncMessage) {
        let sinks: Vec<(ConnectionId, Arc<dyn PeerSink>)> = {
            let state = lock(&self.state);
            targets
                .iter()
                .filter_map(|id| state.peers.get(id).map(|peer| (*id, peer.sink.clone())))
                .collect()
        };

        let dead: Vec<ConnectionId> = sinks
            .into_iter()
            .filter(|(_, sink)| !sink.deliver(message))
            .map(|(id, _)| id)
            .collect();
        for id in dead {
            self.detach(id);
        }
    }

    /// Attach an in-process session. Must be called within a tokio runtime.
    pub fn connect(&self) -> PeerLink {
        let (client_tx, mut from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let connection_id = self.attach(to_client);

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client.recv().await {
                hub.route(connection_id, message);
            }
            hub.detach(connection_id);
        });

        PeerLink::new(client_tx, client_rx)
    }

    /// Snapshot of the attached sessions, ordered by connection id
    pub fn sessions(&self) -> Vec<PeerSession> {
        lock(&self.state)
            .peers
            .values()
            .map(|peer| peer.session.clone())
            .collect()
    }

    /// Number of pop-outs still waiting for answers
    pub fn pending_popouts(&self) -> usize {
        lock(&self.state).popouts.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
