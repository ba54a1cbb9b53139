/// Live synchronization between sessions
///
/// A SyncBridge connects one session's ChartManager to a coordination
/// endpoint over a `PeerLink` and keeps peer sessions' filter and highlight
/// state in step with its own.
///
/// # Filters
///
/// For every data source the bridge publishes the *local* filter result (the
/// conjunction of this session's own dimensions) whenever it changes. An
/// inbound peer result is applied to a mirror dimension owned by the bridge,
/// one per (data source, peer). Mirror dimensions are excluded from the
/// local result, so two sessions never feed each other's filters back and a
/// cleared filter widens the peer again.
///
/// # Ordering and idempotence
///
/// Delivery is best-effort and may reorder across connections. Inbound
/// filters carry the sender's store generation and highlights carry a
/// per-session sequence number; anything not newer than what was already
/// applied for that (data source, origin) is dropped, so replaying a message
/// is a no-op.
///
/// # Pop-out
///
/// `pop_out` asks the peers to host a chart and waits a bounded time for
/// `popout_ack` or `popout_fail`. Anything but an acknowledgement restores
/// the chart locally; a request that timed out is withdrawn with
/// `popout_cancel`. An inbound `popout` for a chart this session does not
/// have, or cannot give up right now, is answered with `popout_fail`.
///
/// The bridge remembers which peer hosts each chart it popped out and which
/// peer asked for each chart it hosts. When either side leaves, or the link
/// itself is lost, those charts return to Local.
use crate::charts::{ChartManager, PopoutOutcome};
use crate::config::SyncConfig;
use crate::datastore::{lock, DataStore};
use crate::dimension::{Dimension, DimensionScope};
use crate::error::{RoutingError, TransportError};
use crate::event::{FilteredIndices, Generation, HighlightState, RowIndex, StoreEvent};
use crate::messages::SyncMessage;
use crate::predicate::Predicate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Duplex message channel to a coordination endpoint
pub struct PeerLink {
    outbound: mpsc::UnboundedSender<SyncMessage>,
    inbound: mpsc::UnboundedReceiver<SyncMessage>,
}

impl PeerLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<SyncMessage>,
        inbound: mpsc::UnboundedReceiver<SyncMessage>,
    ) -> Self {
        PeerLink { outbound, inbound }
    }

    /// Two links wired back to back
    pub fn pair() -> (PeerLink, PeerLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (PeerLink::new(a_tx, a_rx), PeerLink::new(b_tx, b_rx))
    }

    pub fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Next inbound message; `None` once the other side is gone
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncMessage> {
        self.inbound.try_recv().ok()
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<SyncMessage>,
        mpsc::UnboundedReceiver<SyncMessage>,
    ) {
        (self.outbound, self.inbound)
    }
}

/// (data source, origin session)
type PeerKey = (String, String);

#[derive(Default)]
struct BridgeState {
    /// Last local result published per data source
    last_sent: HashMap<String, Arc<[RowIndex]>>,
    applied_generation: HashMap<PeerKey, Generation>,
    applied_seq: HashMap<PeerKey, u64>,
    mirrors: HashMap<PeerKey, Arc<Dimension>>,
    /// Charts popped out from here, by hosting session
    hosted_by: HashMap<String, String>,
    /// Charts hosted here, by requesting session when it is known
    hosting: HashMap<String, Option<String>>,
    listening: Vec<DataStore>,
}

struct BridgeInner {
    session_id: String,
    tag: String,
    charts: ChartManager,
    config: SyncConfig,
    outbound: mpsc::UnboundedSender<SyncMessage>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<SyncMessage>>>,
    state: Mutex<BridgeState>,
    highlight_seq: AtomicU64,
}

#[derive(Clone)]
pub struct SyncBridge {
    inner: Arc<BridgeInner>,
}

impl SyncBridge {
    /// Bridge a session's charts over `link`. Data sources must be added to
    /// `charts` before the bridge starts.
    pub fn new(charts: ChartManager, link: PeerLink, config: SyncConfig) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let (outbound, inbound) = link.into_parts();
        SyncBridge {
            inner: Arc::new(BridgeInner {
                tag: format!("sync:{}", session_id),
                session_id,
                charts,
                config,
                outbound,
                inbound: Mutex::new(Some(inbound)),
                state: Mutex::new(BridgeState::default()),
                highlight_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Listener tag and highlight source used on every store
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn charts(&self) -> &ChartManager {
        &self.inner.charts
    }

    /// Number of active peer mirror dimensions
    pub fn mirror_count(&self) -> usize {
        lock(&self.inner.state).mirrors.len()
    }

    /// Session hosting a chart this session popped out
    pub fn chart_host(&self, chart_id: &str) -> Option<String> {
        lock(&self.inner.state).hosted_by.get(chart_id).cloned()
    }

    /// Announce the session, start publishing local changes, and process
    /// inbound messages until the link closes
    pub async fn run(&self) {
        let Some(mut inbound) = lock(&self.inner.inbound).take() else {
            log::warn!("Sync bridge {} is already running", self.inner.session_id);
            return;
        };

        BridgeInner::start(&self.inner);
        while let Some(message) = inbound.recv().await {
            self.inner.handle_message(message);
        }
        self.inner.disconnected();
    }

    /// Run on the tokio runtime
    pub fn spawn(&self) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.run().await })
    }

    /// Apply one inbound message
    pub fn handle_message(&self, message: SyncMessage) {
        self.inner.handle_message(message);
    }

    /// Ask the peers to host `chart_id`. On anything but an acknowledgement
    /// within the configured timeout the chart is restored locally.
    pub async fn pop_out(&self, chart_id: &str) -> Result<(), RoutingError> {
        let charts = &self.inner.charts;
        let outcome = charts.begin_pop_out(chart_id)?;

        let request = SyncMessage::Popout {
            chart_id: chart_id.to_string(),
            origin: Some(self.inner.session_id.clone()),
        };
        if self.inner.send(request).is_err() {
            charts.resolve_pop_out(chart_id, PopoutOutcome::Disconnected);
            return Err(RoutingError::Disconnected(chart_id.to_string()));
        }

        log::debug!("Popping out '{}'", chart_id);
        let result = charts
            .await_pop_out(chart_id, outcome, self.inner.config.popout_timeout)
            .await;
        if let Err(RoutingError::Timeout { .. }) = &result {
            let _ = self.inner.send(SyncMessage::PopoutCancel {
                chart_id: chart_id.to_string(),
            });
        }
        result
    }

    /// Take a popped-out chart back. The hosting peer is told to release it.
    pub fn pop_in(&self, chart_id: &str) -> Result<(), RoutingError> {
        self.inner.charts.restore_local(chart_id)?;
        let host = lock(&self.inner.state).hosted_by.remove(chart_id);
        if let Some(host) = host {
            log::debug!("Taking '{}' back from {}", chart_id, host);
        }
        // Without a link there is nobody left to release it
        let _ = self.inner.send(SyncMessage::PopoutCancel {
            chart_id: chart_id.to_string(),
        });
        Ok(())
    }

    /// Stop publishing and drop every peer mirror
    pub fn shutdown(&self) {
        self.inner.stop_listening();
        self.inner.clear_mirrors(|_| true);
    }
}

impl BridgeInner {
    fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        self.outbound.send(message).map_err(|_| {
            log::debug!("Sync bridge {}: link closed", self.session_id);
            TransportError::Closed
        })
    }

    /// Send hello, subscribe to every data source, and publish any local
    /// filter already in place
    fn start(self: &Arc<Self>) {
        let _ = self.send(SyncMessage::Hello {
            session_id: self.session_id.clone(),
        });

        for store in self.charts.data_sources() {
            let weak: Weak<BridgeInner> = Arc::downgrade(self);
            let data_source = store.name().to_string();
            store.add_listener(self.tag.clone(), move |event| {
                if let Some(bridge) = weak.upgrade() {
                    bridge.on_store_event(&data_source, event);
                }
            });
            lock(&self.state).listening.push(store.clone());

            let delivered = store.last_delivered();
            if delivered.local_indices().len() == delivered.columns().len() {
                lock(&self.state)
                    .last_sent
                    .insert(store.name().to_string(), delivered.local_indices().clone());
            } else {
                self.publish_filter(store.name(), &delivered);
            }
        }
        log::info!("Sync bridge {} started", self.session_id);
    }

    fn stop_listening(&self) {
        let stores = std::mem::take(&mut lock(&self.state).listening);
        for store in stores {
            store.remove_listener(&self.tag);
        }
    }

    fn on_store_event(&self, data_source: &str, event: &StoreEvent) {
        match event {
            StoreEvent::Filtered(filtered) => self.publish_filter(data_source, filtered),
            StoreEvent::Highlighted(highlight) => self.publish_highlight(data_source, highlight),
            StoreEvent::ComputeFailed { .. } => {}
        }
    }

    fn publish_filter(&self, data_source: &str, filtered: &FilteredIndices) {
        let local = filtered.local_indices().clone();
        {
            let mut state = lock(&self.state);
            if let Some(previous) = state.last_sent.get(data_source) {
                if previous[..] == local[..] {
                    return;
                }
            }
            state.last_sent.insert(data_source.to_string(), local.clone());
        }

        let _ = self.send(SyncMessage::Filter {
            data_source: data_source.to_string(),
            origin: self.session_id.clone(),
            generation: filtered.generation(),
            indices: local.to_vec(),
        });
    }

    fn publish_highlight(&self, data_source: &str, highlight: &HighlightState) {
        let seq = self.highlight_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.send(SyncMessage::Highlight {
            data_source: data_source.to_string(),
            origin: self.session_id.clone(),
            seq,
            indices: highlight.indices.clone(),
        });
    }

    fn handle_message(&self, message: SyncMessage) {
        match message {
            SyncMessage::Hello { session_id } => {
                log::debug!("Sync bridge {}: peer {} joined", self.session_id, session_id);
            }
            SyncMessage::Filter {
                data_source,
                origin,
                generation,
                indices,
            } => self.apply_filter(data_source, origin, generation, indices),
            SyncMessage::Highlight {
                data_source,
                origin,
                seq,
                indices,
            } => self.apply_highlight(data_source, origin, seq, indices),
            SyncMessage::Popout { chart_id, origin } => {
                if origin.as_deref() == Some(self.session_id.as_str()) {
                    return;
                }
                let reply = if self.charts.accept_remote_pop_out(&chart_id) {
                    log::info!("Hosting popped-out chart '{}'", chart_id);
                    lock(&self.state).hosting.insert(chart_id.clone(), origin);
                    SyncMessage::PopoutAck {
                        chart_id,
                        host: Some(self.session_id.clone()),
                    }
                } else {
                    SyncMessage::PopoutFail { chart_id }
                };
                let _ = self.send(reply);
            }
            SyncMessage::PopoutAck { chart_id, host } => {
                if self
                    .charts
                    .resolve_pop_out(&chart_id, PopoutOutcome::Acknowledged)
                {
                    if let Some(host) = host {
                        lock(&self.state).hosted_by.insert(chart_id, host);
                    }
                }
            }
            SyncMessage::PopoutFail { chart_id } => {
                self.charts.resolve_pop_out(&chart_id, PopoutOutcome::Rejected);
            }
            SyncMessage::PopoutCancel { chart_id } => {
                let hosted = lock(&self.state).hosting.remove(&chart_id).is_some();
                if hosted {
                    log::info!("Releasing hosted chart '{}'", chart_id);
                    let _ = self.charts.restore_local(&chart_id);
                }
            }
            SyncMessage::PeerLeft { session_id } => {
                log::info!("Sync bridge {}: peer {} left", self.session_id, session_id);
                self.clear_mirrors(|(_, origin)| *origin == session_id);
                self.restore_charts(|peer| peer == Some(session_id.as_str()));
            }
            SyncMessage::Error { message } => {
                log::warn!("Sync bridge {}: endpoint error: {}", self.session_id, message);
            }
        }
    }

    fn apply_filter(
        &self,
        data_source: String,
        origin: String,
        generation: Generation,
        mut indices: Vec<RowIndex>,
    ) {
        if origin == self.session_id {
            return;
        }
        let Some(store) = self.charts.data_source(&data_source) else {
            log::debug!("Ignoring filter for unknown data source '{}'", data_source);
            return;
        };

        let key = (data_source, origin);
        let mirror = {
            let state = lock(&self.state);
            if let Some(&applied) = state.applied_generation.get(&key) {
                if generation <= applied {
                    return;
                }
            }
            state.mirrors.get(&key).cloned()
        };

        indices.sort_unstable();
        indices.dedup();
        let selects_all = indices.len() == store.len()
            && indices.last().map_or(true, |&row| row as usize + 1 == store.len());

        if selects_all {
            // Dropped outside the lock; an active mirror schedules a recompute
            let removed = {
                let mut state = lock(&self.state);
                state.applied_generation.insert(key.clone(), generation);
                state.mirrors.remove(&key)
            };
            drop(removed);
            return;
        }

        let mirror = match mirror {
            Some(mirror) => mirror,
            None => {
                let created = Arc::new(
                    store.add_scoped_dimension(format!("peer:{}", key.1), DimensionScope::Mirror),
                );
                lock(&self.state)
                    .mirrors
                    .entry(key.clone())
                    .or_insert(created)
                    .clone()
            }
        };
        match mirror.filter(Predicate::indices(indices)) {
            Ok(()) => {
                lock(&self.state).applied_generation.insert(key, generation);
            }
            Err(err) => {
                // Unknown peer state: drop the mirror
                log::warn!(
                    "Rejected filter from {} on '{}': {}",
                    key.1,
                    key.0,
                    err
                );
                let removed = lock(&self.state).mirrors.remove(&key);
                drop(mirror);
                drop(removed);
            }
        }
    }

    fn apply_highlight(&self, data_source: String, origin: String, seq: u64, indices: Vec<RowIndex>) {
        if origin == self.session_id {
            return;
        }
        let Some(store) = self.charts.data_source(&data_source) else {
            return;
        };
        {
            let mut state = lock(&self.state);
            let key = (data_source, origin);
            if let Some(&applied) = state.applied_seq.get(&key) {
                if seq <= applied {
                    return;
                }
            }
            state.applied_seq.insert(key, seq);
        }

        if store.highlight().indices == indices {
            return;
        }
        if let Err(err) = store.data_highlighted(indices, &self.tag) {
            log::warn!("Rejected highlight on '{}': {}", store.name(), err);
        }
    }

    /// Remove the mirrors matching `filter`, forgetting what was applied
    fn clear_mirrors(&self, filter: impl Fn(&PeerKey) -> bool) {
        let removed: Vec<Arc<Dimension>> = {
            let mut state = lock(&self.state);
            state.applied_generation.retain(|key, _| !filter(key));
            state.applied_seq.retain(|key, _| !filter(key));
            let keys: Vec<PeerKey> = state.mirrors.keys().filter(|k| filter(k)).cloned().collect();
            keys.iter()
                .filter_map(|key| state.mirrors.remove(key))
                .collect()
        };
        // Dropping a mirror unregisters it from its store
        drop(removed);
    }

    /// Return to Local every chart popped out to, or hosted for, a peer
    /// matching `peer`
    fn restore_charts(&self, peer: impl Fn(Option<&str>) -> bool) {
        let charts: Vec<String> = {
            let mut state = lock(&self.state);
            let mut charts = Vec::new();
            state.hosted_by.retain(|chart_id, host| {
                let gone = peer(Some(host.as_str()));
                if gone {
                    charts.push(chart_id.clone());
                }
                !gone
            });
            state.hosting.retain(|chart_id, origin| {
                let gone = peer(origin.as_deref());
                if gone {
                    charts.push(chart_id.clone());
                }
                !gone
            });
            charts
        };
        for chart_id in charts {
            log::info!("Restoring chart '{}' locally", chart_id);
            let _ = self.charts.restore_local(&chart_id);
        }
    }

    fn disconnected(&self) {
        log::warn!(
            "Sync bridge {}: link closed, keeping local state",
            self.session_id
        );
        self.clear_mirrors(|_| true);
        let failed = self.charts.fail_all_pending(PopoutOutcome::Disconnected);
        if !failed.is_empty() {
            log::info!("Restored {} pending charts locally", failed.len());
        }
        self.restore_charts(|_| true);
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
