/// LiveFilter DataStore
///
/// The DataStore is the filtering engine of one dataset. It owns the current
/// ColumnStore, the registered Dimensions with their predicates, the last
/// delivered filtered set and the highlight state, and it notifies keyed
/// listeners whenever any of these change.
///
/// # Recompute model
///
/// Every mutation (setting or clearing a predicate, unregistering an active
/// dimension, reloading columns) increments the store generation and wakes
/// the recompute driver. The driver is a single tokio task per store:
///
/// 1. snapshot `(generation, columns, active predicates)` under the lock
/// 2. evaluate the conjunction over `[0, N)` on the blocking pool
/// 3. deliver only if the store generation still equals the snapshot's
///
/// A stale evaluation is never merged or delivered; it is dropped and the
/// driver starts over from the newest generation. Evaluations also poll the
/// latest generation and give up early once superseded. Several mutations
/// issued before the driver wakes collapse into one evaluation.
///
/// When the store is created outside a tokio runtime there is no driver and
/// the evaluation runs inline on the mutating call.
///
/// # Listeners
///
/// Listeners are keyed by tag; adding a tag that exists replaces its
/// callback in place. Callbacks run with no store lock held and may call
/// back into the store.

use crate::dimension::{Dimension, DimensionId, DimensionScope};
use crate::error::{ComputeError, ConfigurationError};
use crate::event::{FilteredIndices, Generation, HighlightState, RowIndex, StoreEvent};
use crate::predicate::{CompiledPredicate, Predicate};
use crate::store::ColumnStore;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};

/// Rows evaluated between checks for a newer generation
const STALE_CHECK_INTERVAL: usize = 4096;

/// Lock a registry mutex. A panicking listener must not take the store down
/// with it, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type ListenerCallback = dyn Fn(&StoreEvent) + Send + Sync;

/// Per-listener delivery options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Also receive `StoreEvent::ComputeFailed`
    pub report_errors: bool,
}

struct ListenerEntry {
    callback: Arc<ListenerCallback>,
    options: ListenerOptions,
    /// Highest generation delivered to this listener
    last_seen: AtomicU64,
}

struct DimensionSlot {
    name: String,
    scope: DimensionScope,
    predicate: Option<Predicate>,
}

struct StoreState {
    columns: Arc<ColumnStore>,
    generation: Generation,
    dimensions: BTreeMap<DimensionId, DimensionSlot>,
    delivered: FilteredIndices,
    highlight: HighlightState,
}

/// Snapshot handed to one evaluation
struct Job {
    generation: Generation,
    columns: Arc<ColumnStore>,
    predicates: Vec<(String, DimensionScope, Predicate)>,
}

enum Outcome {
    Done {
        indices: Arc<[RowIndex]>,
        local: Arc<[RowIndex]>,
    },
    Superseded,
    Failed(ComputeError),
}

struct StoreInner {
    name: String,
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<(String, Arc<ListenerEntry>)>>,
    wake: Arc<Notify>,
    settled: watch::Sender<Generation>,
    latest: Arc<AtomicU64>,
    runtime: Option<Handle>,
}

/// Cheaply cloneable handle to a filtering engine
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<StoreInner>,
}

impl DataStore {
    /// Create a store over a loaded column set. Inside a tokio runtime this
    /// spawns the store's recompute driver.
    pub fn new(columns: ColumnStore) -> Self {
        let columns = Arc::new(columns);
        let (settled, _) = watch::channel(0);
        let inner = Arc::new(StoreInner {
            name: columns.name().to_string(),
            state: Mutex::new(StoreState {
                delivered: FilteredIndices::identity(0, columns.clone()),
                columns,
                generation: 0,
                dimensions: BTreeMap::new(),
                highlight: HighlightState::default(),
            }),
            listeners: Mutex::new(Vec::new()),
            wake: Arc::new(Notify::new()),
            settled,
            latest: Arc::new(AtomicU64::new(0)),
            runtime: Handle::try_current().ok(),
        });

        if let Some(handle) = &inner.runtime {
            handle.spawn(drive(Arc::downgrade(&inner), inner.wake.clone()));
        }

        log::debug!("Created data store '{}'", inner.name);
        DataStore { inner }
    }

    /// Dataset name; the `dataSource` key on the wire
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current row count N
    pub fn len(&self) -> usize {
        lock(&self.inner.state).columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> Generation {
        lock(&self.inner.state).generation
    }

    pub fn columns(&self) -> Arc<ColumnStore> {
        lock(&self.inner.state).columns.clone()
    }

    pub fn dimension_count(&self) -> usize {
        lock(&self.inner.state).dimensions.len()
    }

    /// Whether two handles refer to the same store
    pub fn same_store(&self, other: &DataStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create a local dimension and register it
    pub fn add_dimension(&self, name: impl Into<String>) -> Dimension {
        self.add_scoped_dimension(name, DimensionScope::Local)
    }

    pub(crate) fn add_scoped_dimension(
        &self,
        name: impl Into<String>,
        scope: DimensionScope,
    ) -> Dimension {
        let dimension = Dimension::with_scope(name, self, scope);
        self.insert_slot(&dimension);
        dimension
    }

    /// Add a dimension to the AND set. Registering twice is a no-op.
    pub fn register_dimension(&self, dimension: &Dimension) -> Result<(), ConfigurationError> {
        if !dimension.store().same_store(self) {
            return Err(ConfigurationError::ForeignDimension(
                dimension.name().to_string(),
            ));
        }
        self.insert_slot(dimension);
        Ok(())
    }

    fn insert_slot(&self, dimension: &Dimension) {
        let mut state = lock(&self.inner.state);
        state
            .dimensions
            .entry(dimension.id())
            .or_insert_with(|| DimensionSlot {
                name: dimension.name().to_string(),
                scope: dimension.scope(),
                predicate: None,
            });
    }

    /// Remove a dimension from the AND set. An active dimension's predicate
    /// goes with it and a recompute is scheduled.
    pub fn unregister_dimension(&self, dimension: &Dimension) -> Result<(), ConfigurationError> {
        if !dimension.store().same_store(self) {
            return Err(ConfigurationError::ForeignDimension(
                dimension.name().to_string(),
            ));
        }
        if !self.release_dimension(dimension.id()) {
            return Err(ConfigurationError::DimensionNotRegistered(
                dimension.name().to_string(),
            ));
        }
        Ok(())
    }

    /// Drop a dimension's slot. Returns true if it was registered.
    pub(crate) fn release_dimension(&self, id: DimensionId) -> bool {
        let was_active = {
            let mut state = lock(&self.inner.state);
            match state.dimensions.remove(&id) {
                None => return false,
                Some(slot) if slot.predicate.is_some() => {
                    let generation = self.inner.bump(&mut state);
                    log::debug!(
                        "Store '{}': dimension '{}' unregistered while active, generation {}",
                        self.inner.name,
                        slot.name,
                        generation
                    );
                    true
                }
                Some(_) => false,
            }
        };
        if was_active {
            self.inner.schedule();
        }
        true
    }

    pub(crate) fn is_registered(&self, id: DimensionId) -> bool {
        lock(&self.inner.state).dimensions.contains_key(&id)
    }

    pub(crate) fn predicate_of(&self, id: DimensionId) -> Option<Predicate> {
        lock(&self.inner.state)
            .dimensions
            .get(&id)
            .and_then(|slot| slot.predicate.clone())
    }

    /// Install (`Some`) or clear (`None`) a dimension's predicate. The
    /// predicate is validated against the current columns first; on error
    /// nothing changes.
    pub(crate) fn set_predicate(
        &self,
        dimension: &Dimension,
        predicate: Option<Predicate>,
    ) -> Result<(), ConfigurationError> {
        {
            let mut state = lock(&self.inner.state);
            if let Some(predicate) = &predicate {
                predicate.compile(&state.columns)?;
            }
            let slot = state.dimensions.get_mut(&dimension.id()).ok_or_else(|| {
                ConfigurationError::DimensionNotRegistered(dimension.name().to_string())
            })?;
            let kind = predicate.as_ref().map(Predicate::kind).unwrap_or("none");
            slot.predicate = predicate;

            let generation = self.inner.bump(&mut state);
            log::debug!(
                "Store '{}': dimension '{}' set to {}, generation {}",
                self.inner.name,
                dimension.name(),
                kind,
                generation
            );
        }
        self.inner.schedule();
        Ok(())
    }

    /// Wait until every generation up to the current one has settled and
    /// return the latest delivered set. Concurrent callers share the same
    /// computation.
    pub async fn get_filtered_indices(&self) -> FilteredIndices {
        let target = self.generation();
        let mut settled = self.inner.settled.subscribe();
        // The sender lives as long as `self`, so this only ends by reaching `target`
        let _ = settled.wait_for(|generation| *generation >= target).await;
        self.last_delivered()
    }

    /// Most recent delivered result, without waiting
    pub fn last_delivered(&self) -> FilteredIndices {
        lock(&self.inner.state).delivered.clone()
    }

    pub fn add_listener<F>(&self, tag: impl Into<String>, callback: F)
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.add_listener_with(tag, ListenerOptions::default(), callback)
    }

    /// Register a listener under `tag`, replacing any listener with the same tag
    pub fn add_listener_with<F>(&self, tag: impl Into<String>, options: ListenerOptions, callback: F)
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let tag = tag.into();
        let mut listeners = lock(&self.inner.listeners);
        let existing = listeners.iter().position(|(t, _)| *t == tag);
        let last_seen = existing
            .map(|i| listeners[i].1.last_seen.load(Ordering::SeqCst))
            .unwrap_or(0);
        let entry = Arc::new(ListenerEntry {
            callback: Arc::new(callback),
            options,
            last_seen: AtomicU64::new(last_seen),
        });

        match existing {
            Some(i) => listeners[i].1 = entry,
            None => listeners.push((tag, entry)),
        }
    }

    /// Returns true if a listener was registered under `tag`
    pub fn remove_listener(&self, tag: &str) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(t, _)| t != tag);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Record a highlight from `source` and notify every other listener.
    /// An empty index list clears the highlight.
    pub fn data_highlighted(
        &self,
        indices: Vec<RowIndex>,
        source: &str,
    ) -> Result<(), ConfigurationError> {
        let highlight = {
            let mut state = lock(&self.inner.state);
            let len = state.columns.len();
            if let Some(&row) = indices.iter().find(|&&row| row as usize >= len) {
                return Err(ConfigurationError::RowOutOfRange {
                    index: row as usize,
                    len,
                });
            }
            state.highlight = HighlightState {
                indices,
                source: Some(source.to_string()),
            };
            state.highlight.clone()
        };
        self.inner.dispatch(&StoreEvent::Highlighted(highlight));
        Ok(())
    }

    pub fn highlight(&self) -> HighlightState {
        lock(&self.inner.state).highlight.clone()
    }

    /// Replace the column set wholesale. Predicates that no longer validate
    /// against the new columns are cleared and the highlight is reset.
    pub fn reload(&self, columns: ColumnStore) {
        let columns = Arc::new(columns);
        let cleared_highlight = {
            let mut state = lock(&self.inner.state);
            for slot in state.dimensions.values_mut() {
                let invalid = slot
                    .predicate
                    .as_ref()
                    .and_then(|predicate| predicate.compile(&columns).err());
                if let Some(err) = invalid {
                    log::warn!(
                        "Store '{}': clearing dimension '{}' after reload: {}",
                        self.inner.name,
                        slot.name,
                        err
                    );
                    slot.predicate = None;
                }
            }
            state.columns = columns;
            let had_highlight = !state.highlight.is_empty();
            state.highlight = HighlightState::default();

            let generation = self.inner.bump(&mut state);
            log::info!(
                "Store '{}' reloaded with {} rows, generation {}",
                self.inner.name,
                state.columns.len(),
                generation
            );
            had_highlight
        };

        if cleared_highlight {
            self.inner
                .dispatch(&StoreEvent::Highlighted(HighlightState::default()));
        }
        self.inner.schedule();
    }
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        write!(
            f,
            "DataStore {{ name: '{}', rows: {}, dimensions: {}, generation: {} }}",
            self.inner.name,
            state.columns.len(),
            state.dimensions.len(),
            state.generation
        )
    }
}

impl StoreInner {
    fn bump(&self, state: &mut StoreState) -> Generation {
        state.generation += 1;
        self.latest.store(state.generation, Ordering::SeqCst);
        state.generation
    }

    fn schedule(&self) {
        match self.runtime {
            Some(_) => self.wake.notify_one(),
            None => self.recompute_inline(),
        }
    }

    fn next_job(&self) -> Option<Job> {
        let state = lock(&self.state);
        if *self.settled.borrow() >= state.generation {
            return None;
        }
        Some(Job {
            generation: state.generation,
            columns: state.columns.clone(),
            predicates: state
                .dimensions
                .values()
                .filter_map(|slot| {
                    slot.predicate
                        .clone()
                        .map(|p| (slot.name.clone(), slot.scope, p))
                })
                .collect(),
        })
    }

    async fn recompute(&self) {
        while let Some(job) = self.next_job() {
            let generation = job.generation;
            let columns = job.columns.clone();
            let latest = self.latest.clone();

            let outcome = match tokio::task::spawn_blocking(move || evaluate(&job, &latest)).await
            {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => Outcome::Failed(ComputeError::Aborted(
                    panic_message(err.into_panic().as_ref()),
                )),
                Err(err) => Outcome::Failed(ComputeError::Aborted(err.to_string())),
            };
            self.finish(generation, columns, outcome);
        }
    }

    fn recompute_inline(&self) {
        while let Some(job) = self.next_job() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| evaluate(&job, &self.latest)))
                .unwrap_or_else(|payload| {
                    Outcome::Failed(ComputeError::Aborted(panic_message(payload.as_ref())))
                });
            self.finish(job.generation, job.columns, outcome);
        }
    }

    /// Deliver an evaluation if it is still current, then mark its
    /// generation settled
    fn finish(&self, generation: Generation, columns: Arc<ColumnStore>, outcome: Outcome) {
        let event = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                log::debug!(
                    "Store '{}': dropping generation {}, superseded by {}",
                    self.name,
                    generation,
                    state.generation
                );
                return;
            }
            match outcome {
                Outcome::Superseded => return,
                Outcome::Done { indices, local } => {
                    let delivered = FilteredIndices::new(generation, indices, local, columns);
                    state.delivered = delivered.clone();
                    StoreEvent::Filtered(delivered)
                }
                Outcome::Failed(err) => {
                    log::warn!(
                        "Store '{}': generation {} failed, keeping generation {}: {}",
                        self.name,
                        generation,
                        state.delivered.generation(),
                        err
                    );
                    StoreEvent::ComputeFailed {
                        generation,
                        message: err.to_string(),
                    }
                }
            }
        };

        self.dispatch(&event);
        self.settled.send_modify(|settled| {
            if *settled < generation {
                *settled = generation;
            }
        });
    }

    fn dispatch(&self, event: &StoreEvent) {
        let listeners: Vec<(String, Arc<ListenerEntry>)> = lock(&self.listeners).clone();

        for (tag, entry) in listeners {
            let deliver = match event {
                StoreEvent::Filtered(filtered) => {
                    entry
                        .last_seen
                        .fetch_max(filtered.generation(), Ordering::SeqCst)
                        < filtered.generation()
                }
                StoreEvent::Highlighted(highlight) => {
                    highlight.source.as_deref() != Some(tag.as_str())
                }
                StoreEvent::ComputeFailed { .. } => entry.options.report_errors,
            };
            if deliver {
                (entry.callback)(event);
            }
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Lets the driver observe that the store is gone
        self.wake.notify_one();
    }
}

async fn drive(store: Weak<StoreInner>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let Some(inner) = store.upgrade() else {
            break;
        };
        inner.recompute().await;
    }
    log::debug!("Recompute driver stopped");
}

/// Evaluate the conjunction of a job's predicates over every row
fn evaluate(job: &Job, latest: &AtomicU64) -> Outcome {
    let mut compiled: Vec<(&str, DimensionScope, CompiledPredicate<'_>)> =
        Vec::with_capacity(job.predicates.len());
    for (name, scope, predicate) in &job.predicates {
        match predicate.compile(&job.columns) {
            Ok(c) => compiled.push((name.as_str(), *scope, c)),
            Err(err) => {
                return Outcome::Failed(ComputeError::Aborted(format!(
                    "dimension '{}': {}",
                    name, err
                )))
            }
        }
    }

    let has_mirror = compiled
        .iter()
        .any(|(_, scope, _)| *scope == DimensionScope::Mirror);
    let mut local = Vec::new();
    let mut all = Vec::new();

    for row in 0..job.columns.len() {
        if row % STALE_CHECK_INTERVAL == 0 && latest.load(Ordering::SeqCst) > job.generation {
            return Outcome::Superseded;
        }

        let mut local_ok = true;
        let mut mirror_ok = true;
        for (name, scope, predicate) in &compiled {
            let flag = match scope {
                DimensionScope::Local => &mut local_ok,
                DimensionScope::Mirror => &mut mirror_ok,
            };
            if !*flag {
                continue;
            }
            match predicate.accepts(row) {
                Ok(accepted) => *flag = accepted,
                Err(message) => {
                    return Outcome::Failed(ComputeError::PredicateFailed {
                        dimension: name.to_string(),
                        row,
                        message,
                    })
                }
            }
            if !local_ok {
                break;
            }
        }

        if local_ok {
            local.push(row as RowIndex);
            if has_mirror && mirror_ok {
                all.push(row as RowIndex);
            }
        }
    }

    let local: Arc<[RowIndex]> = local.into();
    let indices = if has_mirror { all.into() } else { local.clone() };
    Outcome::Done { indices, local }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("predicate panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("predicate panicked: {}", message)
    } else {
        "predicate panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    fn columns() -> ColumnStore {
        ColumnStore::new(
            "cells",
            6,
            vec![
                Column::float64("x", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
                Column::categorical("group", ["A", "B", "A", "B", "A", "B"]),
            ],
        )
        .unwrap()
    }

    type Recorded = Arc<Mutex<Vec<StoreEvent>>>;

    fn record(store: &DataStore, tag: &str, options: ListenerOptions) -> Recorded {
        let events: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store.add_listener_with(tag, options, move |event| {
            sink.lock().unwrap().push(event.clone())
        });
        events
    }

    fn filtered_generations(events: &Recorded) -> Vec<Generation> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Filtered(f) => Some(f.generation()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_no_predicates_is_identity() {
        let store = DataStore::new(columns());
        let delivered = store.last_delivered();

        assert_eq!(&delivered.indices()[..], &[0, 1, 2, 3, 4, 5]);
        assert_eq!(delivered.generation(), 0);
        assert_eq!(store.name(), "cells");
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_inline_conjunction() {
        let store = DataStore::new(columns());
        let x = store.add_dimension("x");
        let group = store.add_dimension("group");

        x.filter(Predicate::range("x", 1.0, 4.0)).unwrap();
        group.filter(Predicate::category("group", "A")).unwrap();

        let delivered = store.last_delivered();
        assert_eq!(&delivered.indices()[..], &[2, 4]);
        assert_eq!(delivered.generation(), 2);
    }

    #[tokio::test]
    async fn test_get_filtered_indices_waits_for_recompute() {
        let store = DataStore::new(columns());
        let x = store.add_dimension("x");

        x.filter(Predicate::range("x", 3.0, 10.0)).unwrap();
        // Nothing has run yet on the current-thread runtime
        assert_eq!(store.last_delivered().generation(), 0);

        let delivered = store.get_filtered_indices().await;
        assert_eq!(&delivered.indices()[..], &[3, 4, 5]);
        assert_eq!(delivered.generation(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_result() {
        let store = DataStore::new(columns());
        let x = store.add_dimension("x");
        x.filter(Predicate::range("x", 0.0, 1.0)).unwrap();

        let (a, b) = tokio::join!(store.get_filtered_indices(), store.get_filtered_indices());
        assert_eq!(a.generation(), b.generation());
        assert!(Arc::ptr_eq(a.indices(), b.indices()));
    }

    #[tokio::test]
    async fn test_remove_filter_on_clear_dimension_notifies_once() {
        let store = DataStore::new(columns());
        let events = record(&store, "view", ListenerOptions::default());
        let x = store.add_dimension("x");

        x.remove_filter().unwrap();
        let delivered = store.get_filtered_indices().await;

        assert_eq!(delivered.len(), 6);
        assert_eq!(filtered_generations(&events), vec![1]);
    }

    #[tokio::test]
    async fn test_mutations_before_wake_coalesce() {
        let store = DataStore::new(columns());
        let events = record(&store, "view", ListenerOptions::default());
        let x = store.add_dimension("x");

        x.filter(Predicate::range("x", 0.0, 1.0)).unwrap();
        x.filter(Predicate::range("x", 4.0, 5.0)).unwrap();
        let delivered = store.get_filtered_indices().await;

        assert_eq!(&delivered.indices()[..], &[4, 5]);
        assert_eq!(filtered_generations(&events), vec![2]);
    }

    #[tokio::test]
    async fn test_superseded_computation_is_never_delivered() {
        let store = DataStore::new(columns());
        let events = record(&store, "view", ListenerOptions::default());

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);
        let blocked = AtomicBool::new(false);

        let slow = store.add_dimension("slow");
        slow.filter(Predicate::custom("slow", vec![], move |_, row| {
            if row == 0 && !blocked.swap(true, Ordering::SeqCst) {
                started_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            Ok(true)
        }))
        .unwrap();

        // Wait until generation 1 is being evaluated on the blocking pool
        tokio::task::spawn_blocking(move || started_rx.recv().unwrap())
            .await
            .unwrap();

        let x = store.add_dimension("x");
        x.filter(Predicate::range("x", 2.0, 3.0)).unwrap();
        release_tx.send(()).unwrap();

        let delivered = store.get_filtered_indices().await;
        assert_eq!(delivered.generation(), 2);
        assert_eq!(&delivered.indices()[..], &[2, 3]);
        assert_eq!(filtered_generations(&events), vec![2]);
    }

    #[tokio::test]
    async fn test_generations_non_decreasing() {
        let store = DataStore::new(columns());
        let events = record(&store, "view", ListenerOptions::default());
        let x = store.add_dimension("x");
        let group = store.add_dimension("group");

        for i in 0..30 {
            let lo = (i % 6) as f64;
            x.filter(Predicate::range("x", lo, lo + 2.0)).unwrap();
            if i % 3 == 0 {
                group.filter(Predicate::category("group", "A")).unwrap();
            }
            if i % 4 == 0 {
                group.remove_filter().unwrap();
            }
            if i % 5 == 0 {
                tokio::task::yield_now().await;
            }
        }
        let delivered = store.get_filtered_indices().await;
        let seen = filtered_generations(&events);

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(store.generation()));
        assert_eq!(delivered.generation(), store.generation());
    }

    #[tokio::test]
    async fn test_failure_keeps_last_valid_set() {
        let store = DataStore::new(columns());
        let plain = record(&store, "plain", ListenerOptions::default());
        let reporting = record(&store, "reporting", ListenerOptions { report_errors: true });

        let x = store.add_dimension("x");
        x.filter(Predicate::range("x", 0.0, 2.0)).unwrap();
        let good = store.get_filtered_indices().await;
        assert_eq!(&good.indices()[..], &[0, 1, 2]);

        let broken = store.add_dimension("broken");
        broken
            .filter(Predicate::custom("broken", vec![], |_, row| {
                if row == 1 {
                    Err("corrupt cell".to_string())
                } else {
                    Ok(true)
                }
            }))
            .unwrap();
        let after = store.get_filtered_indices().await;

        assert_eq!(after.generation(), good.generation());
        assert_eq!(&after.indices()[..], &[0, 1, 2]);

        let failures: Vec<_> = reporting
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::ComputeFailed { generation, message } => {
                    Some((*generation, message.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 2);
        assert!(failures[0].1.contains("corrupt cell"));
        assert!(plain
            .lock()
            .unwrap()
            .iter()
            .all(|e| matches!(e, StoreEvent::Filtered(_))));
    }

    #[tokio::test]
    async fn test_panicking_predicate_is_a_compute_failure() {
        let store = DataStore::new(columns());
        let reporting = record(&store, "reporting", ListenerOptions { report_errors: true });

        let bad = store.add_dimension("bad");
        bad.filter(Predicate::custom("bad", vec![], |_, _| panic!("boom")))
            .unwrap();
        let delivered = store.get_filtered_indices().await;

        assert_eq!(delivered.generation(), 0);
        assert_eq!(delivered.len(), 6);
        assert!(matches!(
            reporting.lock().unwrap().as_slice(),
            [StoreEvent::ComputeFailed { generation: 1, .. }]
        ));
    }

    #[test]
    fn test_listeners_are_keyed() {
        let store = DataStore::new(columns());
        let first = record(&store, "view", ListenerOptions::default());
        let second = record(&store, "view", ListenerOptions::default());
        assert_eq!(store.listener_count(), 1);

        let x = store.add_dimension("x");
        x.filter(Predicate::range("x", 0.0, 0.0)).unwrap();

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(filtered_generations(&second), vec![1]);

        assert!(store.remove_listener("view"));
        assert!(!store.remove_listener("view"));
    }

    #[test]
    fn test_highlight_skips_source() {
        let store = DataStore::new(columns());
        let a = record(&store, "a", ListenerOptions::default());
        let b = record(&store, "b", ListenerOptions::default());

        store.data_highlighted(vec![3], "a").unwrap();

        assert!(a.lock().unwrap().is_empty());
        let b = b.lock().unwrap();
        assert!(matches!(
            b.as_slice(),
            [StoreEvent::Highlighted(h)] if h.indices == vec![3] && h.source.as_deref() == Some("a")
        ));
        assert_eq!(store.highlight().indices, vec![3]);
    }

    #[test]
    fn test_highlight_out_of_range() {
        let store = DataStore::new(columns());
        assert_eq!(
            store.data_highlighted(vec![6], "a"),
            Err(ConfigurationError::RowOutOfRange { index: 6, len: 6 })
        );
        assert!(store.highlight().is_empty());
    }

    #[test]
    fn test_unregister_active_dimension_recomputes() {
        let store = DataStore::new(columns());
        let x = Dimension::new("x", &store);
        store.register_dimension(&x).unwrap();
        x.filter(Predicate::range("x", 0.0, 1.0)).unwrap();
        assert_eq!(store.last_delivered().len(), 2);

        store.unregister_dimension(&x).unwrap();
        assert_eq!(store.last_delivered().len(), 6);
        assert_eq!(store.generation(), 2);
        assert!(matches!(
            store.unregister_dimension(&x),
            Err(ConfigurationError::DimensionNotRegistered(_))
        ));
    }

    #[test]
    fn test_foreign_dimension_rejected() {
        let a = DataStore::new(columns());
        let b = DataStore::new(columns());
        let dim = Dimension::new("x", &a);

        assert_eq!(
            b.register_dimension(&dim),
            Err(ConfigurationError::ForeignDimension("x".to_string()))
        );
    }

    #[test]
    fn test_mirror_dimension_excluded_from_local() {
        let store = DataStore::new(columns());
        let x = store.add_dimension("x");
        let mirror = store.add_scoped_dimension("peer", DimensionScope::Mirror);

        x.filter(Predicate::range("x", 1.0, 4.0)).unwrap();
        mirror.filter(Predicate::indices([0, 1, 2])).unwrap();

        let delivered = store.last_delivered();
        assert_eq!(&delivered.indices()[..], &[1, 2]);
        assert_eq!(&delivered.local_indices()[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_reload_clears_invalid_predicates() {
        let store = DataStore::new(columns());
        let x = store.add_dimension("x");
        let group = store.add_dimension("group");
        x.filter(Predicate::range("x", 0.0, 1.0)).unwrap();
        group.filter(Predicate::category("group", "A")).unwrap();
        store.data_highlighted(vec![0], "view").unwrap();

        store.reload(
            ColumnStore::new(
                "cells",
                3,
                vec![Column::categorical("group", ["A", "A", "B"])],
            )
            .unwrap(),
        );

        assert!(!x.is_active());
        assert!(group.is_active());
        assert!(store.highlight().is_empty());
        assert_eq!(store.len(), 3);
        assert_eq!(&store.last_delivered().indices()[..], &[0, 1]);
    }
}
