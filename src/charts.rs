/// Chart registry with highlight and pop-out routing
///
/// The ChartManager knows every live view (chart) of a session, which data
/// source each chart reads, and where each chart is currently displayed.
///
/// Highlights are routed through the chart's DataStore with the chart id as
/// the source, so every other view on that store is notified and the
/// originating chart is not.
///
/// # Pop-out state machine
///
/// ```text
///   Local --begin_pop_out--> Pending --ack--> Confirmed
///     ^                        |                  |
///     +---- fail / timeout ----+-- restore_local -+
/// ```
///
/// A failed or timed-out pop-out always returns the chart to `Local`, so a
/// chart is never left without a place to render.

use crate::datastore::{lock, DataStore};
use crate::error::{ConfigurationError, RoutingError};
use crate::event::{RowIndex, StoreEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Where a chart is displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopoutState {
    /// Rendered in this session
    Local,
    /// Pop-out requested, waiting for the destination
    Pending,
    /// Pop-out acknowledged; the chart lives in the pop-out destination
    Confirmed,
}

/// How a pending pop-out ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopoutOutcome {
    Acknowledged,
    Rejected,
    TimedOut,
    Disconnected,
}

struct ChartEntry {
    data_source: String,
    state: PopoutState,
    waiter: Option<oneshot::Sender<PopoutOutcome>>,
}

#[derive(Default)]
struct Registry {
    sources: BTreeMap<String, DataStore>,
    charts: HashMap<String, ChartEntry>,
}

/// Cheaply cloneable handle to a session's chart registry
#[derive(Clone, Default)]
pub struct ChartManager {
    registry: Arc<Mutex<Registry>>,
}

impl ChartManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data source under its store name
    pub fn add_data_source(&self, store: DataStore) -> Result<(), ConfigurationError> {
        let mut registry = lock(&self.registry);
        if registry.sources.contains_key(store.name()) {
            return Err(ConfigurationError::DuplicateDataSource(
                store.name().to_string(),
            ));
        }
        registry.sources.insert(store.name().to_string(), store);
        Ok(())
    }

    pub fn data_source(&self, name: &str) -> Option<DataStore> {
        lock(&self.registry).sources.get(name).cloned()
    }

    /// All data sources, ordered by name
    pub fn data_sources(&self) -> Vec<DataStore> {
        lock(&self.registry).sources.values().cloned().collect()
    }

    /// Register a chart on a data source. `on_event` receives the store's
    /// events except highlights the chart itself originated.
    pub fn add_chart<F>(
        &self,
        chart_id: impl Into<String>,
        data_source: &str,
        on_event: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let chart_id = chart_id.into();
        let store = {
            let mut registry = lock(&self.registry);
            if registry.charts.contains_key(&chart_id) {
                return Err(ConfigurationError::DuplicateChart(chart_id));
            }
            let store = registry
                .sources
                .get(data_source)
                .cloned()
                .ok_or_else(|| ConfigurationError::DataSourceNotFound(data_source.to_string()))?;
            registry.charts.insert(
                chart_id.clone(),
                ChartEntry {
                    data_source: data_source.to_string(),
                    state: PopoutState::Local,
                    waiter: None,
                },
            );
            store
        };

        store.add_listener(chart_id.clone(), on_event);
        log::debug!("Chart '{}' added on '{}'", chart_id, data_source);
        Ok(())
    }

    pub fn remove_chart(&self, chart_id: &str) -> Result<(), ConfigurationError> {
        let store = {
            let mut registry = lock(&self.registry);
            let entry = registry
                .charts
                .remove(chart_id)
                .ok_or_else(|| ConfigurationError::ChartNotFound(chart_id.to_string()))?;
            registry.sources.get(&entry.data_source).cloned()
        };
        if let Some(store) = store {
            store.remove_listener(chart_id);
        }
        Ok(())
    }

    /// Route a highlight from `chart_id` to every other view on its store
    pub fn data_highlighted(
        &self,
        chart_id: &str,
        indices: Vec<RowIndex>,
    ) -> Result<(), ConfigurationError> {
        let store = self.store_of(chart_id)?;
        store.data_highlighted(indices, chart_id)
    }

    fn store_of(&self, chart_id: &str) -> Result<DataStore, ConfigurationError> {
        let registry = lock(&self.registry);
        let entry = registry
            .charts
            .get(chart_id)
            .ok_or_else(|| ConfigurationError::ChartNotFound(chart_id.to_string()))?;
        registry
            .sources
            .get(&entry.data_source)
            .cloned()
            .ok_or_else(|| ConfigurationError::DataSourceNotFound(entry.data_source.clone()))
    }

    /// Local -> Pending. The receiver yields the outcome once the pop-out
    /// is acknowledged, rejected or abandoned.
    pub fn begin_pop_out(
        &self,
        chart_id: &str,
    ) -> Result<oneshot::Receiver<PopoutOutcome>, RoutingError> {
        let mut registry = lock(&self.registry);
        let entry = registry
            .charts
            .get_mut(chart_id)
            .ok_or_else(|| RoutingError::UnknownChart(chart_id.to_string()))?;
        if entry.state != PopoutState::Local {
            return Err(RoutingError::AlreadyPoppedOut(chart_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        entry.state = PopoutState::Pending;
        entry.waiter = Some(tx);
        Ok(rx)
    }

    /// Settle a pending pop-out. Returns false (and changes nothing) unless
    /// the chart is Pending, so repeated or late responses are ignored.
    pub fn resolve_pop_out(&self, chart_id: &str, outcome: PopoutOutcome) -> bool {
        let waiter = {
            let mut registry = lock(&self.registry);
            let Some(entry) = registry.charts.get_mut(chart_id) else {
                return false;
            };
            if entry.state != PopoutState::Pending {
                return false;
            }
            entry.state = match outcome {
                PopoutOutcome::Acknowledged => PopoutState::Confirmed,
                _ => PopoutState::Local,
            };
            entry.waiter.take()
        };

        log::debug!("Pop-out of '{}' resolved: {:?}", chart_id, outcome);
        if let Some(waiter) = waiter {
            // The requester may have stopped waiting
            let _ = waiter.send(outcome);
        }
        true
    }

    /// Return a chart to Local from any state
    pub fn restore_local(&self, chart_id: &str) -> Result<(), RoutingError> {
        let mut registry = lock(&self.registry);
        let entry = registry
            .charts
            .get_mut(chart_id)
            .ok_or_else(|| RoutingError::UnknownChart(chart_id.to_string()))?;
        entry.state = PopoutState::Local;
        entry.waiter = None;
        Ok(())
    }

    /// Handle an inbound pop-out request. An owned chart that is Local
    /// becomes Confirmed and true is returned. Unknown charts and charts
    /// already pending or popped out are refused without a state change.
    pub fn accept_remote_pop_out(&self, chart_id: &str) -> bool {
        let mut registry = lock(&self.registry);
        match registry.charts.get_mut(chart_id) {
            Some(entry) if entry.state == PopoutState::Local => {
                entry.state = PopoutState::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// Fail every pending pop-out, returning the affected chart ids
    pub fn fail_all_pending(&self, outcome: PopoutOutcome) -> Vec<String> {
        let pending: Vec<String> = lock(&self.registry)
            .charts
            .iter()
            .filter(|(_, entry)| entry.state == PopoutState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        pending
            .into_iter()
            .filter(|id| self.resolve_pop_out(id, outcome))
            .collect()
    }

    /// Wait for a pop-out begun with `begin_pop_out`. A timeout restores the
    /// chart locally.
    pub async fn await_pop_out(
        &self,
        chart_id: &str,
        outcome: oneshot::Receiver<PopoutOutcome>,
        timeout: Duration,
    ) -> Result<(), RoutingError> {
        let mut outcome = outcome;
        let result = match tokio::time::timeout(timeout, &mut outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PopoutOutcome::Disconnected,
            Err(_) => {
                if self.resolve_pop_out(chart_id, PopoutOutcome::TimedOut) {
                    log::warn!(
                        "Pop-out of '{}' timed out after {:?}, restored locally",
                        chart_id,
                        timeout
                    );
                    PopoutOutcome::TimedOut
                } else {
                    // A response settled it just as the timer fired
                    outcome.try_recv().unwrap_or(PopoutOutcome::TimedOut)
                }
            }
        };

        match result {
            PopoutOutcome::Acknowledged => Ok(()),
            PopoutOutcome::Rejected => Err(RoutingError::Rejected(chart_id.to_string())),
            PopoutOutcome::TimedOut => Err(RoutingError::Timeout {
                chart_id: chart_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            PopoutOutcome::Disconnected => {
                let _ = self.restore_local(chart_id);
                Err(RoutingError::Disconnected(chart_id.to_string()))
            }
        }
    }

    pub fn chart_state(&self, chart_id: &str) -> Option<PopoutState> {
        lock(&self.registry).charts.get(chart_id).map(|e| e.state)
    }

    pub fn chart_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.registry).charts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).charts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ChartManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.registry);
        write!(
            f,
            "ChartManager {{ sources: {}, charts: {} }}",
            registry.sources.len(),
            registry.charts.len()
        )
    }
}
