/// LiveFilter Dimension
///
/// A Dimension is one filtering axis of a DataStore. It holds zero or one
/// active predicate; the store combines the predicates of all registered
/// dimensions by logical AND.
///
/// The predicate itself lives in the store's registry, so a Dimension is a
/// lightweight handle: setting or clearing it bumps the store generation and
/// schedules a recompute, and dropping it unregisters it.
///
/// # Examples
///
/// ```
/// use livefilter::{Column, ColumnStore, DataStore, Predicate};
///
/// let store = DataStore::new(
///     ColumnStore::new("points", 3, vec![Column::float64("x", vec![1.0, 2.0, 3.0])]).unwrap(),
/// );
/// let dim = store.add_dimension("x-range");
///
/// dim.filter(Predicate::range("x", 1.5, 3.0)).unwrap();
/// assert!(dim.is_active());
///
/// // Unknown columns are rejected and leave the dimension as it was
/// assert!(dim.filter(Predicate::range("y", 0.0, 1.0)).is_err());
/// assert!(dim.is_active());
///
/// dim.remove_filter().unwrap();
/// assert!(!dim.is_active());
/// ```

use crate::datastore::DataStore;
use crate::error::ConfigurationError;
use crate::predicate::Predicate;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DIMENSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique dimension identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DimensionId(u64);

impl DimensionId {
    fn next() -> Self {
        DimensionId(NEXT_DIMENSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dim-{}", self.0)
    }
}

/// Who owns a dimension's predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionScope {
    /// Set by a local view
    Local,
    /// Carries a peer session's filter; excluded from the local result
    Mirror,
}

pub struct Dimension {
    id: DimensionId,
    name: String,
    scope: DimensionScope,
    store: DataStore,
}

impl Dimension {
    /// Create an unregistered local dimension bound to `store`.
    /// Call `DataStore::register_dimension` before filtering.
    pub fn new(name: impl Into<String>, store: &DataStore) -> Self {
        Self::with_scope(name, store, DimensionScope::Local)
    }

    pub(crate) fn with_scope(
        name: impl Into<String>,
        store: &DataStore,
        scope: DimensionScope,
    ) -> Self {
        Dimension {
            id: DimensionId::next(),
            name: name.into(),
            scope,
            store: store.clone(),
        }
    }

    pub fn id(&self) -> DimensionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> DimensionScope {
        self.scope
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Install or replace the predicate. Returns before the recompute runs.
    pub fn filter(&self, predicate: Predicate) -> Result<(), ConfigurationError> {
        self.store.set_predicate(self, Some(predicate))
    }

    /// Clear the predicate. Always schedules a recompute, even when nothing
    /// was set.
    pub fn remove_filter(&self) -> Result<(), ConfigurationError> {
        self.store.set_predicate(self, None)
    }

    pub fn predicate(&self) -> Option<Predicate> {
        self.store.predicate_of(self.id)
    }

    pub fn is_active(&self) -> bool {
        self.predicate().is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.store.is_registered(self.id)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dimension {{ id: {}, name: '{}', scope: {:?} }}",
            self.id, self.name, self.scope
        )
    }
}

impl Drop for Dimension {
    fn drop(&mut self) {
        self.store.release_dimension(self.id);
    }
}
