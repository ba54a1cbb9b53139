/// LiveFilter DataModel
///
/// A DataModel is one view's projection of a DataStore: a selected column
/// subset, an optional sort key, and the ordered row indices derived from the
/// store's most recently delivered filtered set.
///
/// The model never reads an in-flight computation. It re-projects either on
/// every delivery (`autoupdate`) or when its owner calls `update_model()`,
/// and in both cases starts from `DataStore::last_delivered()`. Sorting
/// produces the model's own sequence; the shared delivered sequence is never
/// reordered in place.
///
/// # Examples
///
/// ```
/// use livefilter::{Column, ColumnStore, DataModel, DataStore, ModelOptions, Predicate, SortOrder};
///
/// let store = DataStore::new(
///     ColumnStore::new(
///         "scores",
///         4,
///         vec![Column::int32("score", vec![85, 92, 70, 99])],
///     )
///     .unwrap(),
/// );
/// let model = DataModel::new(&store, ModelOptions::default());
/// model.sort("score", SortOrder::Descending).unwrap();
///
/// let dim = store.add_dimension("score");
/// dim.filter(Predicate::range("score", 80.0, 100.0)).unwrap();
///
/// assert_eq!(&model.data()[..], &[3, 1, 0]);
/// ```

use crate::column::{Column, ColumnValue};
use crate::datastore::{lock, DataStore};
use crate::error::ConfigurationError;
use crate::event::{FilteredIndices, Generation, RowIndex, StoreEvent};
use crate::store::ColumnStore;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Sort order specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending order (smallest first)
    Ascending,
    /// Descending order (largest first)
    Descending,
}

/// A sort key specifying a column and order
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Column name to sort by
    pub column: String,
    /// Sort order (ascending or descending)
    pub order: SortOrder,
    /// Whether missing values should be placed first or last
    pub nulls_first: bool,
}

impl SortKey {
    /// Create a new sort key with ascending order (nulls last)
    pub fn ascending(column: impl Into<String>) -> Self {
        SortKey::new(column, SortOrder::Ascending, false)
    }

    /// Create a new sort key with descending order (nulls last)
    pub fn descending(column: impl Into<String>) -> Self {
        SortKey::new(column, SortOrder::Descending, false)
    }

    pub fn new(column: impl Into<String>, order: SortOrder, nulls_first: bool) -> Self {
        SortKey {
            column: column.into(),
            order,
            nulls_first,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Re-project on every store delivery
    pub autoupdate: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions { autoupdate: true }
    }
}

/// Passed to model listeners after each re-projection
#[derive(Debug, Clone)]
pub struct ModelUpdate {
    pub generation: Generation,
    pub data: Arc<[RowIndex]>,
}

type ModelCallback = dyn Fn(&ModelUpdate) + Send + Sync;

struct Projection {
    columns: Vec<String>,
    sort: Option<SortKey>,
    data: Arc<[RowIndex]>,
    generation: Generation,
    source: Arc<ColumnStore>,
}

struct ModelShared {
    projection: Mutex<Projection>,
    listeners: Mutex<Vec<(String, Arc<ModelCallback>)>>,
}

impl ModelShared {
    /// Re-project from a delivery. Deliveries older than the current
    /// projection are ignored.
    fn project(&self, delivered: &FilteredIndices) {
        let update = {
            let mut projection = lock(&self.projection);
            if delivered.generation() < projection.generation {
                return;
            }
            let data = sort_rows(delivered, projection.sort.as_ref());
            projection.data = data.clone();
            projection.generation = delivered.generation();
            projection.source = delivered.columns().clone();
            ModelUpdate {
                generation: delivered.generation(),
                data,
            }
        };

        let listeners: Vec<Arc<ModelCallback>> = lock(&self.listeners)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in listeners {
            callback(&update);
        }
    }
}

pub struct DataModel {
    id: String,
    store: DataStore,
    shared: Arc<ModelShared>,
    autoupdate: bool,
}

impl DataModel {
    /// Create a model selecting every column, unsorted, projected from the
    /// store's last delivery
    pub fn new(store: &DataStore, options: ModelOptions) -> Self {
        let id = format!("model:{}", Uuid::new_v4());
        let delivered = store.last_delivered();
        let shared = Arc::new(ModelShared {
            projection: Mutex::new(Projection {
                columns: delivered
                    .columns()
                    .column_names()
                    .into_iter()
                    .map(String::from)
                    .collect(),
                sort: None,
                data: delivered.indices().clone(),
                generation: delivered.generation(),
                source: delivered.columns().clone(),
            }),
            listeners: Mutex::new(Vec::new()),
        });

        if options.autoupdate {
            let weak: Weak<ModelShared> = Arc::downgrade(&shared);
            store.add_listener(id.clone(), move |event| {
                if let (StoreEvent::Filtered(filtered), Some(shared)) = (event, weak.upgrade()) {
                    shared.project(filtered);
                }
            });
        }

        DataModel {
            id,
            store: store.clone(),
            shared,
            autoupdate: options.autoupdate,
        }
    }

    /// Listener tag this model uses on its store
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Select the columns this view reads
    pub fn set_columns<I, S>(&self, names: I) -> Result<(), ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let columns = self.store.columns();
        if let Some(missing) = names.iter().find(|name| !columns.has_column(name)) {
            return Err(ConfigurationError::ColumnNotFound(missing.clone()));
        }
        lock(&self.shared.projection).columns = names;
        Ok(())
    }

    pub fn columns(&self) -> Vec<String> {
        lock(&self.shared.projection).columns.clone()
    }

    /// Sort by one column and re-project
    pub fn sort(&self, column: &str, order: SortOrder) -> Result<(), ConfigurationError> {
        self.sort_by(SortKey::new(column, order, false))
    }

    pub fn sort_by(&self, key: SortKey) -> Result<(), ConfigurationError> {
        self.store.columns().get_column(&key.column)?;
        lock(&self.shared.projection).sort = Some(key);
        self.update_model();
        Ok(())
    }

    /// Revert to ascending row order
    pub fn clear_sort(&self) {
        lock(&self.shared.projection).sort = None;
        self.update_model();
    }

    pub fn sort_key(&self) -> Option<SortKey> {
        lock(&self.shared.projection).sort.clone()
    }

    /// Re-project against the store's last delivered set. Does not wait for
    /// a pending computation.
    pub fn update_model(&self) {
        self.shared.project(&self.store.last_delivered());
    }

    /// Row indices in view order
    pub fn data(&self) -> Arc<[RowIndex]> {
        lock(&self.shared.projection).data.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.projection).data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation of the delivery the current data was projected from
    pub fn generation(&self) -> Generation {
        lock(&self.shared.projection).generation
    }

    /// Value of a selected column for the row at a view position
    pub fn get_value(&self, position: usize, column: &str) -> Result<ColumnValue, ConfigurationError> {
        let projection = lock(&self.shared.projection);
        if !projection.columns.iter().any(|c| c == column) {
            return Err(ConfigurationError::ColumnNotFound(column.to_string()));
        }
        let row = projection
            .data
            .get(position)
            .ok_or(ConfigurationError::RowOutOfRange {
                index: position,
                len: projection.data.len(),
            })?;
        projection.source.get_value(*row as usize, column)
    }

    /// Register a callback fired after every re-projection, replacing any
    /// callback with the same tag
    pub fn add_listener<F>(&self, tag: impl Into<String>, callback: F)
    where
        F: Fn(&ModelUpdate) + Send + Sync + 'static,
    {
        let tag = tag.into();
        let callback: Arc<ModelCallback> = Arc::new(callback);
        let mut listeners = lock(&self.shared.listeners);
        match listeners.iter_mut().find(|(t, _)| *t == tag) {
            Some(entry) => entry.1 = callback,
            None => listeners.push((tag, callback)),
        }
    }

    pub fn remove_listener(&self, tag: &str) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(t, _)| t != tag);
        listeners.len() != before
    }
}

impl Drop for DataModel {
    fn drop(&mut self) {
        if self.autoupdate {
            self.store.remove_listener(&self.id);
        }
    }
}

impl std::fmt::Debug for DataModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let projection = lock(&self.shared.projection);
        write!(
            f,
            "DataModel {{ id: '{}', rows: {}, sort: {:?} }}",
            self.id,
            projection.data.len(),
            projection.sort
        )
    }
}

/// Order a delivery's rows by a sort key. Stable: ties keep ascending row order.
fn sort_rows(delivered: &FilteredIndices, key: Option<&SortKey>) -> Arc<[RowIndex]> {
    let Some(key) = key else {
        return delivered.indices().clone();
    };
    let column = match delivered.columns().get_column(&key.column) {
        Ok(column) => column,
        Err(err) => {
            log::warn!("Ignoring sort on reloaded data: {}", err);
            return delivered.indices().clone();
        }
    };

    let mut keyed: Vec<(RowIndex, Option<ColumnValue>)> = delivered
        .indices()
        .iter()
        .map(|&row| (row, sort_value(column, row)))
        .collect();
    keyed.sort_by(|(row_a, a), (row_b, b)| compare_values(a, b, key).then(row_a.cmp(row_b)));
    keyed.into_iter().map(|(row, _)| row).collect()
}

fn sort_value(column: &Column, row: RowIndex) -> Option<ColumnValue> {
    column.get(row as usize).ok().filter(|v| !v.is_null())
}

/// Compare two column values according to a sort key
fn compare_values(val_a: &Option<ColumnValue>, val_b: &Option<ColumnValue>, key: &SortKey) -> Ordering {
    let (a, b) = match (val_a, val_b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => {
            return if key.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        (Some(_), None) => {
            return if key.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        (Some(a), Some(b)) => (a, b),
    };

    let base_cmp = match (a, b) {
        (ColumnValue::Int32(a), ColumnValue::Int32(b)) => a.cmp(b),
        (ColumnValue::Float32(a), ColumnValue::Float32(b)) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Float64(a), ColumnValue::Float64(b)) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Category(a), ColumnValue::Category(b)) => a.cmp(b),
        (ColumnValue::Bool(a), ColumnValue::Bool(b)) => a.cmp(b),
        // Mixed types - compare by debug text for deterministic ordering
        (a, b) => format!("{:?}", a).cmp(&format!("{:?}", b)),
    };

    // Missing values stay put; only the value order flips
    match key.order {
        SortOrder::Ascending => base_cmp,
        SortOrder::Descending => base_cmp.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Predicate;

    fn store() -> DataStore {
        DataStore::new(
            ColumnStore::new(
                "people",
                5,
                vec![
                    Column::float64("score", vec![3.0, f64::NAN, 1.0, 3.0, 2.0]),
                    Column::categorical("name", ["eve", "bob", "amy", "dan", "cat"]),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_unsorted_model_shares_delivered_sequence() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());

        assert!(Arc::ptr_eq(&model.data(), store.last_delivered().indices()));
        assert_eq!(model.len(), 5);
        assert_eq!(model.columns(), vec!["score", "name"]);
    }

    #[test]
    fn test_sort_missing_last_and_stable() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());

        model.sort("score", SortOrder::Ascending).unwrap();
        assert_eq!(&model.data()[..], &[2, 4, 0, 3, 1]);

        model.sort("score", SortOrder::Descending).unwrap();
        assert_eq!(&model.data()[..], &[0, 3, 4, 2, 1]);

        model.sort("name", SortOrder::Ascending).unwrap();
        assert_eq!(&model.data()[..], &[2, 1, 4, 3, 0]);

        model.clear_sort();
        assert_eq!(&model.data()[..], &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_nulls_first() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());
        model
            .sort_by(SortKey::new("score", SortOrder::Ascending, true))
            .unwrap();
        assert_eq!(model.data()[0], 1);
    }

    #[test]
    fn test_sort_survives_filter_changes() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());
        model.sort("score", SortOrder::Descending).unwrap();

        let dim = store.add_dimension("score");
        dim.filter(Predicate::range("score", 2.0, 3.0)).unwrap();
        assert_eq!(&model.data()[..], &[0, 3, 4]);
        assert_eq!(model.generation(), 1);

        dim.filter(Predicate::range("score", 1.0, 2.0)).unwrap();
        assert_eq!(&model.data()[..], &[4, 2]);
    }

    #[test]
    fn test_manual_model_waits_for_update() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions { autoupdate: false });
        assert_eq!(store.listener_count(), 0);

        let dim = store.add_dimension("score");
        dim.filter(Predicate::range("score", 3.0, 3.0)).unwrap();
        assert_eq!(model.len(), 5);

        model.update_model();
        assert_eq!(&model.data()[..], &[0, 3]);
    }

    #[test]
    fn test_unknown_columns_rejected() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());

        assert_eq!(
            model.set_columns(["score", "age"]),
            Err(ConfigurationError::ColumnNotFound("age".to_string()))
        );
        assert!(model.sort("age", SortOrder::Ascending).is_err());
        assert_eq!(model.columns().len(), 2);
    }

    #[test]
    fn test_get_value_requires_selected_column() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());
        model.set_columns(["name"]).unwrap();
        model.sort("score", SortOrder::Ascending).unwrap();

        assert_eq!(
            model.get_value(0, "name").unwrap(),
            ColumnValue::Category("amy".to_string())
        );
        assert!(model.get_value(0, "score").is_err());
        assert!(matches!(
            model.get_value(5, "name"),
            Err(ConfigurationError::RowOutOfRange { index: 5, len: 5 })
        ));
    }

    #[test]
    fn test_model_listeners_and_drop() {
        let store = store();
        let model = DataModel::new(&store, ModelOptions::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        model.add_listener("chart", move |update| {
            sink.lock().unwrap().push(update.data.len())
        });

        let dim = store.add_dimension("score");
        dim.filter(Predicate::range("score", 1.0, 1.0)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(store.listener_count(), 1);

        drop(model);
        assert_eq!(store.listener_count(), 0);
    }
}
