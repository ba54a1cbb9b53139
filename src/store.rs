/// LiveFilter ColumnStore
///
/// A ColumnStore is the loaded, immutable column set of one dataset.
/// The loading pipeline hands over every column and the row count at once;
/// the store validates that they agree and is read-only from then on. A
/// reload builds a new ColumnStore and swaps it in wholesale.
///
/// # Examples
///
/// ```
/// use livefilter::{Column, ColumnStore};
///
/// let store = ColumnStore::new(
///     "cells",
///     3,
///     vec![
///         Column::float64("x", vec![0.5, 1.5, 2.5]),
///         Column::categorical("group", ["A", "B", "A"]),
///     ],
/// )
/// .unwrap();
///
/// assert_eq!(store.len(), 3);
/// assert_eq!(store.get_value(1, "group").unwrap().as_category(), Some("B"));
/// assert!(store.get_column("missing").is_err());
/// ```

use crate::column::{Column, ColumnType, ColumnValue};
use crate::error::ConfigurationError;
use std::collections::HashMap;

pub struct ColumnStore {
    name: String,
    row_count: usize,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl ColumnStore {
    /// Create a store from a complete column set.
    ///
    /// Every column must have exactly `row_count` rows and column names must
    /// be unique.
    pub fn new(
        name: impl Into<String>,
        row_count: usize,
        columns: Vec<Column>,
    ) -> Result<Self, ConfigurationError> {
        let mut index = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if column.len() != row_count {
                return Err(ConfigurationError::LengthMismatch {
                    column: column.name().to_string(),
                    expected: row_count,
                    actual: column.len(),
                });
            }
            if index.insert(column.name().to_string(), i).is_some() {
                return Err(ConfigurationError::DuplicateColumn(
                    column.name().to_string(),
                ));
            }
        }

        Ok(ColumnStore {
            name: name.into(),
            row_count,
            columns,
            index,
        })
    }

    /// An empty dataset with no columns and no rows
    pub fn empty(name: impl Into<String>) -> Self {
        ColumnStore {
            name: name.into(),
            row_count: 0,
            columns: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Dataset name, used as the data source key on the wire
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows (N)
    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn get_column(&self, name: &str) -> Result<&Column, ConfigurationError> {
        self.index
            .get(name)
            .map(|&i| &self.columns[i])
            .ok_or_else(|| ConfigurationError::ColumnNotFound(name.to_string()))
    }

    /// Look up a column and check it has one of the accepted types
    pub fn get_typed_column(
        &self,
        name: &str,
        expected: &'static str,
        accept: impl Fn(ColumnType) -> bool,
    ) -> Result<&Column, ConfigurationError> {
        let column = self.get_column(name)?;
        if !accept(column.column_type()) {
            return Err(ConfigurationError::ColumnTypeMismatch {
                column: name.to_string(),
                expected,
                actual: column.column_type().name(),
            });
        }
        Ok(column)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get_value(&self, row: usize, column: &str) -> Result<ColumnValue, ConfigurationError> {
        self.get_column(column)?.get(row)
    }
}

impl std::fmt::Debug for ColumnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ColumnStore {{ name: '{}', columns: {}, rows: {} }}",
            self.name,
            self.columns.len(),
            self.row_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ColumnStore {
        ColumnStore::new(
            "sample",
            3,
            vec![
                Column::int32("id", vec![1, 2, 3]),
                Column::float64("score", vec![9.5, f64::NAN, 7.0]),
                Column::categorical("group", ["A", "B", "A"]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_store_basic() {
        let store = sample();

        assert_eq!(store.name(), "sample");
        assert_eq!(store.len(), 3);
        assert_eq!(store.column_names(), vec!["id", "score", "group"]);
        assert_eq!(store.get_value(2, "id").unwrap().as_i32(), Some(3));
        assert!(store.get_value(1, "score").unwrap().is_null());
    }

    #[test]
    fn test_unknown_column_is_not_found() {
        let store = sample();
        assert_eq!(
            store.get_column("nope").unwrap_err(),
            ConfigurationError::ColumnNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = ColumnStore::new(
            "bad",
            3,
            vec![Column::int32("id", vec![1, 2])],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::LengthMismatch { expected: 3, actual: 2, .. }
        ));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = ColumnStore::new(
            "bad",
            1,
            vec![Column::int32("id", vec![1]), Column::float64("id", vec![1.0])],
        )
        .unwrap_err();

        assert_eq!(err, ConfigurationError::DuplicateColumn("id".to_string()));
    }

    #[test]
    fn test_typed_lookup() {
        let store = sample();

        assert!(store
            .get_typed_column("score", "numeric", ColumnType::is_numeric)
            .is_ok());
        let err = store
            .get_typed_column("group", "numeric", ColumnType::is_numeric)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::ColumnTypeMismatch { .. }));
    }

    #[test]
    fn test_empty_store() {
        let store = ColumnStore::empty("nothing");
        assert!(store.is_empty());
        assert!(store.column_names().is_empty());
    }
}
