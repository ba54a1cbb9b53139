/// LiveFilter Column Implementation
///
/// A Column is an immutable, array-like data container indexed by row.
/// Each Column has a type specifying the type of every value stored, and is
/// fixed in length once loaded. Reloading a dataset replaces whole columns;
/// nothing mutates a column in place.
///
/// # Categorical Columns
///
/// Categorical columns store one `CategoryCode` per row and resolve codes
/// through a `CategoryDictionary`. Filters on categories compare codes, so a
/// categorical equality test never touches the string values.
///
/// # Missing Values
///
/// Floating point columns use `NaN` for missing values. A categorical code
/// outside its dictionary reads back as `ColumnValue::Null`.

use crate::dictionary::{CategoryCode, CategoryDictionary};
use crate::error::ConfigurationError;
use std::fmt::Debug;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int32,
    Float32,
    Float64,
    Categorical,
    Bool,
}

impl ColumnType {
    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Int32 => "int32",
            ColumnType::Float32 => "float32",
            ColumnType::Float64 => "float64",
            ColumnType::Categorical => "categorical",
            ColumnType::Bool => "bool",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnType::Int32 | ColumnType::Float32 | ColumnType::Float64
        )
    }
}

/// Column value enum to support multiple types
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int32(i32),
    Float32(f32),
    Float64(f64),
    Category(String),
    Bool(bool),
    Null,
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ColumnValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Int32(v) => Some(*v as f64),
            ColumnValue::Float32(v) => Some(*v as f64),
            ColumnValue::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            ColumnValue::Category(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum ColumnData {
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Categorical {
        codes: Vec<CategoryCode>,
        dictionary: CategoryDictionary,
    },
    Bool(Vec<bool>),
}

/// Immutable typed column
#[derive(Clone)]
pub struct Column {
    name: String,
    data: ColumnData,
}

impl Column {
    pub fn int32(name: impl Into<String>, values: Vec<i32>) -> Self {
        Column {
            name: name.into(),
            data: ColumnData::Int32(values),
        }
    }

    pub fn float32(name: impl Into<String>, values: Vec<f32>) -> Self {
        Column {
            name: name.into(),
            data: ColumnData::Float32(values),
        }
    }

    pub fn float64(name: impl Into<String>, values: Vec<f64>) -> Self {
        Column {
            name: name.into(),
            data: ColumnData::Float64(values),
        }
    }

    pub fn bool(name: impl Into<String>, values: Vec<bool>) -> Self {
        Column {
            name: name.into(),
            data: ColumnData::Bool(values),
        }
    }

    /// Create a categorical column, building the dictionary from the values
    /// in first-seen order
    pub fn categorical<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dictionary = CategoryDictionary::new();
        let codes = values
            .into_iter()
            .map(|v| dictionary.intern(v.as_ref()))
            .collect();
        Column {
            name: name.into(),
            data: ColumnData::Categorical { codes, dictionary },
        }
    }

    /// Create a categorical column from pre-encoded codes and their value
    /// lookup table. Codes outside the dictionary are kept as-is and read
    /// back as null.
    pub fn categorical_from_codes(
        name: impl Into<String>,
        codes: Vec<CategoryCode>,
        mut dictionary: CategoryDictionary,
    ) -> Self {
        for &code in &codes {
            dictionary.record(code);
        }
        Column {
            name: name.into(),
            data: ColumnData::Categorical { codes, dictionary },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        match self.data {
            ColumnData::Int32(_) => ColumnType::Int32,
            ColumnData::Float32(_) => ColumnType::Float32,
            ColumnData::Float64(_) => ColumnType::Float64,
            ColumnData::Categorical { .. } => ColumnType::Categorical,
            ColumnData::Bool(_) => ColumnType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ColumnData::Int32(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Categorical { codes, .. } => codes.len(),
            ColumnData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<ColumnValue, ConfigurationError> {
        if index >= self.len() {
            return Err(ConfigurationError::RowOutOfRange {
                index,
                len: self.len(),
            });
        }

        let value = match &self.data {
            ColumnData::Int32(v) => ColumnValue::Int32(v[index]),
            ColumnData::Float32(v) if v[index].is_nan() => ColumnValue::Null,
            ColumnData::Float32(v) => ColumnValue::Float32(v[index]),
            ColumnData::Float64(v) if v[index].is_nan() => ColumnValue::Null,
            ColumnData::Float64(v) => ColumnValue::Float64(v[index]),
            ColumnData::Categorical { codes, dictionary } => dictionary
                .resolve(codes[index])
                .map(|s| ColumnValue::Category(s.to_string()))
                .unwrap_or(ColumnValue::Null),
            ColumnData::Bool(v) => ColumnValue::Bool(v[index]),
        };
        Ok(value)
    }

    /// Fast numeric access - returns the value as f64 without building a ColumnValue.
    /// Returns None if the value is missing, not numeric, or the index is out of bounds.
    #[inline]
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        let value = match &self.data {
            ColumnData::Int32(v) => *v.get(index)? as f64,
            ColumnData::Float32(v) => *v.get(index)? as f64,
            ColumnData::Float64(v) => *v.get(index)?,
            _ => return None,
        };
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    /// Raw category code at a row. None for non-categorical columns or
    /// out-of-bounds rows.
    #[inline]
    pub fn category_code(&self, index: usize) -> Option<CategoryCode> {
        match &self.data {
            ColumnData::Categorical { codes, .. } => codes.get(index).copied(),
            _ => None,
        }
    }

    /// Value lookup table for categorical columns
    pub fn dictionary(&self) -> Option<&CategoryDictionary> {
        match &self.data {
            ColumnData::Categorical { dictionary, .. } => Some(dictionary),
            _ => None,
        }
    }

    pub fn iter(&self) -> ColumnIterator<'_> {
        ColumnIterator {
            column: self,
            index: 0,
        }
    }
}

pub struct ColumnIterator<'a> {
    column: &'a Column,
    index: usize,
}

impl<'a> Iterator for ColumnIterator<'a> {
    type Item = ColumnValue;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.column.len() {
            None
        } else {
            let result = self.column.get(self.index).ok();
            self.index += 1;
            result
        }
    }
}

impl Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Column {{ name: '{}', type: {:?}, len: {} }}",
            self.name,
            self.column_type(),
            self.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_basic() {
        let col = Column::int32("test", vec![10, 20, 30]);

        assert_eq!(col.len(), 3);
        assert_eq!(col.column_type(), ColumnType::Int32);
        assert_eq!(col.get(0).unwrap().as_i32(), Some(10));
        assert_eq!(col.get(2).unwrap().as_i32(), Some(30));
        assert!(col.get(3).is_err());
    }

    #[test]
    fn test_float_nan_is_missing() {
        let col = Column::float64("x", vec![1.5, f64::NAN]);

        assert_eq!(col.get_f64(0), Some(1.5));
        assert_eq!(col.get_f64(1), None);
        assert!(col.get(1).unwrap().is_null());
    }

    #[test]
    fn test_get_f64_widens_and_rejects_non_numeric() {
        let ints = Column::int32("i", vec![7]);
        let floats = Column::float32("f", vec![0.5]);
        let flags = Column::bool("b", vec![true]);

        assert_eq!(ints.get_f64(0), Some(7.0));
        assert_eq!(floats.get_f64(0), Some(0.5));
        assert_eq!(flags.get_f64(0), None);
        assert_eq!(ints.get_f64(1), None);
    }

    #[test]
    fn test_categorical_column() {
        let col = Column::categorical("group", ["A", "B", "A", "C"]);

        assert_eq!(col.column_type(), ColumnType::Categorical);
        assert_eq!(col.get(2).unwrap().as_category(), Some("A"));
        assert_eq!(col.category_code(0), col.category_code(2));
        let dict = col.dictionary().unwrap();
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.count(dict.code_of("A").unwrap()), 2);
    }

    #[test]
    fn test_categorical_from_codes_out_of_range() {
        let dict = CategoryDictionary::from_values(["A", "B"]);
        let col = Column::categorical_from_codes("group", vec![0, 1, 9], dict);

        assert_eq!(col.get(1).unwrap().as_category(), Some("B"));
        assert!(col.get(2).unwrap().is_null());
        assert_eq!(col.category_code(2), Some(9));
        assert_eq!(col.dictionary().unwrap().count(0), 1);
    }

    #[test]
    fn test_column_iter() {
        let col = Column::bool("flag", vec![true, false]);
        let values: Vec<ColumnValue> = col.iter().collect();
        assert_eq!(values, vec![ColumnValue::Bool(true), ColumnValue::Bool(false)]);
    }
}
