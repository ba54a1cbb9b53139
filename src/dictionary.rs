/// Category dictionary for categorical columns
///
/// A categorical column stores one `CategoryCode` per row and resolves codes
/// through a dictionary of distinct values. The dictionary is built once at
/// load time and never changes afterwards, so codes are stable for the
/// lifetime of the column.
///
/// # Design
///
/// - Values are stored once in a `Vec<String>` (index = code)
/// - A `HashMap<String, CategoryCode>` provides O(1) lookup from value to code
/// - Codes are assigned in first-seen order
/// - Occurrence counts are kept per code for summaries
///
/// # Examples
///
/// ```
/// use livefilter::CategoryDictionary;
///
/// let mut dict = CategoryDictionary::new();
///
/// let a = dict.intern("A");
/// let b = dict.intern("B");
/// assert_eq!(dict.intern("A"), a);
/// assert_ne!(a, b);
///
/// assert_eq!(dict.resolve(a), Some("A"));
/// assert_eq!(dict.code_of("C"), None);
/// ```

use std::collections::HashMap;

/// Code stored per row of a categorical column
pub type CategoryCode = u32;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryDictionary {
    value_to_code: HashMap<String, CategoryCode>,
    values: Vec<String>,
    counts: Vec<u64>,
}

impl CategoryDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from a fixed list of values; the position of each
    /// value is its code. Duplicates keep their first position.
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dict = Self::new();
        for value in values {
            let value = value.as_ref();
            if !dict.value_to_code.contains_key(value) {
                let code = dict.values.len() as CategoryCode;
                dict.values.push(value.to_string());
                dict.counts.push(0);
                dict.value_to_code.insert(value.to_string(), code);
            }
        }
        dict
    }

    /// Intern a value, returning its code and counting one occurrence
    pub fn intern(&mut self, value: &str) -> CategoryCode {
        if let Some(&code) = self.value_to_code.get(value) {
            self.counts[code as usize] += 1;
            return code;
        }

        let code = self.values.len() as CategoryCode;
        self.values.push(value.to_string());
        self.counts.push(1);
        self.value_to_code.insert(value.to_string(), code);
        code
    }

    /// Count one occurrence of an existing code (used when columns are built
    /// from pre-encoded codes)
    pub(crate) fn record(&mut self, code: CategoryCode) {
        if let Some(count) = self.counts.get_mut(code as usize) {
            *count += 1;
        }
    }

    /// Code of a value, if the value occurs in the dictionary
    pub fn code_of(&self, value: &str) -> Option<CategoryCode> {
        self.value_to_code.get(value).copied()
    }

    /// Resolve a code back to its value. `None` for codes outside the dictionary.
    pub fn resolve(&self, code: CategoryCode) -> Option<&str> {
        self.values.get(code as usize).map(|s| s.as_str())
    }

    /// Number of rows carrying this code
    pub fn count(&self, code: CategoryCode) -> u64 {
        self.counts.get(code as usize).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Returns statistics about the dictionary
    pub fn stats(&self) -> DictionaryStats {
        DictionaryStats {
            categories: self.len(),
            total_rows: self.counts.iter().sum(),
            memory_bytes: self
                .values
                .iter()
                .map(|s| s.len() + std::mem::size_of::<String>())
                .sum::<usize>()
                + self.value_to_code.capacity()
                    * (std::mem::size_of::<String>() + std::mem::size_of::<CategoryCode>()),
        }
    }
}

/// Statistics about a category dictionary
#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryStats {
    /// Number of distinct categories
    pub categories: usize,
    /// Number of rows counted across all categories
    pub total_rows: u64,
    /// Approximate memory usage in bytes
    pub memory_bytes: usize,
}
