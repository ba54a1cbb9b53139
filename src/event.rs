/// Delivery types for DataStore subscribers
///
/// Every completed recompute produces one `FilteredIndices` stamped with the
/// generation it was computed for. Subscribers receive it (and highlight and
/// failure notices) as `StoreEvent`s through the store's listener registry.
///
/// # Generations
///
/// The store bumps its generation on every mutation. A computation carries
/// the generation it started from and is only delivered if that generation is
/// still current when it finishes, so a listener never sees a generation
/// lower than one it has already seen.

use crate::store::ColumnStore;
use std::sync::Arc;

/// Row position in a ColumnStore
pub type RowIndex = u32;

/// Monotonic version of a DataStore's filter state
pub type Generation = u64;

/// One delivered filter result.
///
/// `indices` is the conjunction of every active dimension. `local` is the
/// conjunction of only this session's own (non-mirror) dimensions; when no
/// mirror dimension is active both point at the same sequence.
#[derive(Clone)]
pub struct FilteredIndices {
    generation: Generation,
    indices: Arc<[RowIndex]>,
    local: Arc<[RowIndex]>,
    columns: Arc<ColumnStore>,
}

impl FilteredIndices {
    pub(crate) fn new(
        generation: Generation,
        indices: Arc<[RowIndex]>,
        local: Arc<[RowIndex]>,
        columns: Arc<ColumnStore>,
    ) -> Self {
        FilteredIndices {
            generation,
            indices,
            local,
            columns,
        }
    }

    /// The unfiltered result [0..N)
    pub(crate) fn identity(generation: Generation, columns: Arc<ColumnStore>) -> Self {
        let all: Arc<[RowIndex]> = (0..columns.len() as RowIndex).collect();
        FilteredIndices::new(generation, all.clone(), all, columns)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Ascending, duplicate-free surviving rows
    pub fn indices(&self) -> &Arc<[RowIndex]> {
        &self.indices
    }

    /// Rows accepted by local dimensions alone, ignoring mirrored peer filters
    pub fn local_indices(&self) -> &Arc<[RowIndex]> {
        &self.local
    }

    /// Column snapshot the result was computed against
    pub fn columns(&self) -> &Arc<ColumnStore> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, row: RowIndex) -> bool {
        self.indices.binary_search(&row).is_ok()
    }

    /// True when every row of the dataset survived
    pub fn is_unfiltered(&self) -> bool {
        self.indices.len() == self.columns.len()
    }
}

impl std::fmt::Debug for FilteredIndices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FilteredIndices {{ generation: {}, rows: {}/{} }}",
            self.generation,
            self.indices.len(),
            self.columns.len()
        )
    }
}

/// Currently highlighted rows of a store and the view that highlighted them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HighlightState {
    pub indices: Vec<RowIndex>,
    pub source: Option<String>,
}

impl HighlightState {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Notification delivered to store listeners
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A recompute finished and its result is now canonical
    Filtered(FilteredIndices),

    /// Rows were highlighted by `source`; never delivered to `source` itself
    Highlighted(HighlightState),

    /// The computation for `generation` failed; the previous result stays in
    /// place. Only delivered to listeners registered with `report_errors`.
    ComputeFailed {
        generation: Generation,
        message: String,
    },
}

impl StoreEvent {
    pub fn generation(&self) -> Option<Generation> {
        match self {
            StoreEvent::Filtered(f) => Some(f.generation()),
            StoreEvent::ComputeFailed { generation, .. } => Some(*generation),
            StoreEvent::Highlighted(_) => None,
        }
    }
}
