/// Filter predicates.
///
/// A `Predicate` is the tagged description a Dimension holds. Before it is
/// accepted it is compiled against a `ColumnStore`, which resolves column
/// names, checks column types and payloads, and turns categorical values into
/// a code mask. Evaluation then runs on the compiled form only.
///
/// Supported kinds:
/// - `Range`: numeric column within `[min, max]` (inclusive, missing values excluded)
/// - `Rectangle`: two numeric columns within an axis-aligned box
/// - `Polygon`: two numeric columns inside an ordered vertex ring (even-odd
///   rule, points on an edge or vertex count as inside)
/// - `Category`: categorical column equal to any of the given values
/// - `Indices`: explicit row membership
/// - `Custom`: caller-supplied closure over named columns

use crate::column::{Column, ColumnType};
use crate::error::ConfigurationError;
use crate::event::RowIndex;
use crate::store::ColumnStore;
use std::fmt;
use std::sync::Arc;

/// Closure type for custom predicates: receives the declared columns in order
/// and a row index. `Err` marks an evaluation failure.
pub type CustomFn = dyn Fn(&[&Column], usize) -> Result<bool, String> + Send + Sync;

#[derive(Clone)]
pub struct CustomPredicate {
    name: String,
    columns: Vec<String>,
    func: Arc<CustomFn>,
}

impl CustomPredicate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Custom({}, {:?})", self.name, self.columns)
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Range {
        column: String,
        min: f64,
        max: f64,
    },
    Rectangle {
        x: String,
        y: String,
        x_range: (f64, f64),
        y_range: (f64, f64),
    },
    Polygon {
        x: String,
        y: String,
        vertices: Vec<[f64; 2]>,
    },
    Category {
        column: String,
        values: Vec<String>,
    },
    Indices(Arc<[RowIndex]>),
    Custom(CustomPredicate),
}

impl Predicate {
    pub fn range(column: impl Into<String>, min: f64, max: f64) -> Self {
        Predicate::Range {
            column: column.into(),
            min,
            max,
        }
    }

    pub fn rectangle(
        x: impl Into<String>,
        y: impl Into<String>,
        x_range: (f64, f64),
        y_range: (f64, f64),
    ) -> Self {
        Predicate::Rectangle {
            x: x.into(),
            y: y.into(),
            x_range,
            y_range,
        }
    }

    pub fn polygon(x: impl Into<String>, y: impl Into<String>, vertices: Vec<[f64; 2]>) -> Self {
        Predicate::Polygon {
            x: x.into(),
            y: y.into(),
            vertices,
        }
    }

    /// Categorical equality with a single value
    pub fn category(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Category {
            column: column.into(),
            values: vec![value.into()],
        }
    }

    /// Categorical membership: the row matches if its category is any of `values`
    pub fn categories<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Category {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn indices(rows: impl IntoIterator<Item = RowIndex>) -> Self {
        Predicate::Indices(rows.into_iter().collect())
    }

    pub fn custom<F>(name: impl Into<String>, columns: Vec<String>, func: F) -> Self
    where
        F: Fn(&[&Column], usize) -> Result<bool, String> + Send + Sync + 'static,
    {
        Predicate::Custom(CustomPredicate {
            name: name.into(),
            columns,
            func: Arc::new(func),
        })
    }

    /// Short kind name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Predicate::Range { .. } => "range",
            Predicate::Rectangle { .. } => "rectangle",
            Predicate::Polygon { .. } => "polygon",
            Predicate::Category { .. } => "category",
            Predicate::Indices(_) => "indices",
            Predicate::Custom(_) => "custom",
        }
    }

    /// Resolve against a column store, validating columns and payload
    pub fn compile<'a>(
        &'a self,
        store: &'a ColumnStore,
    ) -> Result<CompiledPredicate<'a>, ConfigurationError> {
        match self {
            Predicate::Range { column, min, max } => {
                check_bounds("range", *min, *max)?;
                Ok(CompiledPredicate::Range {
                    column: numeric_column(store, column)?,
                    min: *min,
                    max: *max,
                })
            }

            Predicate::Rectangle {
                x,
                y,
                x_range,
                y_range,
            } => {
                check_bounds("rectangle x", x_range.0, x_range.1)?;
                check_bounds("rectangle y", y_range.0, y_range.1)?;
                Ok(CompiledPredicate::Rectangle {
                    x: numeric_column(store, x)?,
                    y: numeric_column(store, y)?,
                    x_range: *x_range,
                    y_range: *y_range,
                })
            }

            Predicate::Polygon { x, y, vertices } => {
                let mut ring: &[[f64; 2]] = vertices;
                // A closed ring repeats its first vertex at the end
                if ring.len() > 1 && ring.first() == ring.last() {
                    ring = &ring[..ring.len() - 1];
                }
                if ring.len() < 3 {
                    return Err(ConfigurationError::MalformedPredicate(format!(
                        "polygon needs at least 3 vertices, got {}",
                        ring.len()
                    )));
                }
                if ring.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(ConfigurationError::MalformedPredicate(
                        "polygon vertices must be finite".to_string(),
                    ));
                }
                Ok(CompiledPredicate::Polygon {
                    x: numeric_column(store, x)?,
                    y: numeric_column(store, y)?,
                    bounds: BoundingBox::of(ring),
                    ring,
                })
            }

            Predicate::Category { column, values } => {
                let col = store.get_typed_column(column, "categorical", |t| {
                    t == ColumnType::Categorical
                })?;
                let mut mask = Vec::new();
                if let Some(dictionary) = col.dictionary() {
                    mask = vec![false; dictionary.len()];
                    // Values missing from the dictionary match nothing
                    for code in values.iter().filter_map(|v| dictionary.code_of(v)) {
                        mask[code as usize] = true;
                    }
                }
                Ok(CompiledPredicate::Category { column: col, mask })
            }

            Predicate::Indices(rows) => {
                let mut mask = vec![false; store.len()];
                for &row in rows.iter() {
                    let slot = mask.get_mut(row as usize).ok_or(
                        ConfigurationError::RowOutOfRange {
                            index: row as usize,
                            len: store.len(),
                        },
                    )?;
                    *slot = true;
                }
                Ok(CompiledPredicate::Indices { mask })
            }

            Predicate::Custom(custom) => {
                let columns = custom
                    .columns
                    .iter()
                    .map(|name| store.get_column(name))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledPredicate::Custom {
                    columns,
                    func: &custom.func,
                })
            }
        }
    }
}

fn numeric_column<'a>(store: &'a ColumnStore, name: &str) -> Result<&'a Column, ConfigurationError> {
    store.get_typed_column(name, "numeric", ColumnType::is_numeric)
}

fn check_bounds(what: &str, min: f64, max: f64) -> Result<(), ConfigurationError> {
    if min.is_nan() || max.is_nan() {
        return Err(ConfigurationError::MalformedPredicate(format!(
            "{} bounds must not be NaN",
            what
        )));
    }
    if min > max {
        return Err(ConfigurationError::MalformedPredicate(format!(
            "{} min {} exceeds max {}",
            what, min, max
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    min: [f64; 2],
    max: [f64; 2],
}

impl BoundingBox {
    fn of(ring: &[[f64; 2]]) -> Self {
        let mut bounds = BoundingBox {
            min: [f64::INFINITY; 2],
            max: [f64::NEG_INFINITY; 2],
        };
        for v in ring {
            for axis in 0..2 {
                bounds.min[axis] = bounds.min[axis].min(v[axis]);
                bounds.max[axis] = bounds.max[axis].max(v[axis]);
            }
        }
        bounds
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min[0] && x <= self.max[0] && y >= self.min[1] && y <= self.max[1]
    }
}

/// Predicate resolved against one column snapshot
pub enum CompiledPredicate<'a> {
    Range {
        column: &'a Column,
        min: f64,
        max: f64,
    },
    Rectangle {
        x: &'a Column,
        y: &'a Column,
        x_range: (f64, f64),
        y_range: (f64, f64),
    },
    Polygon {
        x: &'a Column,
        y: &'a Column,
        ring: &'a [[f64; 2]],
        bounds: BoundingBox,
    },
    Category {
        column: &'a Column,
        mask: Vec<bool>,
    },
    Indices {
        mask: Vec<bool>,
    },
    Custom {
        columns: Vec<&'a Column>,
        func: &'a Arc<CustomFn>,
    },
}

impl<'a> CompiledPredicate<'a> {
    /// Whether a row passes. Only custom predicates can fail.
    #[inline]
    pub fn accepts(&self, row: usize) -> Result<bool, String> {
        let accepted = match self {
            CompiledPredicate::Range { column, min, max } => column
                .get_f64(row)
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),

            CompiledPredicate::Rectangle {
                x,
                y,
                x_range,
                y_range,
            } => match (x.get_f64(row), y.get_f64(row)) {
                (Some(px), Some(py)) => {
                    px >= x_range.0 && px <= x_range.1 && py >= y_range.0 && py <= y_range.1
                }
                _ => false,
            },

            CompiledPredicate::Polygon { x, y, ring, bounds } => {
                match (x.get_f64(row), y.get_f64(row)) {
                    (Some(px), Some(py)) => {
                        bounds.contains(px, py) && point_in_polygon(px, py, ring)
                    }
                    _ => false,
                }
            }

            CompiledPredicate::Category { column, mask } => column
                .category_code(row)
                .and_then(|code| mask.get(code as usize).copied())
                .unwrap_or(false),

            CompiledPredicate::Indices { mask } => mask.get(row).copied().unwrap_or(false),

            CompiledPredicate::Custom { columns, func } => return func(columns, row),
        };
        Ok(accepted)
    }
}

/// Even-odd point-in-polygon test. Points on an edge or vertex are inside.
pub fn point_in_polygon(px: f64, py: f64, ring: &[[f64; 2]]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];

        if on_segment(px, py, xi, yi, xj, yj) {
            return true;
        }

        if (yi > py) != (yj > py) {
            let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    let scale = (bx - ax).abs().max((by - ay).abs()).max(1.0);
    if cross.abs() > 1e-12 * scale * scale {
        return false;
    }
    px >= ax.min(bx) && px <= ax.max(bx) && py >= ay.min(by) && py <= ay.max(by)
}
