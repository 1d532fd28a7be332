//! Table profiles computed over a worker's output.
//!
//! A profile is built incrementally as tuples go by so asking for it
//! never re-scans the data. Row and value uniqueness are tracked by
//! [`seahash`] digests of the canonical JSON encoding. Distinct counts
//! are exact up to [`DISTINCT_SKETCH_SIZE`] distinct digests and
//! estimated past that, so memory per column stays bounded.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use super::Tuple;

const MAX_SAMPLES: usize = 10;

/// Digests kept per distinct counter.
pub const DISTINCT_SKETCH_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalProfile {
    pub row_count: u64,
    pub column_count: u64,
    pub row_has_null_ratio: f64,
    pub unique_row_ratio: f64,
    pub duplicate_row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub column_name: String,
    pub data_type: String,
    pub null_count: u64,
    pub unique_count: u64,
    pub unique_ratio: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub stddev: Option<f64>,
    pub sum: Option<f64>,
    pub num_zeros: u64,
    pub num_negatives: u64,
    pub samples: Vec<String>,
}

/// Schema and column statistics snapshot of everything a worker has
/// emitted so far.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableProfile {
    pub global: GlobalProfile,
    pub columns: Vec<ColumnProfile>,
}

fn digest(value: &Value) -> u64 {
    // Map keys are sorted, so equal values encode to equal bytes.
    seahash::hash(value.to_string().as_bytes())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// K minimum values sketch over 64 bit digests. Keeps the `capacity`
/// smallest digests seen; once more distinct digests than that went
/// by, the count is estimated from the largest one kept.
#[derive(Debug)]
struct DistinctCounter {
    capacity: usize,
    smallest: BTreeSet<u64>,
    saturated: bool,
}

impl Default for DistinctCounter {
    fn default() -> Self {
        Self::with_capacity(DISTINCT_SKETCH_SIZE)
    }
}

impl DistinctCounter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            smallest: BTreeSet::new(),
            saturated: false,
        }
    }

    /// Whether `digest` is known to be new. Once saturated, digests
    /// above the kept ones can't be told apart from repeats.
    fn insert(&mut self, digest: u64) -> bool {
        if self.saturated && self.smallest.last().map_or(false, |largest| digest >= *largest) {
            return false;
        }
        if !self.smallest.insert(digest) {
            return false;
        }
        if self.smallest.len() > self.capacity {
            self.smallest.pop_last();
            self.saturated = true;
        }
        true
    }

    fn count(&self) -> u64 {
        let kept = self.smallest.len() as u64;
        match self.smallest.last() {
            Some(&kth) if self.saturated && kth > 0 => {
                let estimate = (self.capacity - 1) as f64 * (u64::MAX as f64 / kth as f64);
                (estimate as u64).max(kept)
            }
            _ => kept,
        }
    }
}

/// Welford running moments.
#[derive(Debug, Default)]
struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Moments {
    fn push(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        self.sum += x;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

#[derive(Debug, Default)]
struct ColumnAccumulator {
    data_type: Option<&'static str>,
    null_count: u64,
    non_null: u64,
    distinct: DistinctCounter,
    numeric: Moments,
    num_zeros: u64,
    num_negatives: u64,
    samples: Vec<String>,
}

impl ColumnAccumulator {
    fn update(&mut self, value: &Value) {
        if value.is_null() {
            self.null_count += 1;
            return;
        }
        self.non_null += 1;

        let kind = type_name(value);
        self.data_type = match self.data_type {
            None => Some(kind),
            Some(seen) if seen == kind => Some(seen),
            Some("integer") | Some("double") if kind == "integer" || kind == "double" => {
                Some("double")
            }
            Some(_) => Some("mixed"),
        };

        if self.distinct.insert(digest(value)) && self.samples.len() < MAX_SAMPLES {
            self.samples.push(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }

        if let Some(x) = value.as_f64() {
            self.numeric.push(x);
            if x == 0.0 {
                self.num_zeros += 1;
            } else if x < 0.0 {
                self.num_negatives += 1;
            }
        }
    }

    fn profile(&self, column_name: &str) -> ColumnProfile {
        let numeric = (self.numeric.count > 0).then_some(&self.numeric);
        let unique_count = self.distinct.count().min(self.non_null);
        ColumnProfile {
            column_name: column_name.to_string(),
            data_type: self.data_type.unwrap_or("null").to_string(),
            null_count: self.null_count,
            unique_count,
            unique_ratio: ratio(unique_count, self.non_null),
            min: numeric.map(|m| m.min),
            max: numeric.map(|m| m.max),
            mean: numeric.map(|m| m.mean),
            variance: numeric.map(Moments::variance),
            stddev: numeric.map(|m| m.variance().sqrt()),
            sum: numeric.map(|m| m.sum),
            num_zeros: self.num_zeros,
            num_negatives: self.num_negatives,
            samples: self.samples.clone(),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Incrementally profiles the tuples a worker produces.
#[derive(Debug, Default)]
pub struct TableProfileManager {
    row_count: u64,
    rows_with_null: u64,
    distinct_rows: DistinctCounter,
    // Columns keep first-seen order.
    column_order: Vec<String>,
    columns: BTreeMap<String, ColumnAccumulator>,
}

impl TableProfileManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, tuple: &Tuple) {
        self.row_count += 1;

        let mut has_null = false;
        for (name, value) in tuple.fields() {
            has_null |= value.is_null();
            if !self.columns.contains_key(name) {
                self.column_order.push(name.clone());
            }
            self.columns.entry(name.clone()).or_default().update(value);
        }
        if has_null {
            self.rows_with_null += 1;
        }

        self.distinct_rows.insert(tuple.digest());
    }

    /// `None` until at least one row was seen.
    pub fn table_profile(&self) -> Option<TableProfile> {
        if self.row_count == 0 {
            return None;
        }
        let distinct_rows = self.distinct_rows.count().min(self.row_count);
        let global = GlobalProfile {
            row_count: self.row_count,
            column_count: self.column_order.len() as u64,
            row_has_null_ratio: ratio(self.rows_with_null, self.row_count),
            unique_row_ratio: ratio(distinct_rows, self.row_count),
            duplicate_row_count: self.row_count.saturating_sub(distinct_rows),
        };
        let columns = self
            .column_order
            .iter()
            .filter_map(|name| self.columns.get(name).map(|acc| acc.profile(name)))
            .collect();
        Some(TableProfile { global, columns })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
fn tuple(value: Value) -> Tuple {
    Tuple::from_value(value).unwrap()
}

#[test]
fn empty_manager_has_no_profile() {
    assert_eq!(TableProfileManager::new().table_profile(), None);
}

#[test]
fn global_profile_counts_duplicates_and_nulls() {
    use serde_json::json;

    let mut manager = TableProfileManager::new();
    manager.update(&tuple(json!({"a": 1, "b": "x"})));
    manager.update(&tuple(json!({"a": 1, "b": "x"})));
    manager.update(&tuple(json!({"a": null, "b": "y"})));
    manager.update(&tuple(json!({"a": -2, "b": "z"})));

    let profile = manager.table_profile().unwrap();
    assert_eq!(profile.global.row_count, 4);
    assert_eq!(profile.global.column_count, 2);
    assert_eq!(profile.global.duplicate_row_count, 1);
    assert_eq!(profile.global.unique_row_ratio, 0.75);
    assert_eq!(profile.global.row_has_null_ratio, 0.25);
}

#[test]
fn column_profile_tracks_numeric_moments() {
    use serde_json::json;

    let mut manager = TableProfileManager::new();
    for x in [2, 4, 4, 4, 5, 5, 7, 9, 0, -1] {
        manager.update(&tuple(json!({ "x": x })));
    }
    let profile = manager.table_profile().unwrap();
    let x = &profile.columns[0];
    assert_eq!(x.column_name, "x");
    assert_eq!(x.data_type, "integer");
    assert_eq!(x.min, Some(-1.0));
    assert_eq!(x.max, Some(9.0));
    assert_eq!(x.sum, Some(39.0));
    assert!((x.mean.unwrap() - 3.9).abs() < 1e-9);
    assert_eq!(x.num_zeros, 1);
    assert_eq!(x.num_negatives, 1);
    assert_eq!(x.unique_count, 7);
    assert_eq!(x.samples.len(), 7);
}

#[test]
fn samples_are_capped_and_reset_clears() {
    use serde_json::json;

    let mut manager = TableProfileManager::new();
    for i in 0..50 {
        manager.update(&tuple(json!({ "name": format!("n{i}") })));
    }
    let profile = manager.table_profile().unwrap();
    assert_eq!(profile.columns[0].samples.len(), MAX_SAMPLES);
    assert_eq!(profile.columns[0].data_type, "string");
    assert_eq!(profile.columns[0].min, None);

    manager.reset();
    assert_eq!(manager.table_profile(), None);
}

#[test]
fn distinct_counter_is_exact_until_full() {
    let mut counter = DistinctCounter::with_capacity(1024);
    for i in 0..1000u64 {
        assert!(counter.insert(seahash::hash(&i.to_le_bytes())));
        assert!(!counter.insert(seahash::hash(&i.to_le_bytes())));
    }
    assert_eq!(counter.count(), 1000);
    assert!(!counter.saturated);
}

#[test]
fn distinct_counter_memory_is_capped() {
    let mut counter = DistinctCounter::with_capacity(1024);
    for round in 0..2 {
        for i in 0..20_000u64 {
            counter.insert(seahash::hash(&i.to_le_bytes()));
        }
        assert_eq!(counter.smallest.len(), 1024, "round {round}");
    }
    let estimate = counter.count() as f64;
    assert!((estimate - 20_000.0).abs() < 20_000.0 * 0.2, "estimate {estimate}");
}

#[test]
fn many_distinct_rows_stay_consistent() {
    use serde_json::json;

    let mut manager = TableProfileManager::new();
    for i in 0..(3 * DISTINCT_SKETCH_SIZE) {
        manager.update(&tuple(json!({ "id": i })));
    }
    let profile = manager.table_profile().unwrap();
    assert!(profile.global.unique_row_ratio <= 1.0);
    assert!(profile.global.unique_row_ratio > 0.8);
    assert!(profile.columns[0].unique_count <= profile.global.row_count);
    assert!(profile.global.duplicate_row_count < profile.global.row_count / 5);
}
