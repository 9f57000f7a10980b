//! Data file descriptors and per-column statistics.
//!
//! This module contains **pure** data types. Encoding and IO live in
//! [`crate::writer`].

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use arrow::{
    array::{Array, ArrayRef, AsArray},
    compute::{self, cast},
    datatypes::{DataType, Float64Type, Int64Type},
    error::ArrowError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

/// A single typed value used by statistics, partition values and predicates.
///
/// Integer-like columns (ints, dates, timestamps) compare as `Int64`, floats
/// as `Float64`. `Int64` and `Float64` compare with each other numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    /// Boolean value.
    Boolean(bool),
    /// Any integer-like value.
    Int64(i64),
    /// Any floating point value.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
}

impl ScalarValue {
    /// Value at `row`, or `None` when it is null or of a type without
    /// comparable values.
    pub fn from_array(array: &dyn Array, row: usize) -> Result<Option<Self>, ArrowError> {
        if array.is_null(row) {
            return Ok(None);
        }
        let single = normalize_for_compare(array.slice(row, 1).as_ref())?;
        Ok(match single.data_type() {
            DataType::Boolean => Some(ScalarValue::Boolean(single.as_boolean().value(0))),
            DataType::Int64 => Some(ScalarValue::Int64(
                single.as_primitive::<Int64Type>().value(0),
            )),
            DataType::Float64 => Some(ScalarValue::Float64(
                single.as_primitive::<Float64Type>().value(0),
            )),
            DataType::Utf8 => Some(ScalarValue::Utf8(
                single.as_string::<i32>().value(0).to_string(),
            )),
            _ => None,
        })
    }

    /// Parse a rendered partition value back into a scalar of `column_type`.
    pub fn parse_partition(value: &str, column_type: &ColumnType) -> Option<Self> {
        match column_type {
            ColumnType::Boolean => value.parse().ok().map(ScalarValue::Boolean),
            ColumnType::Int32 | ColumnType::Int64 | ColumnType::Date32 => {
                value.parse().ok().map(ScalarValue::Int64)
            }
            ColumnType::Utf8 => Some(ScalarValue::Utf8(value.to_string())),
            _ => None,
        }
    }

    /// A one-element Arrow array holding this value.
    pub(crate) fn to_array(&self) -> ArrayRef {
        use std::sync::Arc;

        use arrow::array::{BooleanArray, Float64Array, Int64Array, StringArray};

        match self {
            ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v])),
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str()])),
        }
    }
}

/// Orders an integer against a float without rounding the integer.
fn cmp_int_float(int: i64, float: f64) -> Option<Ordering> {
    // 2^63, one past `i64::MAX`.
    const I64_END: f64 = 9_223_372_036_854_775_808.0;

    if float.is_nan() {
        return None;
    }
    if float >= I64_END {
        return Some(Ordering::Less);
    }
    if float < -I64_END {
        return Some(Ordering::Greater);
    }
    // In range, the integral part converts exactly.
    let whole = float.trunc();
    match int.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(float - whole)),
        ord => Some(ord),
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => a.partial_cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.partial_cmp(b),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => a.partial_cmp(b),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => a.partial_cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Float64(b)) => cmp_int_float(*a, *b),
            (ScalarValue::Float64(a), ScalarValue::Int64(b)) => {
                cmp_int_float(*b, *a).map(Ordering::reverse)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int64(v.into())
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Utf8(v)
    }
}

/// Cast an array into the comparison domain used by [`ScalarValue`].
///
/// Dates, timestamps and all integer types become `Int64`; floats become
/// `Float64`; string layouts become `Utf8`. Booleans and binary pass through.
pub(crate) fn normalize_for_compare(array: &dyn Array) -> Result<ArrayRef, ArrowError> {
    match array.data_type() {
        DataType::Date32 => cast(cast(array, &DataType::Int32)?.as_ref(), &DataType::Int64),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Timestamp(_, _) => cast(array, &DataType::Int64),
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            cast(array, &DataType::Float64)
        }
        DataType::LargeUtf8 | DataType::Utf8View | DataType::Utf8 => cast(array, &DataType::Utf8),
        _ => Ok(array.slice(0, array.len())),
    }
}

/// Min/max/null-count statistics of one column in one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnStats {
    /// Smallest non-null value, if any and if the type is comparable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ScalarValue>,
    /// Largest non-null value, if any and if the type is comparable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ScalarValue>,
    /// Number of null values.
    pub null_count: u64,
}

impl ColumnStats {
    /// Compute statistics for one column in a single pass over the array.
    pub fn compute(array: &dyn Array) -> Result<Self, ArrowError> {
        let null_count = array.null_count() as u64;
        let normalized = normalize_for_compare(array)?;

        let (min, max) = match normalized.data_type() {
            DataType::Boolean => {
                let a = normalized.as_boolean();
                (
                    compute::min_boolean(a).map(ScalarValue::Boolean),
                    compute::max_boolean(a).map(ScalarValue::Boolean),
                )
            }
            DataType::Int64 => {
                let a = normalized.as_primitive::<Int64Type>();
                (
                    compute::min(a).map(ScalarValue::Int64),
                    compute::max(a).map(ScalarValue::Int64),
                )
            }
            DataType::Float64 => {
                // NaN carries no ordering information for pruning.
                let a = normalized.as_primitive::<Float64Type>();
                let bounds = a.iter().flatten().filter(|v| !v.is_nan()).fold(
                    None,
                    |acc: Option<(f64, f64)>, v| match acc {
                        None => Some((v, v)),
                        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                    },
                );
                match bounds {
                    Some((lo, hi)) => (
                        Some(ScalarValue::Float64(lo)),
                        Some(ScalarValue::Float64(hi)),
                    ),
                    None => (None, None),
                }
            }
            DataType::Utf8 => {
                let a = normalized.as_string::<i32>();
                (
                    compute::min_string(a).map(|s| ScalarValue::Utf8(s.to_string())),
                    compute::max_string(a).map(|s| ScalarValue::Utf8(s.to_string())),
                )
            }
            _ => (None, None),
        };

        Ok(Self {
            min,
            max,
            null_count,
        })
    }
}

/// Immutable descriptor of one data file.
///
/// JSON layout example (inside an `add` action):
/// `{"path":"_data/part-<uuid>.parquet","row_count":100,...}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataFile {
    /// Key relative to the table root.
    pub path: String,

    /// Rendered partition values, `None` for a null value.
    #[serde(default)]
    pub partition_values: BTreeMap<String, Option<String>>,

    /// Number of rows.
    pub row_count: u64,

    /// Encoded size in bytes.
    pub size_bytes: u64,

    /// Per-column statistics, keyed by column name.
    #[serde(default)]
    pub stats: BTreeMap<String, ColumnStats>,

    /// Version of the table schema the file was written with.
    pub schema_version: u64,

    /// BLAKE3 hash of the encoded bytes, hex.
    pub content_hash: String,

    /// Version of the commit that added the file. Stamped at commit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_version: Option<u64>,

    /// When the file was written.
    pub created_at: DateTime<Utc>,
}

impl DataFile {
    /// Statistics for `column`, if recorded.
    pub fn column_stats(&self, column: &str) -> Option<&ColumnStats> {
        self.stats.get(column)
    }

    /// Rendered partition value for `column`. The outer `Option` is `None`
    /// when `column` is not a partition column.
    pub fn partition_value(&self, column: &str) -> Option<Option<&str>> {
        self.partition_values.get(column).map(|v| v.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Date32Array, Float32Array, Int32Array, StringArray};

    use super::*;

    #[test]
    fn numeric_scalars_compare_across_types() {
        assert!(ScalarValue::Int64(3) < ScalarValue::Float64(3.5));
        assert_eq!(ScalarValue::Int64(2), ScalarValue::Float64(2.0));
        assert_eq!(
            ScalarValue::Utf8("a".into()).partial_cmp(&ScalarValue::Int64(1)),
            None
        );
    }

    #[test]
    fn mixed_numeric_comparison_is_exact_beyond_f64_precision() {
        // 2^53 + 1 rounds to 2^53 as a float.
        let int = ScalarValue::Int64(9_007_199_254_740_993);
        let float = ScalarValue::Float64(9_007_199_254_740_992.0);
        assert_eq!(int.partial_cmp(&float), Some(Ordering::Greater));
        assert_eq!(float.partial_cmp(&int), Some(Ordering::Less));
        assert_ne!(int, float);

        assert!(ScalarValue::Int64(i64::MAX) < ScalarValue::Float64(9.3e18));
        assert_eq!(
            ScalarValue::Int64(i64::MIN),
            ScalarValue::Float64(-9_223_372_036_854_775_808.0)
        );
        assert!(ScalarValue::Int64(-2) < ScalarValue::Float64(-1.5));
        assert!(ScalarValue::Int64(-1) > ScalarValue::Float64(-1.5));
        assert!(ScalarValue::Int64(0) < ScalarValue::Float64(f64::INFINITY));
        assert_eq!(
            ScalarValue::Int64(0).partial_cmp(&ScalarValue::Float64(f64::NAN)),
            None
        );
    }

    #[test]
    fn stats_skip_nulls_and_nan() {
        let ints: ArrayRef = Arc::new(Int32Array::from(vec![Some(5), None, Some(-2)]));
        let stats = ColumnStats::compute(ints.as_ref()).expect("stats");
        assert_eq!(stats.min, Some(ScalarValue::Int64(-2)));
        assert_eq!(stats.max, Some(ScalarValue::Int64(5)));
        assert_eq!(stats.null_count, 1);

        let floats: ArrayRef = Arc::new(Float32Array::from(vec![1.5, f32::NAN, 0.5]));
        let stats = ColumnStats::compute(floats.as_ref()).expect("stats");
        assert_eq!(stats.min, Some(ScalarValue::Float64(0.5)));
        assert_eq!(stats.max, Some(ScalarValue::Float64(1.5)));

        let strings: ArrayRef = Arc::new(StringArray::from(vec![None::<&str>, None]));
        let stats = ColumnStats::compute(strings.as_ref()).expect("stats");
        assert_eq!((stats.min, stats.max, stats.null_count), (None, None, 2));
    }

    #[test]
    fn dates_read_back_as_integers() {
        let dates = Date32Array::from(vec![Some(19_000), None]);
        assert_eq!(
            ScalarValue::from_array(&dates, 0).expect("scalar"),
            Some(ScalarValue::Int64(19_000))
        );
        assert_eq!(ScalarValue::from_array(&dates, 1).expect("scalar"), None);
        assert_eq!(
            ScalarValue::parse_partition("19000", &ColumnType::Date32),
            Some(ScalarValue::Int64(19_000))
        );
    }

    #[test]
    fn scalars_serialize_tagged() {
        let json = serde_json::to_string(&ScalarValue::Float64(1.0)).expect("serialize");
        assert_eq!(json, r#"{"float64":1.0}"#);
        let back: ScalarValue = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ScalarValue::Float64(1.0));
    }
}
