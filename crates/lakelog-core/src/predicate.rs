//! Row predicates.
//!
//! A [`Predicate`] is evaluated two ways:
//! - row by row against a `RecordBatch` ([`Predicate::evaluate`]), with SQL
//!   null semantics: a row matches only if the predicate is definitely true;
//! - conservatively against a [`DataFile`] ([`Predicate::may_match`]), using
//!   partition values and column statistics. `false` means no row of the file
//!   can match.

use std::{collections::BTreeSet, fmt};

use arrow::{
    array::{Array, ArrayRef, BooleanArray, RecordBatch, Scalar},
    compute::{
        self, and_kleene,
        kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
        or_kleene,
    },
    datatypes::DataType,
    error::ArrowError,
};
use serde::{Deserialize, Serialize};

use crate::{
    data_file::{normalize_for_compare, DataFile, ScalarValue},
    schema::Schema,
};

/// Comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CompareOp {
    fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ord == Equal,
            CompareOp::NotEq => ord != Equal,
            CompareOp::Lt => ord == Less,
            CompareOp::LtEq => ord != Greater,
            CompareOp::Gt => ord == Greater,
            CompareOp::GtEq => ord != Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        })
    }
}

/// A boolean row filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `column <op> value`
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        value: ScalarValue,
    },
    /// `column IS NULL`
    IsNull(String),
    /// `column IS NOT NULL`
    IsNotNull(String),
    /// `column IN (values...)`
    In {
        /// Column name.
        column: String,
        /// Candidate values.
        values: Vec<ScalarValue>,
    },
    /// Both sides hold.
    And(Box<Predicate>, Box<Predicate>),
    /// Either side holds.
    Or(Box<Predicate>, Box<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<ScalarValue>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    /// `column != value`
    pub fn not_eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::compare(column, CompareOp::NotEq, value)
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    /// `column <= value`
    pub fn lt_eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::compare(column, CompareOp::LtEq, value)
    }

    /// `column > value`
    pub fn gt(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    /// `column >= value`
    pub fn gt_eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::compare(column, CompareOp::GtEq, value)
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::IsNull(column.into())
    }

    /// `column IS NOT NULL`
    pub fn is_not_null(column: impl Into<String>) -> Self {
        Predicate::IsNotNull(column.into())
    }

    /// `column IN (values...)`
    pub fn in_list(column: impl Into<String>, values: Vec<ScalarValue>) -> Self {
        Predicate::In {
            column: column.into(),
            values,
        }
    }

    /// `self AND other`
    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// `NOT self`
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Every column the predicate references.
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::IsNull(column)
            | Predicate::IsNotNull(column)
            | Predicate::In { column, .. } => {
                out.insert(column.as_str());
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Predicate::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Evaluate against every row of `batch`.
    ///
    /// Columns absent from the batch read as nulls. The returned mask has no
    /// nulls: unknown results are `false`.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, ArrowError> {
        let mask = self.evaluate_kleene(batch)?;
        if mask.null_count() == 0 {
            return Ok(mask);
        }
        Ok(mask.iter().map(|v| Some(v.unwrap_or(false))).collect())
    }

    fn evaluate_kleene(&self, batch: &RecordBatch) -> Result<BooleanArray, ArrowError> {
        let rows = batch.num_rows();
        match self {
            Predicate::Compare { column, op, value } => match batch.column_by_name(column) {
                Some(array) => compare_array(array, *op, value),
                None => Ok(all_null(rows)),
            },
            Predicate::IsNull(column) => match batch.column_by_name(column) {
                Some(array) => compute::is_null(array.as_ref()),
                None => Ok(BooleanArray::from(vec![true; rows])),
            },
            Predicate::IsNotNull(column) => match batch.column_by_name(column) {
                Some(array) => compute::is_not_null(array.as_ref()),
                None => Ok(BooleanArray::from(vec![false; rows])),
            },
            Predicate::In { column, values } => {
                let Some(array) = batch.column_by_name(column) else {
                    return Ok(all_null(rows));
                };
                let mut acc = BooleanArray::from(vec![false; rows]);
                for value in values {
                    let hit = compare_array(array, CompareOp::Eq, value)?;
                    acc = or_kleene(&acc, &hit)?;
                }
                Ok(acc)
            }
            Predicate::And(a, b) => and_kleene(&a.evaluate_kleene(batch)?, &b.evaluate_kleene(batch)?),
            Predicate::Or(a, b) => or_kleene(&a.evaluate_kleene(batch)?, &b.evaluate_kleene(batch)?),
            Predicate::Not(inner) => compute::not(&inner.evaluate_kleene(batch)?),
        }
    }

    /// Whether any row of `file` could satisfy the predicate.
    pub fn may_match(&self, file: &DataFile, schema: &Schema) -> bool {
        self.file_outcomes(file, schema).can_be_true
    }

    fn file_outcomes(&self, file: &DataFile, schema: &Schema) -> Outcomes {
        match self {
            Predicate::Compare { column, op, value } => {
                compare_outcomes(file, schema, column, *op, value)
            }
            Predicate::IsNull(column) => null_outcomes(file, schema, column),
            Predicate::IsNotNull(column) => null_outcomes(file, schema, column).negate(),
            Predicate::In { column, values } => values.iter().fold(Outcomes::never(), |acc, v| {
                acc.or(compare_outcomes(file, schema, column, CompareOp::Eq, v))
            }),
            Predicate::And(a, b) => a.file_outcomes(file, schema).and(b.file_outcomes(file, schema)),
            Predicate::Or(a, b) => a.file_outcomes(file, schema).or(b.file_outcomes(file, schema)),
            Predicate::Not(inner) => inner.file_outcomes(file, schema).negate(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => write!(f, "{column} {op} {value}"),
            Predicate::IsNull(column) => write!(f, "{column} IS NULL"),
            Predicate::IsNotNull(column) => write!(f, "{column} IS NOT NULL"),
            Predicate::In { column, values } => {
                write!(f, "{column} IN (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Predicate::And(a, b) => write!(f, "({a} AND {b})"),
            Predicate::Or(a, b) => write!(f, "({a} OR {b})"),
            Predicate::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn all_null(rows: usize) -> BooleanArray {
    BooleanArray::from(vec![None::<bool>; rows])
}

fn compare_array(
    array: &ArrayRef,
    op: CompareOp,
    value: &ScalarValue,
) -> Result<BooleanArray, ArrowError> {
    let left = normalize_for_compare(array.as_ref())?;
    let mut right = value.to_array();

    let (left, right) = if left.data_type() == right.data_type() {
        (left, right)
    } else if left.data_type().is_numeric() && right.data_type().is_numeric() {
        right = compute::cast(&right, &DataType::Float64)?;
        (compute::cast(&left, &DataType::Float64)?, right)
    } else if left.data_type() == &DataType::Null {
        return Ok(all_null(array.len()));
    } else {
        return Err(ArrowError::InvalidArgumentError(format!(
            "cannot compare {} column with {value}",
            array.data_type()
        )));
    };

    let right = Scalar::new(right);
    match op {
        CompareOp::Eq => eq(&left, &right),
        CompareOp::NotEq => neq(&left, &right),
        CompareOp::Lt => lt(&left, &right),
        CompareOp::LtEq => lt_eq(&left, &right),
        CompareOp::Gt => gt(&left, &right),
        CompareOp::GtEq => gt_eq(&left, &right),
    }
}

/// Which truth values a predicate can take on some row of a file. A null
/// result counts as "not true".
#[derive(Debug, Clone, Copy)]
struct Outcomes {
    can_be_true: bool,
    can_be_other: bool,
}

impl Outcomes {
    const UNKNOWN: Outcomes = Outcomes {
        can_be_true: true,
        can_be_other: true,
    };

    fn never() -> Self {
        Outcomes {
            can_be_true: false,
            can_be_other: true,
        }
    }

    fn exact(value: bool) -> Self {
        Outcomes {
            can_be_true: value,
            can_be_other: !value,
        }
    }

    fn and(self, other: Outcomes) -> Self {
        Outcomes {
            can_be_true: self.can_be_true && other.can_be_true,
            can_be_other: self.can_be_other || other.can_be_other,
        }
    }

    fn or(self, other: Outcomes) -> Self {
        Outcomes {
            can_be_true: self.can_be_true || other.can_be_true,
            can_be_other: self.can_be_other && other.can_be_other,
        }
    }

    fn negate(self) -> Self {
        Outcomes {
            can_be_true: self.can_be_other,
            can_be_other: self.can_be_true,
        }
    }
}

/// Partition value of `column` as a scalar. Outer `None`: not a partition
/// column (or unparsable); inner `None`: null partition.
fn partition_scalar(
    file: &DataFile,
    schema: &Schema,
    column: &str,
) -> Option<Option<ScalarValue>> {
    let rendered = file.partition_value(column)?;
    let column_type = &schema.column(column)?.data_type;
    match rendered {
        None => Some(None),
        Some(s) => ScalarValue::parse_partition(s, column_type).map(Some),
    }
}

fn compare_outcomes(
    file: &DataFile,
    schema: &Schema,
    column: &str,
    op: CompareOp,
    value: &ScalarValue,
) -> Outcomes {
    if let Some(partition) = partition_scalar(file, schema, column) {
        return match partition.and_then(|p| p.partial_cmp(value)) {
            Some(ord) => Outcomes::exact(op.holds(ord)),
            None => Outcomes::never(),
        };
    }

    // A column without statistics was absent when the file was written.
    let Some(stats) = file.column_stats(column) else {
        return Outcomes::never();
    };
    if stats.null_count >= file.row_count {
        return Outcomes::never();
    }
    let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
        return Outcomes::UNKNOWN;
    };
    let (Some(min_ord), Some(max_ord)) = (min.partial_cmp(value), max.partial_cmp(value)) else {
        return Outcomes::UNKNOWN;
    };

    use std::cmp::Ordering::*;
    let has_nulls = stats.null_count > 0;
    let (can_be_true, can_be_false) = match op {
        CompareOp::Eq => (
            min_ord != Greater && max_ord != Less,
            !(min_ord == Equal && max_ord == Equal),
        ),
        CompareOp::NotEq => (
            !(min_ord == Equal && max_ord == Equal),
            min_ord != Greater && max_ord != Less,
        ),
        CompareOp::Lt => (min_ord == Less, max_ord != Less),
        CompareOp::LtEq => (min_ord != Greater, max_ord == Greater),
        CompareOp::Gt => (max_ord == Greater, min_ord != Greater),
        CompareOp::GtEq => (max_ord != Less, min_ord == Less),
    };
    Outcomes {
        can_be_true,
        can_be_other: can_be_false || has_nulls,
    }
}

fn null_outcomes(file: &DataFile, schema: &Schema, column: &str) -> Outcomes {
    if let Some(partition) = partition_scalar(file, schema, column) {
        return Outcomes::exact(partition.is_none());
    }
    match file.column_stats(column) {
        Some(stats) => Outcomes {
            can_be_true: stats.null_count > 0,
            can_be_other: stats.null_count < file.row_count,
        },
        None => Outcomes::exact(true),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use arrow::{
        array::{Int32Array, StringArray},
        datatypes::{Field, Schema as ArrowSchema},
    };
    use chrono::Utc;

    use super::*;
    use crate::{
        data_file::ColumnStats,
        schema::{Column, ColumnType},
    };

    fn batch() -> RecordBatch {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3, 4])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c"), Some("d")])),
            ],
        )
        .expect("batch")
    }

    fn mask(p: &Predicate) -> Vec<bool> {
        p.evaluate(&batch())
            .expect("evaluate")
            .iter()
            .map(|v| v.unwrap_or(false))
            .collect()
    }

    #[test]
    fn evaluates_comparisons_with_null_semantics() {
        assert_eq!(mask(&Predicate::gt("id", 2)), vec![false, false, true, true]);
        assert_eq!(mask(&Predicate::gt("id", 2.5)), vec![false, false, true, true]);
        assert_eq!(
            mask(&Predicate::not_eq("name", "a")),
            vec![false, false, true, true]
        );
        // NOT over a null stays unknown, so the null row never matches.
        assert_eq!(
            mask(&Predicate::eq("name", "a").not()),
            vec![false, false, true, true]
        );
        assert_eq!(mask(&Predicate::is_null("name")), vec![false, true, false, false]);
        assert_eq!(
            mask(&Predicate::in_list("id", vec![1.into(), 4.into()]).or(Predicate::is_null("name"))),
            vec![true, true, false, true]
        );
        assert_eq!(mask(&Predicate::eq("missing", 1)), vec![false; 4]);
    }

    #[test]
    fn mismatched_comparison_is_an_error() {
        assert!(Predicate::eq("id", "x").evaluate(&batch()).is_err());
    }

    fn file(partition: Option<&str>, min: i64, max: i64, nulls: u64) -> DataFile {
        let mut stats = BTreeMap::new();
        stats.insert(
            "id".to_string(),
            ColumnStats {
                min: Some(ScalarValue::Int64(min)),
                max: Some(ScalarValue::Int64(max)),
                null_count: nulls,
            },
        );
        let mut partition_values = BTreeMap::new();
        partition_values.insert("region".to_string(), partition.map(str::to_string));
        DataFile {
            path: "_data/x.parquet".to_string(),
            partition_values,
            row_count: 10,
            size_bytes: 100,
            stats,
            schema_version: 0,
            content_hash: String::new(),
            created_version: None,
            created_at: Utc::now(),
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Int64, true),
            Column::new("region", ColumnType::Utf8, true),
            Column::new("later", ColumnType::Int64, true),
        ])
        .expect("schema")
    }

    #[test]
    fn pruning_uses_stats_and_partitions() {
        let s = schema();
        let f = file(Some("eu"), 10, 20, 0);

        assert!(Predicate::eq("id", 15).may_match(&f, &s));
        assert!(!Predicate::eq("id", 25).may_match(&f, &s));
        assert!(!Predicate::lt("id", 10).may_match(&f, &s));
        assert!(Predicate::lt_eq("id", 10).may_match(&f, &s));
        assert!(!Predicate::eq("region", "us").may_match(&f, &s));
        assert!(Predicate::eq("region", "eu").may_match(&f, &s));
        assert!(!Predicate::is_null("region").may_match(&f, &s));
        assert!(!Predicate::eq("later", 1).may_match(&f, &s));
        assert!(Predicate::is_null("later").may_match(&f, &s));

        // NOT(id >= 10) can only match rows below 10 or nulls.
        assert!(!Predicate::gt_eq("id", 10).not().may_match(&f, &s));
        let with_nulls = file(None, 10, 20, 3);
        assert!(Predicate::is_null("region").may_match(&with_nulls, &s));
        assert!(Predicate::is_null("id").may_match(&with_nulls, &s));
    }

    #[test]
    fn display_renders_audit_string() {
        let p = Predicate::eq("region", "o'k").and(Predicate::in_list("id", vec![1.into(), 2.into()]));
        assert_eq!(p.to_string(), "(region = 'o''k' AND id IN (1, 2))");
    }
}
