//! Table schemas and the schema registry rules.
//!
//! A [`Schema`] is the ordered list of columns stored in the transaction log
//! together with a monotonically increasing version. Evolution is restricted to
//! additive and widening changes:
//!
//! - [`evolution::validate`] checks an incoming batch schema against the table
//!   schema and returns the (possibly evolved) schema to write with.
//! - [`evolution::validate_replacement`] checks an explicit schema change.
//! - [`infer::infer_schema`] materializes a schema from an Arrow schema using
//!   the numeric promotion lattice in [`infer::common_supertype`].

use std::{collections::HashSet, fmt, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub mod evolution;
pub mod infer;

pub use evolution::{check_non_null, validate, validate_replacement};
pub use infer::{common_supertype, infer_common_schema, infer_schema};

/// Timestamp precision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TimestampUnit {
    /// Second precision.
    Seconds,
    /// Millisecond precision.
    Millis,
    /// Microsecond precision.
    Micros,
    /// Nanosecond precision.
    Nanos,
}

impl TimestampUnit {
    fn to_arrow(self) -> TimeUnit {
        match self {
            TimestampUnit::Seconds => TimeUnit::Second,
            TimestampUnit::Millis => TimeUnit::Millisecond,
            TimestampUnit::Micros => TimeUnit::Microsecond,
            TimestampUnit::Nanos => TimeUnit::Nanosecond,
        }
    }

    fn from_arrow(unit: &TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => TimestampUnit::Seconds,
            TimeUnit::Millisecond => TimestampUnit::Millis,
            TimeUnit::Microsecond => TimestampUnit::Micros,
            TimeUnit::Nanosecond => TimestampUnit::Nanos,
        }
    }
}

impl fmt::Display for TimestampUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampUnit::Seconds => write!(f, "s"),
            TimestampUnit::Millis => write!(f, "ms"),
            TimestampUnit::Micros => write!(f, "us"),
            TimestampUnit::Nanos => write!(f, "ns"),
        }
    }
}

/// Column types a table can store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Boolean value.
    Boolean,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 encoded string.
    Utf8,
    /// Variable-length binary data.
    Binary,
    /// Days since the UNIX epoch.
    Date32,
    /// Timestamp value with a precision unit and optional timezone.
    Timestamp {
        /// Timestamp precision unit.
        unit: TimestampUnit,
        /// Optional IANA timezone identifier.
        timezone: Option<String>,
    },
}

impl ColumnType {
    /// Arrow type used to materialize this column.
    pub fn to_arrow(&self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Binary => DataType::Binary,
            ColumnType::Date32 => DataType::Date32,
            ColumnType::Timestamp { unit, timezone } => DataType::Timestamp(
                unit.to_arrow(),
                timezone.as_ref().map(|tz| Arc::<str>::from(tz.as_str())),
            ),
        }
    }

    /// Map an Arrow type onto a column type.
    ///
    /// Small integer types map losslessly onto `Int32`/`Int64`, and the large
    /// or view string/binary layouts onto `Utf8`/`Binary`. Returns `None` for
    /// anything else.
    pub fn from_arrow(data_type: &DataType) -> Option<Self> {
        Some(match data_type {
            DataType::Boolean => ColumnType::Boolean,
            DataType::Int8 | DataType::Int16 | DataType::Int32 => ColumnType::Int32,
            DataType::UInt8 | DataType::UInt16 => ColumnType::Int32,
            DataType::Int64 | DataType::UInt32 => ColumnType::Int64,
            DataType::Float16 | DataType::Float32 => ColumnType::Float32,
            DataType::Float64 => ColumnType::Float64,
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => ColumnType::Utf8,
            DataType::Binary | DataType::LargeBinary | DataType::BinaryView => ColumnType::Binary,
            DataType::Date32 => ColumnType::Date32,
            DataType::Timestamp(unit, tz) => ColumnType::Timestamp {
                unit: TimestampUnit::from_arrow(unit),
                timezone: tz.as_ref().map(|tz| tz.to_string()),
            },
            _ => return None,
        })
    }

    /// True for 32- and 64-bit integers.
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Int32 | ColumnType::Int64)
    }

    /// True for 32- and 64-bit floats.
    pub fn is_float(&self) -> bool {
        matches!(self, ColumnType::Float32 | ColumnType::Float64)
    }

    /// Types allowed as partition columns.
    pub fn is_partitionable(&self) -> bool {
        matches!(
            self,
            ColumnType::Boolean
                | ColumnType::Int32
                | ColumnType::Int64
                | ColumnType::Utf8
                | ColumnType::Date32
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "bool"),
            ColumnType::Int32 => write!(f, "int32"),
            ColumnType::Int64 => write!(f, "int64"),
            ColumnType::Float32 => write!(f, "float32"),
            ColumnType::Float64 => write!(f, "float64"),
            ColumnType::Utf8 => write!(f, "utf8"),
            ColumnType::Binary => write!(f, "binary"),
            ColumnType::Date32 => write!(f, "date32"),
            ColumnType::Timestamp { unit, timezone } => match timezone {
                Some(tz) => write!(f, "timestamp[{unit}]({tz})"),
                None => write!(f, "timestamp[{unit}]"),
            },
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type.
    pub data_type: ColumnType,
    /// Whether the column allows null values.
    pub nullable: bool,
}

impl Column {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    fn to_arrow_field(&self) -> Field {
        Field::new(self.name.clone(), self.data_type.to_arrow(), self.nullable)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?: {}", self.name, self.data_type)
        } else {
            write!(f, "{}: {}", self.name, self.data_type)
        }
    }
}

/// Ordered table columns plus the schema version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    version: u64,
    columns: Vec<Column>,
}

impl Schema {
    /// Build a version-0 schema, rejecting duplicate column names.
    pub fn new(columns: Vec<Column>) -> SchemaResult<Self> {
        let mut seen = HashSet::new();
        for col in &columns {
            ensure!(
                seen.insert(col.name.as_str()),
                DuplicateColumnSnafu {
                    column: col.name.clone(),
                }
            );
        }
        Ok(Self {
            version: 0,
            columns,
        })
    }

    /// Schema version. Bumped on every accepted change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Columns in their defined order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Same columns, explicit version.
    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Convert to an owned Arrow schema.
    pub fn to_arrow_schema(&self) -> ArrowSchema {
        ArrowSchema::new(
            self.columns
                .iter()
                .map(Column::to_arrow_field)
                .collect::<Vec<_>>(),
        )
    }

    /// Convert to a shared Arrow schema.
    pub fn to_arrow_schema_ref(&self) -> SchemaRef {
        Arc::new(self.to_arrow_schema())
    }

    /// True if both schemas have the same columns, ignoring the version.
    pub fn same_columns(&self, other: &Schema) -> bool {
        self.columns == other.columns
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} {{", self.version)?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{col}")?;
        }
        write!(f, "}}")
    }
}

/// The compatibility rule a schema change violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaRule {
    /// Types differ and neither widens into the other.
    TypeMismatch {
        /// Type recorded in the table schema.
        table: ColumnType,
        /// Type offered by the incoming data or target schema.
        incoming: ColumnType,
    },
    /// The change would narrow a column type.
    TypeNarrowing {
        /// Current type.
        from: ColumnType,
        /// Requested narrower type.
        to: ColumnType,
    },
    /// A non-nullable column is absent from incoming data.
    MissingRequiredColumn,
    /// A column is absent from a replacement schema.
    ColumnRemoved,
    /// A nullable column would become non-nullable without proof.
    NullabilityTightening,
    /// Columns added by a schema change must be nullable.
    NewColumnNotNullable,
    /// Incoming data holds nulls in a non-nullable column.
    NullValues {
        /// Number of offending rows.
        count: usize,
    },
}

impl fmt::Display for SchemaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaRule::TypeMismatch { table, incoming } => {
                write!(f, "type mismatch: table has {table}, incoming has {incoming}")
            }
            SchemaRule::TypeNarrowing { from, to } => {
                write!(f, "type narrowing from {from} to {to} is not allowed")
            }
            SchemaRule::MissingRequiredColumn => write!(f, "non-nullable column is missing"),
            SchemaRule::ColumnRemoved => write!(f, "column removal is not allowed"),
            SchemaRule::NullabilityTightening => {
                write!(f, "nullable column cannot become non-nullable without proof")
            }
            SchemaRule::NewColumnNotNullable => write!(f, "new columns must be nullable"),
            SchemaRule::NullValues { count } => {
                write!(f, "{count} null value(s) in a non-nullable column")
            }
        }
    }
}

/// Errors raised by the schema registry.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// A change or a batch violates a compatibility rule.
    #[snafu(display("Schema incompatible at column {column}: {rule}"))]
    Incompatible {
        /// Offending column.
        column: String,
        /// Violated rule.
        rule: SchemaRule,
    },

    /// Duplicate column names are not allowed.
    #[snafu(display("Duplicate column name: {column}"))]
    DuplicateColumn {
        /// The duplicate column name.
        column: String,
    },

    /// The Arrow type cannot be stored in a table.
    #[snafu(display("Unsupported type for column {column}: {data_type}"))]
    UnsupportedType {
        /// Column name.
        column: String,
        /// Rendered Arrow type.
        data_type: String,
    },
}

/// A convenience type alias for schema registry results.
pub type SchemaResult<T> = Result<T, SchemaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = Schema::new(vec![
            Column::new("a", ColumnType::Int32, false),
            Column::new("a", ColumnType::Utf8, true),
        ])
        .expect_err("duplicate");
        assert_eq!(
            err,
            SchemaError::DuplicateColumn {
                column: "a".to_string()
            }
        );
    }

    #[test]
    fn arrow_conversion_keeps_order_and_nullability() {
        let schema = Schema::new(vec![
            Column::new("id", ColumnType::Int64, false),
            Column::new(
                "ts",
                ColumnType::Timestamp {
                    unit: TimestampUnit::Micros,
                    timezone: Some("UTC".to_string()),
                },
                true,
            ),
        ])
        .expect("valid schema");

        let arrow = schema.to_arrow_schema();
        assert_eq!(arrow.field(0).name(), "id");
        assert!(!arrow.field(0).is_nullable());
        assert_eq!(
            arrow.field(1).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert_eq!(schema.to_string(), "v0 {id: int64, ts?: timestamp[us](UTC)}");
    }

    #[test]
    fn schema_serializes_with_version() {
        let schema = Schema::new(vec![Column::new("x", ColumnType::Float64, true)])
            .expect("valid schema")
            .with_version(3);
        let json = serde_json::to_string(&schema).expect("serialize");
        let back: Schema = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, schema);
        assert_eq!(back.version(), 3);
    }
}
