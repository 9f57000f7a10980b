//! Explicit schema inference.
//!
//! Nothing is inferred implicitly: a caller that wants a schema derived from
//! sample data asks for it here and gets back a materialized [`Schema`].

use std::collections::HashSet;

use arrow::datatypes::Schema as ArrowSchema;

use crate::schema::{
    Column, ColumnType, DuplicateColumnSnafu, IncompatibleSnafu, Schema, SchemaResult, SchemaRule,
    UnsupportedTypeSnafu,
};

/// Materialize a table schema from an Arrow schema.
///
/// Each field maps through [`ColumnType::from_arrow`]; nullability is kept.
pub fn infer_schema(arrow: &ArrowSchema) -> SchemaResult<Schema> {
    let mut columns = Vec::with_capacity(arrow.fields().len());
    for field in arrow.fields() {
        let data_type = ColumnType::from_arrow(field.data_type()).ok_or_else(|| {
            UnsupportedTypeSnafu {
                column: field.name().clone(),
                data_type: field.data_type().to_string(),
            }
            .build()
        })?;
        columns.push(Column::new(field.name().clone(), data_type, field.is_nullable()));
    }
    Schema::new(columns)
}

/// The narrowest type both `a` and `b` convert to losslessly.
///
/// Total over numeric types:
/// - int + int gives the widest int;
/// - int + float gives `Float64`;
/// - `Float32` + `Float64` gives `Float64`.
///
/// Identical types return themselves; any other mix returns `None`.
pub fn common_supertype(a: &ColumnType, b: &ColumnType) -> Option<ColumnType> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (x, y) if x.is_integer() && y.is_integer() => Some(ColumnType::Int64),
        (x, y) if (x.is_integer() || x.is_float()) && (y.is_integer() || y.is_float()) => {
            Some(ColumnType::Float64)
        }
        _ => None,
    }
}

/// Infer one schema covering several sample schemas.
///
/// Columns keep first-seen order. A column absent from some sample becomes
/// nullable; differing types resolve through [`common_supertype`].
pub fn infer_common_schema(samples: &[&ArrowSchema]) -> SchemaResult<Schema> {
    let mut columns: Vec<Column> = Vec::new();
    let mut seen_in: Vec<usize> = Vec::new();

    for sample in samples {
        let mut names = HashSet::new();
        for field in sample.fields() {
            if !names.insert(field.name().as_str()) {
                return DuplicateColumnSnafu {
                    column: field.name().clone(),
                }
                .fail();
            }
        }

        let inferred = infer_schema(sample)?;
        for col in inferred.columns {
            match columns.iter().position(|c| c.name == col.name) {
                Some(idx) => {
                    let current = &mut columns[idx];
                    let merged = common_supertype(&current.data_type, &col.data_type)
                        .ok_or_else(|| {
                            IncompatibleSnafu {
                                column: col.name.clone(),
                                rule: SchemaRule::TypeMismatch {
                                    table: current.data_type.clone(),
                                    incoming: col.data_type.clone(),
                                },
                            }
                            .build()
                        })?;
                    current.data_type = merged;
                    current.nullable |= col.nullable;
                    seen_in[idx] += 1;
                }
                None => {
                    columns.push(col);
                    seen_in.push(1);
                }
            }
        }
    }

    for (col, seen) in columns.iter_mut().zip(&seen_in) {
        if *seen < samples.len() {
            col.nullable = true;
        }
    }

    Schema::new(columns)
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::{DataType, Field};

    use super::*;
    use crate::schema::SchemaError;

    #[test]
    fn promotion_lattice_is_total_over_numerics() {
        use ColumnType::*;
        assert_eq!(common_supertype(&Int32, &Int64), Some(Int64));
        assert_eq!(common_supertype(&Int32, &Float32), Some(Float64));
        assert_eq!(common_supertype(&Float32, &Float64), Some(Float64));
        assert_eq!(common_supertype(&Int64, &Int64), Some(Int64));
        assert_eq!(common_supertype(&Utf8, &Int32), None);
        assert_eq!(common_supertype(&Boolean, &Date32), None);
    }

    #[test]
    fn infer_maps_small_ints_and_rejects_nested_types() {
        let arrow = ArrowSchema::new(vec![
            Field::new("a", DataType::Int16, false),
            Field::new("b", DataType::LargeUtf8, true),
        ]);
        let schema = infer_schema(&arrow).expect("supported");
        assert_eq!(schema.columns()[0].data_type, ColumnType::Int32);
        assert_eq!(schema.columns()[1].data_type, ColumnType::Utf8);

        let nested = ArrowSchema::new(vec![Field::new(
            "l",
            DataType::List(std::sync::Arc::new(Field::new("item", DataType::Int32, true))),
            true,
        )]);
        assert!(matches!(
            infer_schema(&nested),
            Err(SchemaError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn common_schema_unions_columns() {
        let a = ArrowSchema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("x", DataType::Float32, false),
        ]);
        let b = ArrowSchema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("y", DataType::Utf8, false),
        ]);

        let schema = infer_common_schema(&[&a, &b]).expect("compatible samples");
        let cols = schema.columns();
        assert_eq!(cols[0], Column::new("id", ColumnType::Int64, false));
        assert_eq!(cols[1], Column::new("x", ColumnType::Float32, true));
        assert_eq!(cols[2], Column::new("y", ColumnType::Utf8, true));

        let c = ArrowSchema::new(vec![Field::new("id", DataType::Utf8, false)]);
        assert!(infer_common_schema(&[&a, &c]).is_err());
    }
}
