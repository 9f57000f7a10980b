//! Schema validation and evolution.
//!
//! Promotion lattice: `Int32 -> Int64 -> Float64` and `Float32 -> Float64`.
//! Any other type change is rejected.

use std::collections::HashSet;

use arrow::{array::RecordBatch, datatypes::Schema as ArrowSchema};

use crate::schema::{
    Column, ColumnType, DuplicateColumnSnafu, IncompatibleSnafu, Schema, SchemaResult, SchemaRule,
    UnsupportedTypeSnafu,
};

/// True if values of `from` convert losslessly to `to` along the lattice
/// (including `from == to`).
pub fn widens_to(from: &ColumnType, to: &ColumnType) -> bool {
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (ColumnType::Int32, ColumnType::Int64)
            | (ColumnType::Int32, ColumnType::Float64)
            | (ColumnType::Int64, ColumnType::Float64)
            | (ColumnType::Float32, ColumnType::Float64)
    )
}

fn incompatible<T>(column: &str, rule: SchemaRule) -> SchemaResult<T> {
    IncompatibleSnafu {
        column: column.to_string(),
        rule,
    }
    .fail()
}

/// Validate an incoming batch schema against the table schema.
///
/// Returns the schema to write with:
/// - new incoming columns are appended as nullable;
/// - an incoming type wider than the table type widens the column;
/// - a narrower incoming type is up-cast on write and leaves the schema alone;
/// - a missing nullable column is null-filled, a missing non-nullable one is
///   rejected.
///
/// The returned schema carries a bumped version iff it differs from
/// `existing`. Nulls in non-nullable columns are checked separately by
/// [`check_non_null`], once the data is aligned.
pub fn validate(existing: &Schema, incoming: &ArrowSchema) -> SchemaResult<Schema> {
    let mut seen = HashSet::new();
    for field in incoming.fields() {
        if !seen.insert(field.name().as_str()) {
            return DuplicateColumnSnafu {
                column: field.name().clone(),
            }
            .fail();
        }
    }

    let mut columns: Vec<Column> = Vec::with_capacity(existing.columns().len());
    for col in existing.columns() {
        let Some(field) = incoming.field_with_name(&col.name).ok() else {
            if !col.nullable {
                return incompatible(&col.name, SchemaRule::MissingRequiredColumn);
            }
            columns.push(col.clone());
            continue;
        };

        let incoming_type = ColumnType::from_arrow(field.data_type()).ok_or_else(|| {
            UnsupportedTypeSnafu {
                column: col.name.clone(),
                data_type: field.data_type().to_string(),
            }
            .build()
        })?;

        let data_type = if widens_to(&incoming_type, &col.data_type) {
            col.data_type.clone()
        } else if widens_to(&col.data_type, &incoming_type) {
            incoming_type
        } else {
            return incompatible(
                &col.name,
                SchemaRule::TypeMismatch {
                    table: col.data_type.clone(),
                    incoming: incoming_type,
                },
            );
        };

        columns.push(Column {
            name: col.name.clone(),
            data_type,
            nullable: col.nullable,
        });
    }

    for field in incoming.fields() {
        if existing.column(field.name()).is_some() {
            continue;
        }
        let data_type = ColumnType::from_arrow(field.data_type()).ok_or_else(|| {
            UnsupportedTypeSnafu {
                column: field.name().clone(),
                data_type: field.data_type().to_string(),
            }
            .build()
        })?;
        columns.push(Column::new(field.name().clone(), data_type, true));
    }

    Ok(next_version(existing, columns))
}

/// Validate an explicit replacement of the table schema.
///
/// `proven_non_null` lists columns whose existing data has been shown to hold
/// no nulls, which is the only way a nullable column may become non-nullable.
pub fn validate_replacement(
    existing: &Schema,
    target: &[Column],
    proven_non_null: &[String],
) -> SchemaResult<Schema> {
    let mut seen = HashSet::new();
    for col in target {
        if !seen.insert(col.name.as_str()) {
            return DuplicateColumnSnafu {
                column: col.name.clone(),
            }
            .fail();
        }
    }

    for col in existing.columns() {
        let Some(next) = target.iter().find(|c| c.name == col.name) else {
            return incompatible(&col.name, SchemaRule::ColumnRemoved);
        };

        if !widens_to(&col.data_type, &next.data_type) {
            let rule = if widens_to(&next.data_type, &col.data_type) {
                SchemaRule::TypeNarrowing {
                    from: col.data_type.clone(),
                    to: next.data_type.clone(),
                }
            } else {
                SchemaRule::TypeMismatch {
                    table: col.data_type.clone(),
                    incoming: next.data_type.clone(),
                }
            };
            return incompatible(&col.name, rule);
        }

        if col.nullable && !next.nullable && !proven_non_null.contains(&col.name) {
            return incompatible(&col.name, SchemaRule::NullabilityTightening);
        }
    }

    for col in target {
        if existing.column(&col.name).is_none() && !col.nullable {
            return incompatible(&col.name, SchemaRule::NewColumnNotNullable);
        }
    }

    Ok(next_version(existing, target.to_vec()))
}

/// Reject nulls in non-nullable columns of an aligned batch.
pub fn check_non_null(schema: &Schema, batch: &RecordBatch) -> SchemaResult<()> {
    for col in schema.columns().iter().filter(|c| !c.nullable) {
        let count = match batch.column_by_name(&col.name) {
            Some(array) => array.null_count(),
            None => batch.num_rows(),
        };
        if count > 0 {
            return incompatible(&col.name, SchemaRule::NullValues { count });
        }
    }
    Ok(())
}

fn next_version(existing: &Schema, columns: Vec<Column>) -> Schema {
    if columns == existing.columns() {
        existing.clone()
    } else {
        Schema {
            version: existing.version() + 1,
            columns,
        }
    }
}
