//! Translation of row changes into parameterised SQL for the target store.
//!
//! Rows are written with the source relation's column order. Unchanged TOAST
//! columns are left out of the generated statement entirely, never written
//! as NULL. Updates and deletes are keyed by the relation's replica identity
//! columns, or by the whole old row for `REPLICA IDENTITY FULL`.

use chrono::{DateTime, Utc};
use pg_escape::quote_identifier;
use tokio_postgres::types::PgLsn;

use crate::postgres::types::{ColumnSchema, Oid, OldTuple, RelationSchema, TupleData};
use crate::postgres::values::{Cell, ColumnValue, TypeRegistry};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Truncate,
    /// Records the source commit position against the replication origin.
    OriginAdvance,
}

/// One statement queued for the next grouped write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOperation {
    pub kind: OperationKind,
    pub relation_id: Option<Oid>,
    pub sql: String,
    pub params: Vec<Option<Cell>>,
}

impl WriteOperation {
    pub fn insert(schema: &RelationSchema, registry: &TypeRegistry, tuple: &TupleData) -> Result<Self> {
        let values = materialize(schema, registry, tuple)?;
        let mut params = Params::new(registry);
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());

        for (column, value) in schema.columns.iter().zip(&values) {
            if let Some(param) = value.to_param() {
                columns.push(quote_identifier(&column.name).into_owned());
                placeholders.push(params.push(column, param));
            }
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", schema.qualified_name())
        } else {
            // Identity columns carry the source's generated values.
            format!(
                "INSERT INTO {} ({}) OVERRIDING SYSTEM VALUE VALUES ({})",
                schema.qualified_name(),
                columns.join(", "),
                placeholders.join(", ")
            )
        };

        Ok(Self {
            kind: OperationKind::Insert,
            relation_id: Some(schema.relation_id),
            sql,
            params: params.into_values(),
        })
    }

    /// Returns `None` when every column of the new row is unchanged.
    pub fn update(
        schema: &RelationSchema,
        registry: &TypeRegistry,
        old: Option<&OldTuple>,
        new: &TupleData,
    ) -> Result<Option<Self>> {
        let new_values = materialize(schema, registry, new)?;
        let mut params = Params::new(registry);
        let mut assignments = Vec::with_capacity(new_values.len());

        for (column, value) in schema.columns.iter().zip(&new_values) {
            if let Some(param) = value.to_param() {
                let placeholder = params.push(column, param);
                assignments.push(format!("{} = {}", quote_identifier(&column.name), placeholder));
            }
        }
        if assignments.is_empty() {
            return Ok(None);
        }

        let predicate = match old {
            Some(old) => {
                let old_values = materialize(schema, registry, old.tuple())?;
                identity_predicate(schema, &old_values, &mut params, "UPDATE")?
            }
            None if schema.has_key_columns() => {
                identity_predicate(schema, &new_values, &mut params, "UPDATE")?
            }
            None => {
                return Err(Error::MissingIdentity {
                    relation: schema.qualified_name(),
                    operation: "UPDATE",
                })
            }
        };

        Ok(Some(Self {
            kind: OperationKind::Update,
            relation_id: Some(schema.relation_id),
            sql: format!(
                "UPDATE {} SET {} WHERE {}",
                schema.qualified_name(),
                assignments.join(", "),
                predicate
            ),
            params: params.into_values(),
        }))
    }

    pub fn delete(schema: &RelationSchema, registry: &TypeRegistry, old: &OldTuple) -> Result<Self> {
        let old_values = materialize(schema, registry, old.tuple())?;
        let mut params = Params::new(registry);
        let predicate = identity_predicate(schema, &old_values, &mut params, "DELETE")?;

        Ok(Self {
            kind: OperationKind::Delete,
            relation_id: Some(schema.relation_id),
            sql: format!("DELETE FROM {} WHERE {}", schema.qualified_name(), predicate),
            params: params.into_values(),
        })
    }

    pub fn truncate(schemas: &[&RelationSchema], cascade: bool, restart_identity: bool) -> Self {
        let names: Vec<String> = schemas.iter().map(|s| s.qualified_name()).collect();
        let mut sql = format!("TRUNCATE TABLE {}", names.join(", "));
        if restart_identity {
            sql.push_str(" RESTART IDENTITY");
        }
        if cascade {
            sql.push_str(" CASCADE");
        }

        Self {
            kind: OperationKind::Truncate,
            relation_id: schemas.first().map(|s| s.relation_id),
            sql,
            params: Vec::new(),
        }
    }

    /// Marks the enclosing target transaction as replaying the source commit
    /// at `commit_lsn`. Requires an origin bound to the target session.
    pub fn origin_advance(commit_lsn: PgLsn, commit_timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: OperationKind::OriginAdvance,
            relation_id: None,
            sql: "SELECT pg_replication_origin_xact_setup($1, $2)".to_string(),
            params: vec![
                Some(Cell::Lsn(commit_lsn)),
                Some(Cell::TimestampTz(commit_timestamp)),
            ],
        }
    }
}

/// Decodes every column of `tuple` against the relation's column types.
pub fn materialize(
    schema: &RelationSchema,
    registry: &TypeRegistry,
    tuple: &TupleData,
) -> Result<Vec<ColumnValue>> {
    if tuple.len() != schema.columns.len() {
        return Err(Error::Protocol(format!(
            "Column count mismatch for {}: {} vs {}",
            schema.qualified_name(),
            tuple.len(),
            schema.columns.len()
        )));
    }

    Ok(schema
        .columns
        .iter()
        .zip(&tuple.columns)
        .map(|(column, raw)| registry.decode_column(raw, column.type_id))
        .collect())
}

fn identity_predicate(
    schema: &RelationSchema,
    identity: &[ColumnValue],
    params: &mut Params<'_>,
    operation: &'static str,
) -> Result<String> {
    let keyed = schema.has_key_columns();
    let mut clauses = Vec::new();

    for (column, value) in schema.columns.iter().zip(identity) {
        if keyed && !column.is_key {
            continue;
        }
        let name = quote_identifier(&column.name);
        match value {
            ColumnValue::Null => clauses.push(format!("{} IS NULL", name)),
            ColumnValue::Value(cell) => {
                let placeholder = params.push(column, Some(cell.clone()));
                clauses.push(format!("{} = {}", name, placeholder));
            }
            ColumnValue::UnchangedToast if keyed => {
                return Err(Error::MissingIdentity {
                    relation: schema.qualified_name(),
                    operation,
                })
            }
            ColumnValue::UnchangedToast => {}
        }
    }

    if clauses.is_empty() {
        return Err(Error::MissingIdentity {
            relation: schema.qualified_name(),
            operation,
        });
    }
    Ok(clauses.join(" AND "))
}

/// Positional parameters of a statement under construction.
struct Params<'r> {
    registry: &'r TypeRegistry,
    values: Vec<Option<Cell>>,
}

impl<'r> Params<'r> {
    fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            registry,
            values: Vec::new(),
        }
    }

    /// Appends a parameter and returns its placeholder. Raw text of a
    /// non-text type is cast on the server so it binds as text.
    fn push(&mut self, column: &ColumnSchema, value: Option<Cell>) -> String {
        let cast = match &value {
            Some(Cell::Raw(_)) => self.registry.cast_target(column.type_id),
            _ => None,
        };
        self.values.push(value);
        let index = self.values.len();
        match cast {
            Some(type_name) => format!("${}::text::{}", index, type_name),
            None => format!("${}", index),
        }
    }

    fn into_values(self) -> Vec<Option<Cell>> {
        self.values
    }
}
