//! Entity diffing.
//!
//! [`build_flush`] compares an entity's live values, bound through the
//! schema's adapters, against its bound snapshot and produces the minimal
//! [`EntitySqlFlush`] record, or nothing when the row would not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{DeleteMark, Entity};
use crate::registry::{BindError, TableSchema, FAKE_DELETE, ID};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushAction {
    Insert,
    Update,
    Delete,
}

impl FlushAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushAction::Insert => "insert",
            FlushAction::Update => "update",
            FlushAction::Delete => "delete",
        }
    }
}

/// One row mutation, self-contained so it can be replayed from a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySqlFlush {
    pub entity: String,
    pub id: u64,
    pub action: FlushAction,
    /// Full bound row before the write (update and delete).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub old: BTreeMap<String, Value>,
    /// Every column on insert, changed columns on update.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub update: BTreeMap<String, Value>,
}

impl EntitySqlFlush {
    /// Full bound row after the write, in column order.
    #[must_use]
    pub fn row_after(&self, schema: &TableSchema) -> Vec<Value> {
        schema
            .columns()
            .iter()
            .map(|column| {
                if column.name == ID {
                    return Value::Uint(self.id);
                }
                self.update
                    .get(&column.name)
                    .or_else(|| self.old.get(&column.name))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Full bound row before the write, if the row existed.
    #[must_use]
    pub fn row_before(&self, schema: &TableSchema) -> Option<Vec<Value>> {
        if self.old.is_empty() {
            return None;
        }
        Some(
            schema
                .columns()
                .iter()
                .map(|c| self.old.get(&c.name).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

/// Equality by stored meaning rather than representation.
#[must_use]
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Uint(x), Value::Int(y)) | (Value::Int(y), Value::Uint(x)) => i64::try_from(*x).is_ok_and(|x| x == *y),
        (Value::Float(x), Value::Float(y)) => x == y || (x - y).abs() < f64::EPSILON,
        (Value::Time(x), Value::Date(y)) | (Value::Date(y), Value::Time(x)) => x.date() == *y && x.time() == chrono::NaiveTime::MIN,
        _ => a == b,
    }
}

fn row_map(schema: &TableSchema, row: &[Value]) -> BTreeMap<String, Value> {
    schema
        .columns()
        .iter()
        .zip(row)
        .map(|(c, v)| (c.name.clone(), v.clone()))
        .collect()
}

pub fn build_flush(entity: &Entity) -> Result<Option<EntitySqlFlush>, BindError> {
    let schema = entity.schema();
    let mut live = entity.values().to_vec();
    let snapshot = entity.snapshot();

    match (entity.delete_mark(), snapshot) {
        (DeleteMark::None, _) => {}
        // Never persisted, nothing to remove.
        (_, None) => return Ok(None),
        (DeleteMark::Soft, Some(_)) if schema.has_fake_delete() => {
            if let Some(position) = schema.column_position(FAKE_DELETE) {
                live[position] = Value::Bool(true);
            }
        }
        (DeleteMark::Soft | DeleteMark::Force, Some(old)) => {
            return Ok(Some(EntitySqlFlush {
                entity: schema.entity_name().to_string(),
                id: entity.id(),
                action: FlushAction::Delete,
                old: row_map(schema, old),
                update: BTreeMap::new(),
            }));
        }
    }

    let bound = schema.bind_row(&live)?;
    let Some(old) = snapshot else {
        let update = schema
            .columns()
            .iter()
            .zip(bound)
            .filter(|(c, v)| !(c.name == ID && matches!(v, Value::Uint(0))))
            .map(|(c, v)| (c.name.clone(), v))
            .collect();
        return Ok(Some(EntitySqlFlush {
            entity: schema.entity_name().to_string(),
            id: entity.id(),
            action: FlushAction::Insert,
            old: BTreeMap::new(),
            update,
        }));
    };

    let update: BTreeMap<String, Value> = schema
        .columns()
        .iter()
        .zip(bound.iter().zip(old))
        .filter(|(c, (new, old))| c.name != ID && !same_value(new, old))
        .map(|(c, (new, _))| (c.name.clone(), new.clone()))
        .collect();
    if update.is_empty() {
        return Ok(None);
    }
    Ok(Some(EntitySqlFlush {
        entity: schema.entity_name().to_string(),
        id: entity.id(),
        action: FlushAction::Update,
        old: row_map(schema, old),
        update,
    }))
}
