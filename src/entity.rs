//! Entity handles.
//!
//! An [`Entity`] is one row as the application sees it: live values in
//! column order plus, for rows that exist in the relational store, the
//! bound snapshot of what was last persisted. The flush engine diffs the
//! two and refreshes the snapshot after a successful write.

use std::fmt;

use crate::registry::{BindError, SchemaRef, ID};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMark {
    #[default]
    None,
    /// Soft delete when the schema has a `FakeDelete` column.
    Soft,
    /// Always removes the row.
    Force,
}

#[derive(Clone)]
pub struct Entity {
    schema: SchemaRef,
    id: u64,
    loaded: bool,
    snapshot: Option<Vec<Value>>,
    values: Vec<Value>,
    delete: DeleteMark,
}

impl Entity {
    /// A new, unsaved entity with every column at its zero value.
    #[must_use]
    pub fn new(schema: SchemaRef) -> Self {
        let values = schema.default_row();
        Self {
            schema,
            id: 0,
            loaded: false,
            snapshot: None,
            values,
            delete: DeleteMark::None,
        }
    }

    /// Rebuild an entity from a stored row (relational or cached).
    pub fn from_stored(schema: SchemaRef, stored: &[Value]) -> Result<Self, BindError> {
        let values = schema.scan_row(stored)?;
        let id = values.first().and_then(Value::as_u64).unwrap_or(0);
        // Normalized so the next diff compares like with like.
        let snapshot = schema.bind_row(&values)?;
        Ok(Self {
            schema,
            id,
            loaded: true,
            snapshot: Some(snapshot),
            values,
            delete: DeleteMark::None,
        })
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    #[must_use]
    pub fn entity_name(&self) -> &str {
        self.schema.entity_name()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Assign an explicit identity before the first flush.
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
        self.values[0] = Value::Uint(id);
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// No row has been written for this entity yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.snapshot.is_none()
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.schema.column_position(column).map(|i| &self.values[i])
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<(), BindError> {
        let position = self
            .schema
            .column_position(column)
            .ok_or_else(|| BindError::UnknownColumn {
                entity: self.schema.entity_name().to_string(),
                column: column.to_string(),
            })?;
        let value = value.into();
        if column == ID {
            let id = value.as_u64().ok_or_else(|| BindError::WrongType {
                column: ID.to_string(),
                found: value.kind(),
            })?;
            self.set_id(id);
        } else {
            self.values[position] = value;
        }
        Ok(())
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&[Value]> {
        self.snapshot.as_deref()
    }

    pub fn mark_to_delete(&mut self) {
        self.delete = DeleteMark::Soft;
    }

    pub fn force_mark_to_delete(&mut self) {
        self.delete = DeleteMark::Force;
    }

    #[must_use]
    pub fn delete_mark(&self) -> DeleteMark {
        self.delete
    }

    /// Whether a flush would write anything.
    pub fn is_dirty(&self) -> Result<bool, BindError> {
        Ok(crate::flush::build_flush(self)?.is_some())
    }

    /// Record a committed write: `bound` is the full row now stored, or
    /// `None` when the row was removed.
    pub(crate) fn commit(&mut self, id: u64, bound: Option<Vec<Value>>) {
        match bound {
            Some(row) => {
                self.set_id(id);
                if let Some(position) = self.schema.column_position(crate::registry::FAKE_DELETE) {
                    self.values[position] = row[position].clone();
                }
                self.snapshot = Some(row);
                self.loaded = true;
            }
            None => {
                self.snapshot = None;
                self.loaded = false;
            }
        }
        self.delete = DeleteMark::None;
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("entity", &self.schema.entity_name())
            .field("id", &self.id)
            .field("loaded", &self.loaded)
            .field("delete", &self.delete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntityDefinition, FieldType, Registry};

    fn schema() -> SchemaRef {
        let mut registry = Registry::new();
        registry
            .register_mysql_pool("default")
            .register_entity(EntityDefinition::new("User").field("Name", FieldType::String, ""));
        registry.validate().unwrap().table_schema("User").unwrap()
    }

    #[test]
    fn test_id_column_accepts_integers() {
        let mut user = Entity::new(schema());
        user.set(ID, 7u64).unwrap();
        assert_eq!(user.id(), 7);
        user.set(ID, 8i64).unwrap();
        assert_eq!(user.get(ID), Some(&Value::Uint(8)));
    }

    #[test]
    fn test_id_column_rejects_other_values() {
        let mut user = Entity::new(schema());
        user.set_id(3);
        for bad in [Value::from("12"), Value::Int(-1), Value::Null] {
            let err = user.set(ID, bad).unwrap_err();
            assert!(matches!(err, BindError::WrongType { ref column, .. } if column == ID));
        }
        assert_eq!(user.id(), 3);
    }
}
