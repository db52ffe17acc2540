//! Record type declarations handed to the registry.
//!
//! An [`EntityDefinition`] plays the part a struct declaration with field
//! annotations plays elsewhere: an ordered field list where every field has
//! a [`FieldType`] and a tag string in the tag language.
//!
//! ```
//! use entity_sync::registry::{EntityDefinition, FieldType, IntSize};
//!
//! let user = EntityDefinition::new("User")
//!     .tags("table=users;localCache;redisCache")
//!     .field("Name", FieldType::String, "required")
//!     .field("Email", FieldType::String, "unique=Email")
//!     .field("Age", FieldType::Uint(IntSize::Bits8), "index=Age")
//!     .query_one("ByEmail", ":Email = ?")
//!     .query("ByAge", ":Age = ?");
//! assert_eq!(user.name(), "User");
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSize {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl IntSize {
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            IntSize::Bits8 => 8,
            IntSize::Bits16 => 16,
            IntSize::Bits32 => 32,
            IntSize::Bits64 => 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Uint(IntSize),
    NullableUint(IntSize),
    Int(IntSize),
    NullableInt(IntSize),
    Bool,
    NullableBool,
    Float32,
    Float64,
    NullableFloat32,
    NullableFloat64,
    /// Plain text; an `enum=code` tag turns it into an enum column.
    String,
    /// A `set=code` tag stores it as a set column, otherwise as JSON.
    StringSlice,
    Bytes,
    /// Date, or datetime with the `time` tag.
    Time,
    NullableTime,
    Json,
    /// Reference to another registered entity, stored as its identity.
    Reference(String),
    /// Nested struct flattened into prefixed columns.
    Struct(StructDefinition),
    /// Placeholder carrying a `query=` or `queryOne=` tag; no column.
    CachedQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    pub tags: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructDefinition {
    pub fields: Vec<FieldDefinition>,
    pub anonymous: bool,
}

impl StructDefinition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of an anonymous struct are not prefixed.
    #[must_use]
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    #[must_use]
    pub fn field(mut self, name: &str, field_type: FieldType, tags: &str) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            tags: tags.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDefinition {
    name: String,
    tags: String,
    id_size: IntSize,
    fields: Vec<FieldDefinition>,
}

impl EntityDefinition {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tags: String::new(),
            id_size: IntSize::Bits64,
            fields: Vec::new(),
        }
    }

    /// Entity-level tags (`table`, `mysql`, `localCache`, `redisCache`, `uuid`, `unique`).
    #[must_use]
    pub fn tags(mut self, tags: &str) -> Self {
        self.tags = tags.to_string();
        self
    }

    /// Width of the unsigned identity column (64 bits by default).
    #[must_use]
    pub fn id_size(mut self, size: IntSize) -> Self {
        self.id_size = size;
        self
    }

    #[must_use]
    pub fn field(mut self, name: &str, field_type: FieldType, tags: &str) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            tags: tags.to_string(),
        });
        self
    }

    /// Cached multi-row query template.
    #[must_use]
    pub fn query(self, name: &str, template: &str) -> Self {
        let tags = format!("query={template}");
        self.field(name, FieldType::CachedQuery, &tags)
    }

    /// Cached single-row query template.
    #[must_use]
    pub fn query_one(self, name: &str, template: &str) -> Self {
        let tags = format!("queryOne={template}");
        self.field(name, FieldType::CachedQuery, &tags)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn entity_tags(&self) -> &str {
        &self.tags
    }

    #[must_use]
    pub fn identity_size(&self) -> IntSize {
        self.id_size
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }
}

impl fmt::Display for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
