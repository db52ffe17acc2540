//! Schema Registry.
//!
//! Pools, enums, entity definitions and streams are registered on a mutable
//! [`Registry`]; [`Registry::validate`] turns them into an immutable
//! [`ValidatedRegistry`] holding one [`TableSchema`] per entity. Every
//! declaration problem surfaces here as a [`SchemaError`], before any
//! traffic is served.
//!
//! ```
//! use entity_sync::registry::{EntityDefinition, FieldType, Registry};
//!
//! let mut registry = Registry::new();
//! registry.register_mysql_pool("default");
//! registry.register_entity(
//!     EntityDefinition::new("User")
//!         .field("Email", FieldType::String, "unique=Email")
//!         .query_one("ByEmail", ":Email = ?"),
//! );
//! let validated = registry.validate().unwrap();
//! assert!(validated.table_schema("User").is_some());
//! ```

pub mod definition;
pub mod enums;
pub mod field;
pub mod index;
pub mod query;
pub mod schema;
pub mod tags;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

pub use definition::{EntityDefinition, FieldDefinition, FieldType, IntSize, StructDefinition};
pub use enums::Enum;
pub use field::{BindError, Column, FieldKind};
pub use query::CachedQuery;
pub use schema::{SchemaRef, TableSchema, DEFAULT_POOL, FAKE_DELETE, ID};

use crate::config::EngineConfig;
use schema::SchemaContext;

/// Reserved stream carrying deferred flushes.
pub const LAZY_FLUSH_STREAM: &str = "orm-lazy-flush-stream";
/// Consumer group replaying [`LAZY_FLUSH_STREAM`].
pub const LAZY_FLUSH_GROUP: &str = "orm-lazy-flush-consumer";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("mysql pool '{0}' not found")]
    MissingMysqlPool(String),
    #[error("local cache pool '{0}' not found")]
    MissingLocalCachePool(String),
    #[error("redis pool '{0}' not found")]
    MissingRedisPool(String),
    #[error("entity {entity} with uuid enabled must be uint64")]
    UuidRequiresUint64 { entity: String },
    #[error("duplicated index {index} with {with} in {entity}")]
    DuplicatedIndex { index: String, with: String, entity: String },
    #[error("missing unique index for cached query '{query}' in {entity}")]
    MissingUniqueIndex { query: String, entity: String },
    #[error("missing index for cached query '{query}' in {entity}")]
    MissingIndex { query: String, entity: String },
    #[error("invalid cached query '{query}' in {entity}: {reason}")]
    InvalidQuery { entity: String, query: String, reason: String },
    #[error("unregistered enum '{code}' used in {entity}")]
    UnknownEnum { code: String, entity: String },
    #[error("field {field} in {entity} references unregistered entity {target}")]
    UnknownReference { entity: String, field: String, target: String },
    #[error("entity {0} is registered twice")]
    DuplicateEntity(String),
    #[error("column {column} is declared twice in {entity}")]
    DuplicateColumn { entity: String, column: String },
    #[error("invalid tag on {entity}.{field}: {reason}")]
    InvalidTag { entity: String, field: String, reason: String },
    #[error("consumer group '{group}' already belongs to stream '{stream}'")]
    DuplicateGroup { group: String, stream: String },
    #[error("entity {0} is not registered")]
    UnknownEntity(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefinition {
    pub name: String,
    pub redis_pool: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Registry {
    mysql_pools: BTreeSet<String>,
    redis_pools: BTreeSet<String>,
    local_cache_pools: BTreeMap<String, usize>,
    enums: BTreeMap<String, Arc<Enum>>,
    entities: Vec<EntityDefinition>,
    streams: Vec<StreamDefinition>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every pool and stream named in the configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for code in config.mysql.keys() {
            registry.register_mysql_pool(code);
        }
        for code in config.redis.keys() {
            registry.register_redis(code);
        }
        for (code, limit) in &config.local_cache {
            registry.register_local_cache(code, *limit);
        }
        for stream in &config.streams {
            let groups: Vec<&str> = stream.groups.iter().map(String::as_str).collect();
            registry.register_stream(&stream.name, &stream.redis_pool, &groups);
        }
        registry
    }

    pub fn register_mysql_pool(&mut self, code: &str) -> &mut Self {
        self.mysql_pools.insert(code.to_string());
        self
    }

    pub fn register_redis(&mut self, code: &str) -> &mut Self {
        self.redis_pools.insert(code.to_string());
        self
    }

    pub fn register_local_cache(&mut self, code: &str, limit: usize) -> &mut Self {
        self.local_cache_pools.insert(code.to_string(), limit);
        self
    }

    pub fn register_enum(&mut self, code: &str, values: &[&str]) -> &mut Self {
        self.register_enum_definition(Enum::new(code, values))
    }

    pub fn register_enum_definition(&mut self, definition: Enum) -> &mut Self {
        self.enums.insert(definition.code().to_string(), Arc::new(definition));
        self
    }

    pub fn register_entity(&mut self, definition: EntityDefinition) -> &mut Self {
        self.entities.push(definition);
        self
    }

    pub fn register_stream(&mut self, name: &str, redis_pool: &str, groups: &[&str]) -> &mut Self {
        self.streams.push(StreamDefinition {
            name: name.to_string(),
            redis_pool: redis_pool.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        });
        self
    }

    pub fn validate(&self) -> Result<ValidatedRegistry, SchemaError> {
        let mut names = BTreeSet::new();
        for definition in &self.entities {
            if !names.insert(definition.name().to_string()) {
                return Err(SchemaError::DuplicateEntity(definition.name().to_string()));
            }
        }
        let ctx = SchemaContext {
            mysql_pools: &self.mysql_pools,
            local_cache_pools: &self.local_cache_pools,
            redis_pools: &self.redis_pools,
            enums: &self.enums,
            entities: &names,
        };
        let mut schemas = BTreeMap::new();
        for definition in &self.entities {
            let schema = TableSchema::build(definition, &ctx)?;
            debug!(
                entity = %definition,
                table = schema.table_name(),
                columns = schema.columns().len(),
                prefix = schema.cache_prefix(),
                "Table schema built"
            );
            schemas.insert(definition.name().to_string(), Arc::new(schema));
        }

        let mut streams = self.streams.clone();
        if self.redis_pools.contains(DEFAULT_POOL) && !streams.iter().any(|s| s.name == LAZY_FLUSH_STREAM) {
            streams.push(StreamDefinition {
                name: LAZY_FLUSH_STREAM.to_string(),
                redis_pool: DEFAULT_POOL.to_string(),
                groups: vec![LAZY_FLUSH_GROUP.to_string()],
            });
        }
        let mut by_name = BTreeMap::new();
        let mut groups = BTreeMap::new();
        for stream in streams {
            if !self.redis_pools.contains(&stream.redis_pool) {
                return Err(SchemaError::MissingRedisPool(stream.redis_pool));
            }
            for group in &stream.groups {
                if let Some(owner) = groups.insert(group.clone(), stream.name.clone()) {
                    if owner != stream.name {
                        return Err(SchemaError::DuplicateGroup {
                            group: group.clone(),
                            stream: owner,
                        });
                    }
                }
            }
            by_name.insert(stream.name.clone(), stream);
        }

        Ok(ValidatedRegistry {
            schemas,
            mysql_pools: self.mysql_pools.clone(),
            redis_pools: self.redis_pools.clone(),
            local_cache_pools: self.local_cache_pools.clone(),
            enums: self.enums.clone(),
            streams: by_name,
            groups,
        })
    }
}

/// Immutable result of [`Registry::validate`], shared by the engine.
#[derive(Debug)]
pub struct ValidatedRegistry {
    schemas: BTreeMap<String, SchemaRef>,
    mysql_pools: BTreeSet<String>,
    redis_pools: BTreeSet<String>,
    local_cache_pools: BTreeMap<String, usize>,
    enums: BTreeMap<String, Arc<Enum>>,
    streams: BTreeMap<String, StreamDefinition>,
    groups: BTreeMap<String, String>,
}

impl ValidatedRegistry {
    #[must_use]
    pub fn table_schema(&self, entity: &str) -> Option<SchemaRef> {
        self.schemas.get(entity).cloned()
    }

    pub fn require_schema(&self, entity: &str) -> Result<SchemaRef, SchemaError> {
        self.table_schema(entity)
            .ok_or_else(|| SchemaError::UnknownEntity(entity.to_string()))
    }

    pub fn table_schemas(&self) -> impl Iterator<Item = &SchemaRef> {
        self.schemas.values()
    }

    #[must_use]
    pub fn mysql_pools(&self) -> &BTreeSet<String> {
        &self.mysql_pools
    }

    #[must_use]
    pub fn redis_pools(&self) -> &BTreeSet<String> {
        &self.redis_pools
    }

    #[must_use]
    pub fn local_cache_pools(&self) -> &BTreeMap<String, usize> {
        &self.local_cache_pools
    }

    #[must_use]
    pub fn enum_definition(&self, code: &str) -> Option<Arc<Enum>> {
        self.enums.get(code).cloned()
    }

    #[must_use]
    pub fn streams(&self) -> &BTreeMap<String, StreamDefinition> {
        &self.streams
    }

    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamDefinition> {
        self.streams.get(name)
    }

    /// The stream a consumer group reads from.
    #[must_use]
    pub fn stream_for_group(&self, group: &str) -> Option<&StreamDefinition> {
        self.groups.get(group).and_then(|s| self.streams.get(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Registry {
        let mut registry = Registry::new();
        registry.register_mysql_pool("default");
        registry
    }

    #[test]
    fn test_unique_index_covers_query_one() {
        let mut registry = base();
        registry.register_entity(
            EntityDefinition::new("User")
                .field("Email", FieldType::String, "unique=Email")
                .query_one("ByEmail", ":Email = ?"),
        );
        assert!(registry.validate().is_ok());

        let mut registry = base();
        registry.register_entity(
            EntityDefinition::new("User")
                .field("Email", FieldType::String, "")
                .query_one("ByEmail", ":Email = ?"),
        );
        let err = registry.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing unique index for cached query 'ByEmail' in User"
        );
    }

    #[test]
    fn test_missing_pools() {
        let mut registry = Registry::new();
        registry.register_entity(EntityDefinition::new("User"));
        assert_eq!(
            registry.validate().unwrap_err().to_string(),
            "mysql pool 'default' not found"
        );

        let mut registry = base();
        registry.register_entity(EntityDefinition::new("User").tags("localCache=other"));
        assert_eq!(
            registry.validate().unwrap_err().to_string(),
            "local cache pool 'other' not found"
        );

        let mut registry = base();
        registry.register_entity(EntityDefinition::new("User").tags("redisCache"));
        assert_eq!(
            registry.validate().unwrap_err().to_string(),
            "redis pool 'default' not found"
        );
    }

    #[test]
    fn test_uuid_requires_64_bit_identity() {
        let mut registry = base();
        registry.register_entity(EntityDefinition::new("Log").tags("uuid").id_size(IntSize::Bits32));
        assert!(matches!(
            registry.validate(),
            Err(SchemaError::UuidRequiresUint64 { .. })
        ));
    }

    #[test]
    fn test_lazy_stream_registered_on_default_redis() {
        let mut registry = base();
        registry.register_redis("default");
        let validated = registry.validate().unwrap();
        let stream = validated.stream_for_group(LAZY_FLUSH_GROUP).unwrap();
        assert_eq!(stream.name, LAZY_FLUSH_STREAM);

        let validated = base().validate().unwrap();
        assert!(validated.stream(LAZY_FLUSH_STREAM).is_none());
    }

    #[test]
    fn test_group_belongs_to_one_stream() {
        let mut registry = base();
        registry
            .register_redis("default")
            .register_stream("a", "default", &["workers"])
            .register_stream("b", "default", &["workers"]);
        assert!(matches!(
            registry.validate(),
            Err(SchemaError::DuplicateGroup { .. })
        ));
    }

    #[test]
    fn test_reference_gets_automatic_index() {
        let mut registry = base();
        registry
            .register_entity(EntityDefinition::new("User"))
            .register_entity(
                EntityDefinition::new("Post").field("Author", FieldType::Reference("User".into()), ""),
            );
        let validated = registry.validate().unwrap();
        let post = validated.table_schema("Post").unwrap();
        assert_eq!(post.indexes().get("_Author"), Some(&vec!["Author".to_string()]));
    }

    #[test]
    fn test_column_order_follows_field_categories() {
        let mut registry = base();
        registry.register_enum("color", &["red", "blue"]);
        registry.register_entity(
            EntityDefinition::new("Item")
                .field("Meta", FieldType::Json, "")
                .field("Name", FieldType::String, "")
                .field("Deleted", FieldType::NullableBool, "")
                .field("FakeDelete", FieldType::Bool, "")
                .field("Color", FieldType::String, "enum=color")
                .field("Price", FieldType::Float64, "")
                .field("Count", FieldType::Int(IntSize::Bits32), "")
                .field("Size", FieldType::Uint(IntSize::Bits16), "")
                .field(
                    "Address",
                    FieldType::Struct(
                        StructDefinition::new()
                            .field("Street", FieldType::String, "")
                            .field("Number", FieldType::Uint(IntSize::Bits16), ""),
                    ),
                    "",
                )
                .field("Skipped", FieldType::String, "ignore"),
        );
        let validated = registry.validate().unwrap();
        let item = validated.table_schema("Item").unwrap();
        assert_eq!(
            item.column_names(),
            vec![
                "ID",
                "Size",
                "Count",
                "Price",
                "FakeDelete",
                "Name",
                "Color",
                "Deleted",
                "Meta",
                "AddressNumber",
                "AddressStreet",
            ]
        );
        assert!(item.has_fake_delete());
    }
}
