// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Immutable per-entity table descriptors.
//!
//! A [`TableSchema`] is built once during registry validation from an
//! [`EntityDefinition`] and shared behind an `Arc` by every caller. It owns
//! the column layout (a durable contract: cached rows decode positionally),
//! the cache key fingerprint, index declarations and cached query templates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::definition::{EntityDefinition, FieldDefinition, FieldType, StructDefinition};
use super::enums::Enum;
use super::field::{BindError, Column, FieldKind};
use super::index::{self, IndexMap, IndexViolation};
use super::query::CachedQuery;
use super::tags::{parse_memberships, TagSet};
use super::SchemaError;
use crate::storage::ColumnType;
use crate::value::Value;

pub const ID: &str = "ID";
pub const FAKE_DELETE: &str = "FakeDelete";
pub const DEFAULT_POOL: &str = "default";
const DEFAULT_STRING_LENGTH: usize = 255;
const FINGERPRINT_LENGTH: usize = 8;

/// Pools, enums and entity names a schema may refer to.
pub(crate) struct SchemaContext<'a> {
    pub mysql_pools: &'a BTreeSet<String>,
    pub local_cache_pools: &'a BTreeMap<String, usize>,
    pub redis_pools: &'a BTreeSet<String>,
    pub enums: &'a BTreeMap<String, Arc<Enum>>,
    pub entities: &'a BTreeSet<String>,
}

#[derive(Debug)]
pub struct TableSchema {
    entity_name: String,
    table_name: String,
    mysql_pool: String,
    local_cache: Option<String>,
    redis_cache: Option<String>,
    columns: Vec<Column>,
    positions: HashMap<String, usize>,
    cache_prefix: String,
    has_fake_delete: bool,
    has_uuid: bool,
    unique_indexes: IndexMap,
    indexes: IndexMap,
    cached_queries: BTreeMap<String, CachedQuery>,
    tracked_fields: BTreeSet<String>,
    references: Vec<(String, String)>,
}

/// Accumulated while walking the field tree.
#[derive(Default)]
struct LayoutBuilder {
    columns: Vec<Column>,
    unique: BTreeMap<String, BTreeMap<usize, String>>,
    indexes: BTreeMap<String, BTreeMap<usize, String>>,
    queries: Vec<(String, String, bool)>,
    references: Vec<(String, String)>,
}

impl TableSchema {
    pub(crate) fn build(definition: &EntityDefinition, ctx: &SchemaContext<'_>) -> Result<Self, SchemaError> {
        let entity = definition.name().to_string();
        let tags = TagSet::parse(definition.entity_tags());

        let mysql_pool = tags.resolve("mysql", DEFAULT_POOL, DEFAULT_POOL).to_string();
        if !ctx.mysql_pools.contains(&mysql_pool) {
            return Err(SchemaError::MissingMysqlPool(mysql_pool));
        }
        let table_name = tags.resolve("table", &entity, &entity).to_string();
        let local_cache = match tags.resolve("localCache", DEFAULT_POOL, "") {
            "" => None,
            pool if ctx.local_cache_pools.contains_key(pool) => Some(pool.to_string()),
            pool => return Err(SchemaError::MissingLocalCachePool(pool.to_string())),
        };
        let redis_cache = match tags.resolve("redisCache", DEFAULT_POOL, "") {
            "" => None,
            pool if ctx.redis_pools.contains(pool) => Some(pool.to_string()),
            pool => return Err(SchemaError::MissingRedisPool(pool.to_string())),
        };
        let has_uuid = tags.resolve("uuid", "true", "false") == "true";
        if has_uuid && definition.identity_size().bits() != 64 {
            return Err(SchemaError::UuidRequiresUint64 { entity });
        }

        let mut layout = LayoutBuilder::default();
        layout.columns.push(Column::new(ID, FieldKind::Id));
        let mut top = Vec::new();
        let mut nested = Vec::new();
        for field in definition.fields() {
            collect_field(&entity, field, "", true, ctx, &mut layout, &mut top, &mut nested)?;
        }
        top.sort_by_key(|c: &Column| c.kind.layout_rank());
        layout.columns.extend(top);
        for (prefix, def) in nested {
            collect_struct(&entity, &def, &prefix, ctx, &mut layout)?;
        }

        let mut positions = HashMap::with_capacity(layout.columns.len());
        for (i, column) in layout.columns.iter().enumerate() {
            if positions.insert(column.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateColumn {
                    entity,
                    column: column.name.clone(),
                });
            }
        }
        let has_fake_delete = layout
            .columns
            .iter()
            .any(|c| matches!(c.kind, FieldKind::FakeDelete));

        if let Some(global) = tags.get("unique") {
            for part in global.split('|').filter(|p| !p.is_empty()) {
                let (name, columns) = part.split_once(':').ok_or_else(|| SchemaError::InvalidTag {
                    entity: entity.clone(),
                    field: "unique".into(),
                    reason: format!("expected 'Name:Col1,Col2', got '{part}'"),
                })?;
                let declared = layout.unique.entry(name.to_string()).or_default();
                for (i, column) in columns.split(',').enumerate() {
                    declared.insert(i + 1, column.trim().to_string());
                }
            }
        }

        for (column, _) in &layout.references {
            let indexed = layout
                .indexes
                .values()
                .chain(layout.unique.values())
                .any(|cols| cols.get(&1) == Some(column));
            if !indexed {
                layout
                    .indexes
                    .insert(format!("_{column}"), BTreeMap::from([(1, column.clone())]));
            }
        }

        let mut cached_queries = BTreeMap::new();
        let mut tracked_fields = BTreeSet::new();
        for (name, template, one) in &layout.queries {
            let query = CachedQuery::parse(name, template, *one, has_fake_delete);
            for field in query.query_fields.iter().chain(query.order_fields.iter()) {
                if !positions.contains_key(field) {
                    return Err(SchemaError::InvalidQuery {
                        entity,
                        query: name.clone(),
                        reason: format!("unknown column '{field}'"),
                    });
                }
            }
            tracked_fields.extend(query.tracked_fields.iter().cloned());
            cached_queries.insert(name.clone(), query);
        }

        let unique_indexes = index::ordered(&layout.unique);
        let indexes = index::ordered(&layout.indexes);
        index::validate(&unique_indexes, &indexes, &cached_queries).map_err(|violation| match violation {
            IndexViolation::Duplicated { index, with } => SchemaError::DuplicatedIndex {
                index,
                with,
                entity: entity.clone(),
            },
            IndexViolation::MissingUnique { query } => SchemaError::MissingUniqueIndex {
                query,
                entity: entity.clone(),
            },
            IndexViolation::Missing { query } => SchemaError::MissingIndex {
                query,
                entity: entity.clone(),
            },
        })?;

        let cache_prefix = fingerprint(&mysql_pool, &table_name, &layout.columns);
        Ok(Self {
            entity_name: entity,
            table_name,
            mysql_pool,
            local_cache,
            redis_cache,
            columns: layout.columns,
            positions,
            cache_prefix,
            has_fake_delete,
            has_uuid,
            unique_indexes,
            indexes,
            cached_queries,
            tracked_fields,
            references: layout.references,
        })
    }

    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[must_use]
    pub fn mysql_pool(&self) -> &str {
        &self.mysql_pool
    }

    #[must_use]
    pub fn local_cache_pool(&self) -> Option<&str> {
        self.local_cache.as_deref()
    }

    #[must_use]
    pub fn redis_cache_pool(&self) -> Option<&str> {
        self.redis_cache.as_deref()
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_position(name).map(|i| &self.columns[i])
    }

    /// Structure fingerprint; changes whenever the column layout changes.
    #[must_use]
    pub fn cache_prefix(&self) -> &str {
        &self.cache_prefix
    }

    #[must_use]
    pub fn cache_key(&self, id: u64) -> String {
        format!("{}:{id}", self.cache_prefix)
    }

    /// Key of one cached query result set for the given bound arguments.
    #[must_use]
    pub fn query_cache_key(&self, query: &str, args: &[Value]) -> String {
        let encoded = serde_json::to_vec(args).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&encoded));
        format!("{}_{query}_{}", self.cache_prefix, &digest[..16])
    }

    #[must_use]
    pub fn has_fake_delete(&self) -> bool {
        self.has_fake_delete
    }

    #[must_use]
    pub fn has_uuid(&self) -> bool {
        self.has_uuid
    }

    #[must_use]
    pub fn unique_indexes(&self) -> &IndexMap {
        &self.unique_indexes
    }

    #[must_use]
    pub fn indexes(&self) -> &IndexMap {
        &self.indexes
    }

    #[must_use]
    pub fn cached_query(&self, name: &str) -> Option<&CachedQuery> {
        self.cached_queries.get(name)
    }

    #[must_use]
    pub fn cached_queries(&self) -> &BTreeMap<String, CachedQuery> {
        &self.cached_queries
    }

    /// Columns some cached query depends on.
    #[must_use]
    pub fn is_tracked(&self, column: &str) -> bool {
        self.tracked_fields.contains(column)
    }

    /// `(column, referenced entity)` pairs.
    #[must_use]
    pub fn references(&self) -> &[(String, String)] {
        &self.references
    }

    /// Column names with the storage type used to decode them.
    #[must_use]
    pub fn load_columns(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.kind.column_type()))
            .collect()
    }

    #[must_use]
    pub fn default_row(&self) -> Vec<Value> {
        self.columns.iter().map(Column::default_value).collect()
    }

    pub fn bind_row(&self, live: &[Value]) -> Result<Vec<Value>, BindError> {
        self.columns
            .iter()
            .zip(live)
            .map(|(column, value)| column.bind(value))
            .collect()
    }

    pub fn scan_row(&self, stored: &[Value]) -> Result<Vec<Value>, BindError> {
        self.columns
            .iter()
            .zip(stored)
            .map(|(column, value)| column.scan(value))
            .collect()
    }

    /// Arguments of a cached query taken from a bound row.
    #[must_use]
    pub fn query_args(&self, query: &CachedQuery, bound: &[Value]) -> Vec<Value> {
        query
            .argument_fields()
            .map(|f| {
                self.column_position(f)
                    .and_then(|i| bound.get(i).cloned())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }
}

fn fingerprint(pool: &str, table: &str, columns: &[Column]) -> String {
    let mut hasher = Sha256::new();
    if pool != DEFAULT_POOL {
        hasher.update(pool.as_bytes());
    }
    hasher.update(table.as_bytes());
    for column in columns {
        hasher.update(format!(",`{}`:{}", column.name, column.kind.signature()).as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LENGTH);
    digest
}

fn invalid_tag(entity: &str, field: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidTag {
        entity: entity.to_string(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn lookup_enum(entity: &str, tags: &TagSet, key: &str, ctx: &SchemaContext<'_>) -> Result<Option<Arc<Enum>>, SchemaError> {
    match tags.get(key) {
        None => Ok(None),
        Some(code) => ctx
            .enums
            .get(code)
            .cloned()
            .map(Some)
            .ok_or_else(|| SchemaError::UnknownEnum {
                code: code.to_string(),
                entity: entity.to_string(),
            }),
    }
}

fn float_precision(entity: &str, name: &str, tags: &TagSet, default: i32) -> Result<i32, SchemaError> {
    if let Some(value) = tags.get("precision") {
        return value
            .parse()
            .map_err(|_| invalid_tag(entity, name, format!("invalid precision '{value}'")));
    }
    if let Some(value) = tags.get("decimal") {
        return value
            .split_once(',')
            .and_then(|(_, scale)| scale.trim().parse().ok())
            .ok_or_else(|| invalid_tag(entity, name, format!("invalid decimal '{value}'")));
    }
    Ok(default)
}

fn field_kind(
    entity: &str,
    name: &str,
    field_type: &FieldType,
    tags: &TagSet,
    top_level: bool,
    ctx: &SchemaContext<'_>,
) -> Result<Option<FieldKind>, SchemaError> {
    let required = tags.has("required");
    Ok(Some(match field_type {
        FieldType::Uint(size) => FieldKind::Uint { bits: size.bits(), nullable: false },
        FieldType::NullableUint(size) => FieldKind::Uint { bits: size.bits(), nullable: true },
        FieldType::Int(size) => FieldKind::Int { bits: size.bits(), nullable: false },
        FieldType::NullableInt(size) => FieldKind::Int { bits: size.bits(), nullable: true },
        FieldType::Bool if top_level && name == FAKE_DELETE => FieldKind::FakeDelete,
        FieldType::Bool => FieldKind::Bool { nullable: false },
        FieldType::NullableBool => FieldKind::Bool { nullable: true },
        FieldType::Float32 | FieldType::NullableFloat32 => FieldKind::Float {
            precision: float_precision(entity, name, tags, 4)?,
            nullable: matches!(field_type, FieldType::NullableFloat32),
        },
        FieldType::Float64 | FieldType::NullableFloat64 => FieldKind::Float {
            precision: float_precision(entity, name, tags, 8)?,
            nullable: matches!(field_type, FieldType::NullableFloat64),
        },
        FieldType::String => match lookup_enum(entity, tags, "enum", ctx)? {
            Some(values) => FieldKind::Enum { values, required },
            None => {
                let max_length = match tags.get("length") {
                    Some(value) => value
                        .parse()
                        .map_err(|_| invalid_tag(entity, name, format!("invalid length '{value}'")))?,
                    None => DEFAULT_STRING_LENGTH,
                };
                FieldKind::String { max_length, required }
            }
        },
        FieldType::StringSlice => match lookup_enum(entity, tags, "set", ctx)? {
            Some(values) => FieldKind::Set { values },
            None => FieldKind::Json,
        },
        FieldType::Bytes => FieldKind::Bytes,
        FieldType::Time => FieldKind::Time { with_time: tags.has("time"), nullable: false },
        FieldType::NullableTime => FieldKind::Time { with_time: tags.has("time"), nullable: true },
        FieldType::Json => FieldKind::Json,
        FieldType::Reference(target) => {
            if !ctx.entities.contains(target) {
                return Err(SchemaError::UnknownReference {
                    entity: entity.to_string(),
                    field: name.to_string(),
                    target: target.clone(),
                });
            }
            FieldKind::Reference { entity: target.clone() }
        }
        FieldType::Struct(_) | FieldType::CachedQuery => return Ok(None),
    }))
}

#[allow(clippy::too_many_arguments)]
fn collect_field(
    entity: &str,
    field: &FieldDefinition,
    prefix: &str,
    top_level: bool,
    ctx: &SchemaContext<'_>,
    layout: &mut LayoutBuilder,
    columns: &mut Vec<Column>,
    nested: &mut Vec<(String, StructDefinition)>,
) -> Result<(), SchemaError> {
    let tags = TagSet::parse(&field.tags);
    if tags.has("ignore") {
        return Ok(());
    }
    let name = format!("{prefix}{}", field.name);
    if name == ID {
        return Ok(());
    }
    for (key, one) in [("query", false), ("queryOne", true)] {
        if let Some(template) = tags.get(key) {
            let template = if template == "true" { "" } else { template };
            layout.queries.push((name.clone(), template.to_string(), one));
        }
    }
    if let FieldType::Struct(def) = &field.field_type {
        let struct_prefix = if def.anonymous { prefix.to_string() } else { name.clone() };
        nested.push((struct_prefix, def.clone()));
        return Ok(());
    }
    let Some(kind) = field_kind(entity, &name, &field.field_type, &tags, top_level, ctx)? else {
        return Ok(());
    };
    if let FieldKind::Reference { entity: target } = &kind {
        layout.references.push((name.clone(), target.clone()));
    }
    for (key, target) in [("unique", &mut layout.unique), ("index", &mut layout.indexes)] {
        if let Some(value) = tags.get(key) {
            let memberships = parse_memberships(value).map_err(|reason| invalid_tag(entity, &name, reason))?;
            for membership in memberships {
                target
                    .entry(membership.index)
                    .or_default()
                    .insert(membership.ordinal, name.clone());
            }
        }
    }
    columns.push(Column::new(&name, kind));
    Ok(())
}

fn collect_struct(
    entity: &str,
    definition: &StructDefinition,
    prefix: &str,
    ctx: &SchemaContext<'_>,
    layout: &mut LayoutBuilder,
) -> Result<(), SchemaError> {
    let mut columns = Vec::new();
    let mut nested = Vec::new();
    for field in &definition.fields {
        collect_field(entity, field, prefix, false, ctx, layout, &mut columns, &mut nested)?;
    }
    columns.sort_by_key(|c: &Column| c.kind.layout_rank());
    layout.columns.extend(columns);
    for (sub_prefix, def) in nested {
        collect_struct(entity, &def, &sub_prefix, ctx, layout)?;
    }
    Ok(())
}

/// Shared handle to a validated schema.
pub type SchemaRef = Arc<TableSchema>;
