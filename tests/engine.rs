//! Engine integration tests against the in-memory backends.
//!
//! Covers the immediate write path, cache-aside reads and the invalidation
//! that keeps both cache tiers honest after writes.
//!
//! ```bash
//! cargo test --test engine
//! ```

use std::sync::Arc;

use entity_sync::flush::build_flush;
use entity_sync::storage::memory::InMemoryCache;
use entity_sync::storage::memory_sql::InMemoryRelationalStore;
use entity_sync::storage::memory_stream::InMemoryStreamStore;
use entity_sync::storage::Mutation;
use entity_sync::{
    Engine, EngineError, EntityDefinition, FieldType, IntSize, Registry, Value,
};

struct Harness {
    engine: Engine,
    sql: Arc<InMemoryRelationalStore>,
    redis: Arc<InMemoryCache>,
}

fn user_definition() -> EntityDefinition {
    EntityDefinition::new("User")
        .tags("localCache;redisCache")
        .field("Name", FieldType::String, "")
        .field("Email", FieldType::String, "unique=Email")
        .field("Age", FieldType::Uint(IntSize::Bits8), "index=Age")
        .field("FakeDelete", FieldType::Bool, "index=Age:2")
        .query_one("ByEmail", ":Email = ?")
        .query("ByAge", ":Age = ?")
        .query("All", "")
}

fn harness() -> Harness {
    let mut registry = Registry::new();
    registry
        .register_mysql_pool("default")
        .register_redis("default")
        .register_local_cache("default", 100)
        .register_stream("dirty", "default", &["indexer"])
        .register_entity(user_definition())
        .register_entity(
            EntityDefinition::new("Post")
                .field("Title", FieldType::String, "")
                .field("Author", FieldType::Reference("User".into()), ""),
        );
    let registry = registry.validate().unwrap();

    let sql = Arc::new(InMemoryRelationalStore::new().with_unique("User", &["Email"]));
    let redis = Arc::new(InMemoryCache::new());
    let engine = Engine::builder(registry)
        .with_relational("default", sql.clone())
        .with_remote_cache("default", redis.clone())
        .with_stream_store("default", Arc::new(InMemoryStreamStore::new()))
        .build();
    Harness {
        engine,
        sql,
        redis,
    }
}

// =============================================================================
// Immediate flush
// =============================================================================

#[tokio::test]
async fn test_new_entity_inserts_every_column_once() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Name", "a").unwrap();
    h.engine.flush(&mut user).await.unwrap();

    let executed = h.sql.executed();
    assert_eq!(executed.len(), 1);
    match &executed[0].mutation {
        Mutation::Insert { columns, rows } => {
            assert_eq!(columns, &vec!["Age", "FakeDelete", "Name", "Email"]);
            assert_eq!(rows.len(), 1);
        }
        other => panic!("expected insert, got {other:?}"),
    }
    assert_eq!(user.id(), 1);
    assert!(!user.is_new());

    h.sql.clear_executed();
    h.engine.flush(&mut user).await.unwrap();
    assert!(h.sql.executed().is_empty());
}

#[tokio::test]
async fn test_loaded_entity_has_no_pending_changes() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Name", "a").unwrap();
    user.set("Age", 42u8).unwrap();
    h.engine.flush(&mut user).await.unwrap();

    let loaded = h.engine.load_by_id("User", user.id()).await.unwrap().unwrap();
    assert_eq!(loaded.get("Name"), Some(&Value::from("a")));
    assert_eq!(loaded.get("Age"), Some(&Value::Uint(42)));
    assert!(build_flush(&loaded).unwrap().is_none());
}

#[tokio::test]
async fn test_update_writes_changed_columns_only() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Name", "a").unwrap();
    h.engine.flush(&mut user).await.unwrap();
    h.sql.clear_executed();

    user.set("Age", 30u8).unwrap();
    h.engine.flush(&mut user).await.unwrap();
    let executed = h.sql.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(
        executed[0].mutation,
        Mutation::Update {
            id: user.id(),
            set: vec![("Age".into(), Value::Uint(30))],
        }
    );
}

#[tokio::test]
async fn test_flush_many_keeps_tracking_order() {
    let h = harness();
    let mut author = h.engine.new_entity("User").unwrap();
    author.set("Name", "author").unwrap();
    h.engine.flush(&mut author).await.unwrap();
    h.sql.clear_executed();

    let mut post = h.engine.new_entity("Post").unwrap();
    post.set("Title", "hello").unwrap();
    post.set("Author", author.id()).unwrap();
    author.set("Age", 50u8).unwrap();
    h.engine.flush_many([&mut post, &mut author]).await.unwrap();

    let tables: Vec<String> = h.sql.executed().into_iter().map(|s| s.table).collect();
    assert_eq!(tables, vec!["Post", "User"]);
}

#[tokio::test]
async fn test_constraint_violation_aborts_the_flush() {
    let h = harness();
    let mut first = h.engine.new_entity("User").unwrap();
    first.set("Email", "a@example.com").unwrap();
    h.engine.flush(&mut first).await.unwrap();

    let mut ok = h.engine.new_entity("User").unwrap();
    ok.set("Email", "b@example.com").unwrap();
    let mut clash = h.engine.new_entity("User").unwrap();
    clash.set("Email", "a@example.com").unwrap();
    let err = h.engine.flush_many([&mut ok, &mut clash]).await.unwrap_err();
    assert!(err.is_database());
    assert!(err.storage_error().unwrap().is_duplicate_key());

    assert_eq!(h.sql.row_count("User"), 1);
    assert!(ok.is_new());
    assert!(clash.is_new());
}

// =============================================================================
// Deletes
// =============================================================================

#[tokio::test]
async fn test_soft_delete_hides_row_but_keeps_it() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Name", "a").unwrap();
    h.engine.flush(&mut user).await.unwrap();
    let id = user.id();

    h.engine.delete(&mut user).await.unwrap();
    assert_eq!(h.sql.row_count("User"), 1);
    assert_eq!(h.sql.value("User", id, "FakeDelete"), Some(Value::Bool(true)));
    assert!(h.engine.load_by_id("User", id).await.unwrap().is_none());

    h.engine.force_delete(&mut user).await.unwrap();
    assert_eq!(h.sql.row_count("User"), 0);
}

#[tokio::test]
async fn test_delete_without_soft_delete_removes_row() {
    let h = harness();
    let mut post = h.engine.new_entity("Post").unwrap();
    post.set("Title", "x").unwrap();
    h.engine.flush(&mut post).await.unwrap();
    h.engine.delete(&mut post).await.unwrap();
    assert_eq!(h.sql.row_count("Post"), 0);
    assert!(h.engine.load_by_id("Post", post.id()).await.unwrap().is_none());
}

// =============================================================================
// Cache-aside reads and invalidation
// =============================================================================

#[tokio::test]
async fn test_load_populates_both_cache_tiers() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Name", "a").unwrap();
    h.engine.flush(&mut user).await.unwrap();

    let schema = h.engine.registry().table_schema("User").unwrap();
    let key = schema.cache_key(user.id());
    assert!(!h.redis.contains_key(&key));

    h.engine.load_by_id("User", user.id()).await.unwrap();
    assert!(h.redis.contains_key(&key));
    assert!(h.engine.local_cache("default").unwrap().get(&key).is_some());

    user.set("Name", "b").unwrap();
    h.engine.flush(&mut user).await.unwrap();
    assert!(!h.redis.contains_key(&key));
    assert!(h.engine.local_cache("default").unwrap().get(&key).is_none());

    let reloaded = h.engine.load_by_id("User", user.id()).await.unwrap().unwrap();
    assert_eq!(reloaded.get("Name"), Some(&Value::from("b")));
}

#[tokio::test]
async fn test_missing_rows_are_cached_as_negative() {
    let h = harness();
    let schema = h.engine.registry().table_schema("User").unwrap();
    assert!(h.engine.load_by_id("User", 99).await.unwrap().is_none());
    assert!(h.redis.contains_key(&schema.cache_key(99)));

    h.engine.clear_cache_by_ids("User", &[99]).await.unwrap();
    assert!(!h.redis.contains_key(&schema.cache_key(99)));
}

#[tokio::test]
async fn test_load_by_ids_keeps_request_order() {
    let h = harness();
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let mut user = h.engine.new_entity("User").unwrap();
        user.set("Name", name).unwrap();
        h.engine.flush(&mut user).await.unwrap();
        ids.push(user.id());
    }
    let loaded = h.engine.load_by_ids("User", &[ids[2], 1000, ids[0]]).await.unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded[0].as_ref().unwrap().get("Name"), Some(&Value::from("c")));
    assert!(loaded[1].is_none());
    assert_eq!(loaded[2].as_ref().unwrap().get("Name"), Some(&Value::from("a")));
}

#[tokio::test]
async fn test_cached_query_is_invalidated_by_tracked_change() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Email", "a@example.com").unwrap();
    user.set("Age", 20u8).unwrap();
    h.engine.flush(&mut user).await.unwrap();

    let found = h
        .engine
        .cached_search_one("User", "ByEmail", &[Value::from("a@example.com")])
        .await
        .unwrap();
    assert_eq!(found.map(|u| u.id()), Some(user.id()));
    let by_age = h.engine.cached_search_ids("User", "ByAge", &[Value::Uint(20)]).await.unwrap();
    assert_eq!(by_age, vec![user.id()]);

    user.set("Email", "b@example.com").unwrap();
    user.set("Age", 21u8).unwrap();
    h.engine.flush(&mut user).await.unwrap();

    let stale = h
        .engine
        .cached_search_one("User", "ByEmail", &[Value::from("a@example.com")])
        .await
        .unwrap();
    assert!(stale.is_none());
    let fresh = h
        .engine
        .cached_search_one("User", "ByEmail", &[Value::from("b@example.com")])
        .await
        .unwrap();
    assert_eq!(fresh.map(|u| u.id()), Some(user.id()));
    assert!(h.engine.cached_search_ids("User", "ByAge", &[Value::Uint(20)]).await.unwrap().is_empty());
    assert_eq!(
        h.engine.cached_search_ids("User", "ByAge", &[Value::Uint(21)]).await.unwrap(),
        vec![user.id()]
    );
}

#[tokio::test]
async fn test_soft_deleted_rows_leave_cached_queries() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Age", 33u8).unwrap();
    h.engine.flush(&mut user).await.unwrap();
    assert_eq!(h.engine.cached_search("User", "ByAge", &[Value::Uint(33)]).await.unwrap().len(), 1);

    h.engine.delete(&mut user).await.unwrap();
    assert!(h.engine.cached_search("User", "ByAge", &[Value::Uint(33)]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_soft_delete_invalidates_the_all_rows_query() {
    let h = harness();
    let mut user = h.engine.new_entity("User").unwrap();
    user.set("Name", "a").unwrap();
    h.engine.flush(&mut user).await.unwrap();
    assert_eq!(h.engine.cached_search_ids("User", "All", &[]).await.unwrap(), vec![user.id()]);

    h.engine.delete(&mut user).await.unwrap();
    assert!(h.sql.value("User", user.id(), "FakeDelete").is_some());
    assert!(h.engine.cached_search_ids("User", "All", &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cached_query_argument_errors() {
    let h = harness();
    let err = h.engine.cached_search_ids("User", "ByAge", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::ArgumentCount { expected: 1, got: 0, .. }));

    let err = h.engine.cached_search_ids("User", "Nope", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownQuery { .. }));

    let err = h.engine.cached_search_ids("User", "ByAge", &[Value::Uint(300)]).await.unwrap_err();
    assert!(matches!(err, EngineError::Bind(_)));
}

// =============================================================================
// Dirty markers
// =============================================================================

#[tokio::test]
async fn test_mark_dirty_publishes_one_event_per_id() {
    let h = harness();
    h.engine.mark_dirty("User", "dirty", &[1, 2, 3]).await.unwrap();
    let stats = h.engine.event_broker().stream_statistics(&["dirty"]).await.unwrap();
    assert_eq!(stats[0].len, 3);
    assert_eq!(stats[0].redis_pool, "default");

    let err = h.engine.mark_dirty("Ghost", "dirty", &[1]).await.unwrap_err();
    assert!(matches!(err, EngineError::Schema(_)));
}
