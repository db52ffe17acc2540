//! In-memory relational store for tests and local development.
//!
//! Applies [`Mutation`]s directly instead of parsing SQL. Statements of one
//! `execute` call are transactional: on the first failure every table is
//! restored. Primary keys and declared unique constraints are enforced with
//! MySQL's duplicate-key code `1062`, so recovery paths see the same error
//! shape they get in production.
//!
//! `search_ids` understands the WHERE clauses query templates produce when
//! they are conjunctions of `` `Col` = ? `` (or a numeric literal) with an
//! optional `ORDER BY` list. Anything else is [`StorageError::Unsupported`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use super::traits::{ColumnType, ExecResult, Mutation, RelationalStore, SqlStatement, StorageError};
use crate::value::Value;

type Row = HashMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: BTreeMap<u64, Row>,
    next_id: u64,
}

impl MemoryTable {
    fn allocate_id(&mut self) -> u64 {
        self.next_id = self.next_id.max(self.rows.keys().next_back().copied().unwrap_or(0)) + 1;
        self.next_id
    }
}

pub struct InMemoryRelationalStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
    unique: HashMap<String, Vec<Vec<String>>>,
    executed: Mutex<Vec<SqlStatement>>,
}

fn duplicate(id: impl std::fmt::Display, key: &str) -> StorageError {
    StorageError::Database {
        code: Some("1062".into()),
        message: format!("Duplicate entry '{id}' for key '{key}'"),
    }
}

impl InMemoryRelationalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            unique: HashMap::new(),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Enforce a unique constraint over `columns` of `table`.
    #[must_use]
    pub fn with_unique(mut self, table: &str, columns: &[&str]) -> Self {
        self.unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Every statement committed so far, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<SqlStatement> {
        self.executed.lock().clone()
    }

    pub fn clear_executed(&self) {
        self.executed.lock().clear();
    }

    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.rows.len())
    }

    /// Raw stored value of one column.
    #[must_use]
    pub fn value(&self, table: &str, id: u64, column: &str) -> Option<Value> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .and_then(|row| row.get(column).cloned())
    }

    fn check_unique(&self, table_name: &str, table: &MemoryTable, id: u64, row: &Row) -> Result<(), StorageError> {
        let Some(constraints) = self.unique.get(table_name) else {
            return Ok(());
        };
        for columns in constraints {
            let candidate: Vec<&Value> = columns.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
            if candidate.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = table.rows.iter().any(|(other_id, other)| {
                *other_id != id
                    && columns
                        .iter()
                        .zip(&candidate)
                        .all(|(c, v)| other.get(c).is_some_and(|o| values_equal(o, v)))
            });
            if clash {
                return Err(duplicate(
                    candidate.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>().join("-"),
                    &columns.join("_"),
                ));
            }
        }
        Ok(())
    }

    fn apply(&self, tables: &mut HashMap<String, MemoryTable>, statement: &SqlStatement) -> Result<ExecResult, StorageError> {
        let table = tables.entry(statement.table.clone()).or_default();
        match &statement.mutation {
            Mutation::Insert { columns, rows } => {
                let mut first_generated = None;
                for values in rows {
                    let mut row: Row = columns.iter().cloned().zip(values.iter().cloned()).collect();
                    let explicit = row.get("ID").and_then(Value::as_u64).filter(|id| *id > 0);
                    let id = match explicit {
                        Some(id) => id,
                        None => {
                            let id = table.allocate_id();
                            first_generated.get_or_insert(id);
                            id
                        }
                    };
                    if table.rows.contains_key(&id) {
                        return Err(duplicate(id, "PRIMARY"));
                    }
                    row.insert("ID".into(), Value::Uint(id));
                    self.check_unique(&statement.table, table, id, &row)?;
                    table.rows.insert(id, row);
                }
                Ok(ExecResult {
                    rows_affected: rows.len() as u64,
                    last_insert_id: first_generated,
                })
            }
            Mutation::Update { id, set } => {
                let Some(existing) = table.rows.get(id) else {
                    return Ok(ExecResult::default());
                };
                let mut row = existing.clone();
                for (column, value) in set {
                    row.insert(column.clone(), value.clone());
                }
                self.check_unique(&statement.table, table, *id, &row)?;
                table.rows.insert(*id, row);
                Ok(ExecResult {
                    rows_affected: 1,
                    last_insert_id: None,
                })
            }
            Mutation::Delete { id } => Ok(ExecResult {
                rows_affected: u64::from(table.rows.remove(id).is_some()),
                last_insert_id: None,
            }),
        }
    }
}

impl Default for InMemoryRelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Uint(x), Value::Int(y)) | (Value::Int(y), Value::Uint(x)) => i64::try_from(*x).is_ok_and(|x| x == *y),
        (Value::Bool(x), Value::Int(y)) | (Value::Int(y), Value::Bool(x)) => i64::from(*x) == *y,
        (Value::Bool(x), Value::Uint(y)) | (Value::Uint(y), Value::Bool(x)) => u64::from(*x) == *y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Uint(x), Value::Uint(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Time(x), Value::Time(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

enum Operand {
    Param,
    Literal(i64),
}

struct Filter {
    conditions: Vec<(String, Operand)>,
    order: Vec<(String, bool)>,
}

fn condition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^`(\w+)`\s*=\s*(\?|-?\d+)$").expect("Invalid condition regex"))
}

fn parse_filter(clause: &str) -> Result<Filter, StorageError> {
    let unsupported = || StorageError::Unsupported(format!("where clause '{clause}'"));
    let lower = clause.to_lowercase();
    let (filter_part, order_part) = match lower.find("order by") {
        Some(pos) => (&clause[..pos], Some(&clause[pos + "order by".len()..])),
        None => (clause, None),
    };

    let mut conditions = Vec::new();
    let filter_part = filter_part.trim();
    if filter_part != "1" && !filter_part.is_empty() {
        for term in filter_part.split(" AND ").flat_map(|t| t.split(" and ")) {
            let caps = condition_regex().captures(term.trim()).ok_or_else(unsupported)?;
            let operand = match &caps[2] {
                "?" => Operand::Param,
                literal => Operand::Literal(literal.parse().map_err(|_| unsupported())?),
            };
            conditions.push((caps[1].to_string(), operand));
        }
    }

    let mut order = Vec::new();
    if let Some(order_part) = order_part {
        for term in order_part.split(',') {
            let mut words = term.split_whitespace();
            let column = words.next().ok_or_else(unsupported)?.trim_matches('`').to_string();
            let descending = matches!(words.next(), Some(dir) if dir.eq_ignore_ascii_case("desc"));
            order.push((column, descending));
        }
    }
    Ok(Filter { conditions, order })
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    async fn execute(&self, statements: &[SqlStatement]) -> Result<Vec<ExecResult>, StorageError> {
        let mut tables = self.tables.lock();
        let before = tables.clone();
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            match self.apply(&mut tables, statement) {
                Ok(result) => results.push(result),
                Err(e) => {
                    *tables = before;
                    return Err(e);
                }
            }
        }
        self.executed.lock().extend(statements.iter().cloned());
        Ok(results)
    }

    async fn load_row(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        id: u64,
    ) -> Result<Option<Vec<Value>>, StorageError> {
        let tables = self.tables.lock();
        Ok(tables.get(table).and_then(|t| t.rows.get(&id)).map(|row| {
            columns
                .iter()
                .map(|(name, _)| row.get(name).cloned().unwrap_or(Value::Null))
                .collect()
        }))
    }

    async fn search_ids(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
        limit: usize,
    ) -> Result<Vec<u64>, StorageError> {
        let filter = parse_filter(where_clause)?;
        let tables = self.tables.lock();
        let Some(table) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<(&u64, &Row)> = table
            .rows
            .iter()
            .filter(|(_, row)| {
                let mut params = params.iter();
                filter.conditions.iter().all(|(column, operand)| {
                    let stored = row.get(column).unwrap_or(&Value::Null);
                    match operand {
                        Operand::Param => params.next().is_some_and(|p| !p.is_null() && values_equal(stored, p)),
                        Operand::Literal(n) => values_equal(stored, &Value::Int(*n)),
                    }
                })
            })
            .collect();

        matched.sort_by(|(a_id, a), (b_id, b)| {
            filter
                .order
                .iter()
                .map(|(column, descending)| {
                    let ordering = if column == "ID" {
                        a_id.cmp(b_id)
                    } else {
                        compare_values(
                            a.get(column).unwrap_or(&Value::Null),
                            b.get(column).unwrap_or(&Value::Null),
                        )
                    };
                    if *descending { ordering.reverse() } else { ordering }
                })
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a_id.cmp(b_id))
        });

        Ok(matched.into_iter().take(limit).map(|(id, _)| *id).collect())
    }
}
