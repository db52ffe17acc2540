// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL rendering for flush records.
//!
//! Records become [`SqlStatement`]s in the order they were produced.
//! Adjacent inserts into the same table are folded into one multi-row
//! `INSERT` when every row carries its identity and the same columns, so
//! generated identities never have to be mapped back from a batch.

use super::diff::{EntitySqlFlush, FlushAction};
use crate::registry::TableSchema;
use crate::storage::{Mutation, SqlStatement};
use crate::value::Value;

/// A statement plus the indexes of the records it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementPlan {
    pub statement: SqlStatement,
    pub records: Vec<usize>,
}

fn statement_for(schema: &TableSchema, record: &EntitySqlFlush) -> SqlStatement {
    let mutation = match record.action {
        FlushAction::Insert => {
            let (columns, row): (Vec<String>, Vec<Value>) = schema
                .columns()
                .iter()
                .filter_map(|c| record.update.get(&c.name).map(|v| (c.name.clone(), v.clone())))
                .unzip();
            Mutation::Insert {
                columns,
                rows: vec![row],
            }
        }
        FlushAction::Update => Mutation::Update {
            id: record.id,
            set: schema
                .columns()
                .iter()
                .filter_map(|c| record.update.get(&c.name).map(|v| (c.name.clone(), v.clone())))
                .collect(),
        },
        FlushAction::Delete => Mutation::Delete { id: record.id },
    };
    SqlStatement {
        table: schema.table_name().to_string(),
        mutation,
    }
}

/// Fold `next` into `last` when both are inserts of fully identified rows.
fn try_merge(last: &mut StatementPlan, next: &SqlStatement) -> bool {
    if last.statement.table != next.table {
        return false;
    }
    let (
        Mutation::Insert { columns, rows },
        Mutation::Insert {
            columns: next_columns,
            rows: next_rows,
        },
    ) = (&mut last.statement.mutation, &next.mutation)
    else {
        return false;
    };
    if columns != next_columns || columns.first().map(String::as_str) != Some("ID") {
        return false;
    }
    rows.extend(next_rows.iter().cloned());
    true
}

#[must_use]
pub fn plan_statements(records: &[(&TableSchema, &EntitySqlFlush)]) -> Vec<StatementPlan> {
    let mut plans: Vec<StatementPlan> = Vec::new();
    for (index, (schema, record)) in records.iter().enumerate() {
        let statement = statement_for(schema, record);
        if let Some(last) = plans.last_mut() {
            if try_merge(last, &statement) {
                last.records.push(index);
                continue;
            }
        }
        plans.push(StatementPlan {
            statement,
            records: vec![index],
        });
    }
    plans
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

impl SqlStatement {
    /// Render as parameterized SQL with `?` placeholders.
    #[must_use]
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match &self.mutation {
            Mutation::Insert { columns, rows } => {
                let quoted: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
                let tuple = format!("({})", placeholders(columns.len()));
                let sql = format!(
                    "INSERT INTO `{}`({}) VALUES {}",
                    self.table,
                    quoted.join(","),
                    vec![tuple.as_str(); rows.len()].join(",")
                );
                (sql, rows.iter().flatten().cloned().collect())
            }
            Mutation::Update { id, set } => {
                let assignments: Vec<String> = set.iter().map(|(c, _)| format!("`{c}` = ?")).collect();
                let mut params: Vec<Value> = set.iter().map(|(_, v)| v.clone()).collect();
                params.push(Value::Uint(*id));
                (
                    format!("UPDATE `{}` SET {} WHERE `ID` = ?", self.table, assignments.join(",")),
                    params,
                )
            }
            Mutation::Delete { id } => (
                format!("DELETE FROM `{}` WHERE `ID` = ?", self.table),
                vec![Value::Uint(*id)],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(table: &str, columns: &[&str], row: Vec<Value>) -> SqlStatement {
        SqlStatement {
            table: table.into(),
            mutation: Mutation::Insert {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: vec![row],
            },
        }
    }

    #[test]
    fn test_render_insert() {
        let (sql, params) = insert("users", &["Name", "Age"], vec!["a".into(), 3u8.into()]).to_sql();
        assert_eq!(sql, "INSERT INTO `users`(`Name`,`Age`) VALUES (?,?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_render_update_and_delete() {
        let update = SqlStatement {
            table: "users".into(),
            mutation: Mutation::Update {
                id: 9,
                set: vec![("Name".into(), "b".into()), ("Age".into(), Value::Null)],
            },
        };
        let (sql, params) = update.to_sql();
        assert_eq!(sql, "UPDATE `users` SET `Name` = ?,`Age` = ? WHERE `ID` = ?");
        assert_eq!(params.last(), Some(&Value::Uint(9)));

        let delete = SqlStatement {
            table: "users".into(),
            mutation: Mutation::Delete { id: 9 },
        };
        assert_eq!(delete.to_sql().0, "DELETE FROM `users` WHERE `ID` = ?");
    }

    #[test]
    fn test_identified_inserts_merge() {
        let mut plan = StatementPlan {
            statement: insert("users", &["ID", "Name"], vec![1u64.into(), "a".into()]),
            records: vec![0],
        };
        assert!(try_merge(&mut plan, &insert("users", &["ID", "Name"], vec![2u64.into(), "b".into()])));
        assert!(!try_merge(&mut plan, &insert("users", &["Name"], vec!["c".into()])));
        assert!(!try_merge(&mut plan, &insert("posts", &["ID", "Name"], vec![3u64.into(), "d".into()])));
        assert_eq!(
            plan.statement.to_sql().0,
            "INSERT INTO `users`(`ID`,`Name`) VALUES (?,?),(?,?)"
        );
    }
}
