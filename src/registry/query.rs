//! Cached query templates.
//!
//! A template like `:Age > ? ORDER BY :Name` is rewritten into a WHERE clause
//! with quoted column references (`` `Age` > ? ORDER BY `Name` ``). Variables
//! before `order by` are filter fields, the ones after it are order fields.

use std::sync::OnceLock;

use regex::Regex;

use super::schema::FAKE_DELETE;

/// Result cap for multi-row templates.
pub const MAX_QUERY_ROWS: usize = 50_000;

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":([A-Za-z\d])+").expect("Invalid query variable regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedQuery {
    pub name: String,
    /// Rewritten WHERE clause, soft-delete filter included.
    pub clause: String,
    pub one: bool,
    pub max: usize,
    /// Every referenced column except `ID`; a change to any of them
    /// invalidates the template's cached results.
    pub tracked_fields: Vec<String>,
    /// Columns bound from the caller's arguments, plus the soft-delete flag.
    pub query_fields: Vec<String>,
    pub order_fields: Vec<String>,
}

impl CachedQuery {
    #[must_use]
    pub fn parse(name: &str, template: &str, one: bool, has_fake_delete: bool) -> Self {
        let re = variable_regex();
        let mut fields: Vec<String> = Vec::new();
        let mut clause = template.to_string();
        let mut variable_count = 0;
        for found in re.find_iter(template) {
            variable_count += 1;
            let field = &found.as_str()[1..];
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
            clause = clause.replacen(found.as_str(), &format!("`{field}`"), 1);
        }
        if has_fake_delete && variable_count > 0 {
            fields.push(FAKE_DELETE.to_string());
        }
        let clause = if clause.trim().is_empty() {
            if has_fake_delete {
                format!("`{FAKE_DELETE}` = 0 ORDER BY `ID`")
            } else {
                "1 ORDER BY `ID`".to_string()
            }
        } else if has_fake_delete {
            format!("`{FAKE_DELETE}` = 0 AND {clause}")
        } else {
            clause
        };

        let order_by = template.to_lowercase().find("order by");
        let mut tracked_fields = Vec::new();
        let mut query_fields = Vec::new();
        for field in &fields {
            if field != "ID" {
                tracked_fields.push(field.clone());
            }
            let in_filter = match (template.find(&format!(":{field}")), order_by) {
                (_, None) => true,
                (None, Some(_)) => true,
                (Some(pos), Some(order_pos)) => pos < order_pos,
            };
            if in_filter {
                query_fields.push(field.clone());
            }
        }
        // The soft-delete filter applies to every template, even one with no
        // variables of its own.
        if has_fake_delete && !tracked_fields.iter().any(|f| f == FAKE_DELETE) {
            tracked_fields.push(FAKE_DELETE.to_string());
        }
        let order_fields = order_by
            .map(|pos| {
                re.find_iter(&template[pos..])
                    .map(|m| m.as_str()[1..].to_string())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            clause,
            one,
            max: if one { 1 } else { MAX_QUERY_ROWS },
            tracked_fields,
            query_fields,
            order_fields,
        }
    }

    /// Filter fields supplied by the caller, in binding order.
    pub fn argument_fields(&self) -> impl Iterator<Item = &str> {
        self.query_fields
            .iter()
            .map(String::as_str)
            .filter(|f| *f != FAKE_DELETE)
    }

    /// Whether this is the implicit "every row by identity" template.
    #[must_use]
    pub fn is_full_scan(&self) -> bool {
        self.clause == "1 ORDER BY `ID`"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_are_rewritten_and_deduplicated() {
        let q = CachedQuery::parse("ByAge", ":Age >= ? AND :Age <= ? ORDER BY :Name", false, false);
        assert_eq!(q.clause, "`Age` >= ? AND `Age` <= ? ORDER BY `Name`");
        assert_eq!(q.query_fields, vec!["Age"]);
        assert_eq!(q.order_fields, vec!["Name"]);
        assert_eq!(q.tracked_fields, vec!["Age", "Name"]);
        assert_eq!(q.max, MAX_QUERY_ROWS);
    }

    #[test]
    fn test_soft_delete_filter_is_prepended() {
        let q = CachedQuery::parse("ByEmail", ":Email = ?", true, true);
        assert_eq!(q.clause, "`FakeDelete` = 0 AND `Email` = ?");
        assert_eq!(q.query_fields, vec!["Email", "FakeDelete"]);
        assert_eq!(q.argument_fields().collect::<Vec<_>>(), vec!["Email"]);
        assert_eq!(q.max, 1);
    }

    #[test]
    fn test_empty_template_becomes_full_scan() {
        let plain = CachedQuery::parse("All", "", false, false);
        assert!(plain.is_full_scan());
        assert!(plain.query_fields.is_empty());

        let soft = CachedQuery::parse("All", "", false, true);
        assert_eq!(soft.clause, "`FakeDelete` = 0 ORDER BY `ID`");
        assert!(!soft.is_full_scan());
        assert!(soft.query_fields.is_empty());
        assert_eq!(soft.tracked_fields, vec!["FakeDelete"]);
    }

    #[test]
    fn test_id_is_not_tracked() {
        let q = CachedQuery::parse("Recent", ":Age = ? ORDER BY :ID DESC", false, false);
        assert_eq!(q.tracked_fields, vec!["Age"]);
        assert_eq!(q.order_fields, vec!["ID"]);
    }
}
