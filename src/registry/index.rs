//! Index declarations and the coverage rules cached queries must satisfy.

use std::collections::BTreeMap;

use super::query::CachedQuery;
use super::schema::FAKE_DELETE;

/// Named indexes, columns in ordinal order.
pub type IndexMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexViolation {
    Duplicated { index: String, with: String },
    MissingUnique { query: String },
    Missing { query: String },
}

/// Collapse `ordinal -> column` declarations into ordered column lists.
#[must_use]
pub fn ordered(declared: &BTreeMap<String, BTreeMap<usize, String>>) -> IndexMap {
    declared
        .iter()
        .map(|(name, columns)| (name.clone(), columns.values().cloned().collect()))
        .collect()
}

fn count_matches(fields: &[String], columns: &[String]) -> usize {
    fields
        .iter()
        .map(|f| columns.iter().filter(|c| *c == f).count())
        .sum()
}

/// Order fields must close the index, read backwards. A trailing soft-delete
/// column is skipped and a trailing `ID` needs no column since every
/// secondary index ends with the primary key.
fn covers_order(order_fields: &[String], columns: &[String]) -> bool {
    let mut key = columns.len();
    if columns.last().map(String::as_str) == Some(FAKE_DELETE) {
        key -= 1;
    }
    let mut wanted = order_fields.len();
    if wanted > 0 && order_fields[wanted - 1] == "ID" {
        wanted -= 1;
    }
    for field in order_fields[..wanted].iter().rev() {
        if key == 0 || &columns[key - 1] != field {
            return false;
        }
        key -= 1;
    }
    true
}

pub fn validate(
    unique: &IndexMap,
    indexes: &IndexMap,
    queries: &BTreeMap<String, CachedQuery>,
) -> Result<(), IndexViolation> {
    let all: IndexMap = unique
        .iter()
        .chain(indexes.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (name, columns) in &all {
        for (other, other_columns) in &all {
            if name == other {
                continue;
            }
            if other_columns.len() >= columns.len() && other_columns[..columns.len()] == columns[..] {
                return Err(IndexViolation::Duplicated {
                    index: name.clone(),
                    with: other.clone(),
                });
            }
        }
    }

    for (name, query) in queries.iter().filter(|(_, q)| q.one) {
        let fields: Vec<String> = query
            .query_fields
            .iter()
            .filter(|f| *f != FAKE_DELETE)
            .cloned()
            .collect();
        let covered = unique
            .values()
            .any(|columns| columns.len() == fields.len() && count_matches(&fields, columns) == columns.len());
        if !covered {
            return Err(IndexViolation::MissingUnique { query: name.clone() });
        }
    }

    for (name, query) in queries.iter().filter(|(_, q)| !q.one) {
        if query.is_full_scan() {
            continue;
        }
        let covered = all.values().any(|columns| {
            count_matches(&query.query_fields, columns) == query.query_fields.len()
                && covers_order(&query.order_fields, columns)
        });
        if !covered {
            return Err(IndexViolation::Missing { query: name.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, &[&str])]) -> IndexMap {
        entries
            .iter()
            .map(|(n, cols)| (n.to_string(), cols.iter().map(|c| c.to_string()).collect()))
            .collect()
    }

    fn queries(list: &[CachedQuery]) -> BTreeMap<String, CachedQuery> {
        list.iter().map(|q| (q.name.clone(), q.clone())).collect()
    }

    #[test]
    fn test_prefix_duplicates_are_rejected() {
        let unique = index(&[("Email", &["Email"])]);
        let plain = index(&[("EmailName", &["Email", "Name"])]);
        assert_eq!(
            validate(&unique, &plain, &BTreeMap::new()),
            Err(IndexViolation::Duplicated {
                index: "Email".into(),
                with: "EmailName".into()
            })
        );
        let distinct = index(&[("NameEmail", &["Name", "Email"])]);
        assert!(validate(&unique, &distinct, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_query_one_needs_unique_index() {
        let q = queries(&[CachedQuery::parse("ByEmail", ":Email = ?", true, false)]);
        assert!(validate(&index(&[("Email", &["Email"])]), &IndexMap::new(), &q).is_ok());
        assert_eq!(
            validate(&IndexMap::new(), &index(&[("Email", &["Email"])]), &q),
            Err(IndexViolation::MissingUnique { query: "ByEmail".into() })
        );
    }

    #[test]
    fn test_query_order_fields_close_the_index() {
        let q = queries(&[CachedQuery::parse("ByAge", ":Age = ? ORDER BY :Name", false, true)]);
        let good = index(&[("AgeName", &["FakeDelete", "Age", "Name"])]);
        let bad = index(&[("NameAge", &["Name", "Age", "FakeDelete"])]);
        assert!(validate(&IndexMap::new(), &good, &q).is_ok());
        assert!(validate(&IndexMap::new(), &bad, &q).is_err());
    }

    #[test]
    fn test_trailing_id_order_is_implicit() {
        let q = queries(&[CachedQuery::parse("ByAge", ":Age = ? ORDER BY :ID", false, false)]);
        assert!(validate(&IndexMap::new(), &index(&[("Age", &["Age"])]), &q).is_ok());
    }

    #[test]
    fn test_full_scan_needs_no_index() {
        let q = queries(&[CachedQuery::parse("All", "", false, false)]);
        assert!(validate(&IndexMap::new(), &IndexMap::new(), &q).is_ok());
    }
}
