//! Declarative tag language: `key=value` pairs separated by `;`.
//!
//! A key without a value reads as `"true"`. Values are split on the first
//! `=` only, so query templates like `queryOne=:Email = ?` survive intact.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    values: BTreeMap<String, String>,
}

impl TagSet {
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let values = source
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (part.to_string(), "true".to_string()),
            })
            .collect();
        Self { values }
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Resolve a tag the way pool references are resolved: absent gives
    /// `default`, a bare key gives `true_value`, anything else is returned.
    #[must_use]
    pub fn resolve<'a>(&'a self, key: &str, true_value: &'a str, default: &'a str) -> &'a str {
        match self.get(key) {
            None => default,
            Some("true") => true_value,
            Some(value) => value,
        }
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One `name[:ordinal]` membership from a `unique`/`index` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMembership {
    pub index: String,
    pub ordinal: usize,
}

/// Parse `Name:2,Other` into memberships; the ordinal defaults to 1.
pub fn parse_memberships(value: &str) -> Result<Vec<IndexMembership>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once(':') {
            Some((index, ordinal)) => ordinal
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|o| *o > 0)
                .map(|ordinal| IndexMembership {
                    index: index.trim().to_string(),
                    ordinal,
                })
                .ok_or_else(|| format!("invalid ordinal '{ordinal}' in '{part}'")),
            None => Ok(IndexMembership {
                index: part.to_string(),
                ordinal: 1,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_keys_read_as_true() {
        let tags = TagSet::parse("localCache;redisCache=second;table=users");
        assert_eq!(tags.get("localCache"), Some("true"));
        assert_eq!(tags.resolve("localCache", "default", ""), "default");
        assert_eq!(tags.resolve("redisCache", "default", ""), "second");
        assert_eq!(tags.resolve("mysql", "default", "default"), "default");
    }

    #[test]
    fn test_values_keep_embedded_equals() {
        let tags = TagSet::parse("queryOne=:Email = ? AND :Age = ?");
        assert_eq!(tags.get("queryOne"), Some(":Email = ? AND :Age = ?"));
    }

    #[test]
    fn test_memberships_default_ordinal() {
        let parsed = parse_memberships("Email,NameAge:2").unwrap();
        assert_eq!(
            parsed,
            vec![
                IndexMembership { index: "Email".into(), ordinal: 1 },
                IndexMembership { index: "NameAge".into(), ordinal: 2 },
            ]
        );
        assert!(parse_memberships("Bad:x").is_err());
        assert!(parse_memberships("Bad:0").is_err());
    }
}
