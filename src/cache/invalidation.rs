//! Path-based cache invalidation
//!
//! Cache keys for ledger reads carry path patterns such as
//! `alice/profile/**` or `*/post/main`. After a write, any entry holding a
//! pattern that can reach a written path is stale: either the pattern reads
//! the written value, a parent of it, or something beneath it.

use super::{CacheEntry, COMMIT_DOMAIN};
use crate::diff::extract_keys;
use serde_json::Value;

/// Decides which cache entries a write makes stale
#[derive(Debug, Clone)]
pub struct InvalidationMatcher {
    written: Vec<Vec<String>>,
}

impl InvalidationMatcher {
    pub fn new(written: &Value) -> Self {
        let written = extract_keys(written)
            .into_iter()
            .map(|path| path.split('/').map(str::to_string).collect())
            .collect();
        Self { written }
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Whether any pattern in the entry's key reaches a written path
    ///
    /// Permission entries are never derived from written data and are kept.
    pub fn is_stale(&self, entry: &CacheEntry) -> bool {
        if entry.domain == COMMIT_DOMAIN {
            return false;
        }
        let mut patterns = Vec::new();
        collect_strings(&entry.key, &mut patterns);
        patterns.iter().any(|pattern| {
            self.written
                .iter()
                .any(|path| pattern_overlaps(pattern, path))
        })
    }
}

/// Segment-wise prefix match of `pattern` against `path`
///
/// `*` matches any single segment and `**` matches everything after it.
/// Matching stops at the shorter of the two, so `alice/profile` overlaps
/// `alice/profile/name` and vice versa.
pub fn pattern_overlaps(pattern: &str, path: &[String]) -> bool {
    for (segment, written) in pattern.split('/').zip(path) {
        match segment {
            "**" => return true,
            "*" => continue,
            s if s == written => continue,
            _ => return false,
        }
    }
    true
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s.as_str()),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}
