//! Document filters and find options.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::types::{Doc, Ref};

/// A single predicate on a field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// Equal, or contained in an array field.
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    /// SQL-style pattern; `%` matches any run of characters.
    Like(String),
    Gt(Value),
    Lt(Value),
}

impl Predicate {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Eq(expected) => value.map_or(false, |v| value_eq(v, expected)),
            Predicate::Ne(expected) => !value.map_or(false, |v| value_eq(v, expected)),
            Predicate::In(options) => {
                value.map_or(false, |v| options.iter().any(|o| value_eq(v, o)))
            }
            Predicate::Nin(options) => {
                !value.map_or(false, |v| options.iter().any(|o| value_eq(v, o)))
            }
            Predicate::Exists(expected) => value.is_some() == *expected,
            Predicate::Like(pattern) => value
                .and_then(Value::as_str)
                .map_or(false, |s| like(s, pattern)),
            Predicate::Gt(bound) => {
                value.and_then(|v| compare_values(v, bound)) == Some(Ordering::Greater)
            }
            Predicate::Lt(bound) => {
                value.and_then(|v| compare_values(v, bound)) == Some(Ordering::Less)
            }
        }
    }
}

/// Equality where an array field matches any of its elements.
fn value_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Array(items), expected) if !expected.is_array() => items.contains(expected),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => false,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn like(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };

    let last = rest[rest.len() - 1];
    for part in &rest[..rest.len() - 1] {
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub predicate: Predicate,
}

/// Conjunction of field conditions. The empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, Predicate::Eq(value.into()))
    }

    pub fn by_id(id: &Ref) -> Self {
        Self::eq("_id", id.as_str())
    }

    pub fn and(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            predicate,
        });
        self
    }

    pub fn and_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, Predicate::Eq(value.into()))
    }

    pub fn matches(&self, doc: &Doc) -> bool {
        self.conditions
            .iter()
            .all(|c| c.predicate.matches(doc.get(&c.field).as_ref()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sorting and paging for find and live queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub sort: Vec<(String, SortOrder)>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A page of results plus the number of matches before paging.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub docs: Vec<Doc>,
    pub total: usize,
}

/// Filter, sort and page candidate documents.
///
/// Without a sort order, results are ordered by id so repeated evaluation of
/// the same state yields the same sequence.
pub fn evaluate(candidates: Vec<Doc>, filter: &Filter, options: &FindOptions) -> Page {
    let mut docs: Vec<Doc> = candidates.into_iter().filter(|d| filter.matches(d)).collect();
    let total = docs.len();

    docs.sort_by(|a, b| {
        for (field, order) in &options.sort {
            let ord = compare_fields(a.get(field).as_ref(), b.get(field).as_ref());
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    });

    let skip = options.skip.unwrap_or(0);
    let docs = docs
        .into_iter()
        .skip(skip)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();

    Page { docs, total }
}

/// Missing values sort first; values of unrelated types compare equal.
fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn task(id: &str, title: &str, rank: i64) -> Doc {
        Doc::new(id, "class:task.Task")
            .with_attr("title", title)
            .with_attr("rank", rank)
            .with_attr("tags", json!(["work"]))
    }

    #[test]
    fn test_predicates() {
        let doc = task("t1", "Write docs", 3);

        assert!(Filter::eq("title", "Write docs").matches(&doc));
        assert!(Filter::eq("tags", "work").matches(&doc));
        assert!(Filter::by_id(&"t1".into()).matches(&doc));
        assert!(!Filter::eq("title", "other").matches(&doc));
        assert!(Filter::all()
            .and("rank", Predicate::Gt(json!(2)))
            .and("rank", Predicate::Lt(json!(4)))
            .matches(&doc));
        assert!(Filter::all()
            .and("rank", Predicate::In(vec![json!(1), json!(3)]))
            .matches(&doc));
        assert!(Filter::all()
            .and("rank", Predicate::Nin(vec![json!(1)]))
            .matches(&doc));
        assert!(Filter::all()
            .and("missing", Predicate::Exists(false))
            .matches(&doc));
        assert!(Filter::all()
            .and("missing", Predicate::Ne(json!(1)))
            .matches(&doc));
    }

    #[test]
    fn test_like() {
        assert!(like("Write docs", "Write%"));
        assert!(like("Write docs", "%docs"));
        assert!(like("Write docs", "%ite%oc%"));
        assert!(like("Write docs", "%"));
        assert!(!like("Write docs", "docs%"));
        assert!(!like("ab", "a%b%b"));
        assert!(like("abab", "a%b%b"));
    }

    #[test]
    fn test_evaluate_sort_and_page() {
        let docs = vec![task("a", "x", 2), task("b", "y", 1), task("c", "z", 3)];
        let options = FindOptions::default()
            .sort_by("rank", SortOrder::Descending)
            .skip(1)
            .limit(1);

        let page = evaluate(docs, &Filter::all(), &options);
        assert_eq!(page.total, 3);
        assert_eq!(page.docs.len(), 1);
        assert_eq!(page.docs[0].id.as_str(), "a");
    }

    proptest! {
        #[test]
        fn prop_page_is_bounded(n in 0usize..30, skip in 0usize..40, limit in 0usize..40) {
            let docs: Vec<Doc> = (0..n).map(|i| task(&format!("t{i:02}"), "x", i as i64)).collect();
            let page = evaluate(docs, &Filter::all(), &FindOptions::default().skip(skip).limit(limit));
            prop_assert_eq!(page.total, n);
            prop_assert_eq!(page.docs.len(), n.saturating_sub(skip).min(limit));
        }

        #[test]
        fn prop_like_literal_prefix(prefix in "[a-z]{0,6}", suffix in "[a-z]{0,6}") {
            let text = format!("{prefix}{suffix}");
            let pattern = format!("{prefix}%");
            prop_assert!(like(&text, &pattern));
        }
    }
}
