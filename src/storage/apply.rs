//! Transaction application.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{ReplicaError, Result};
use crate::tx::{Tx, TxKind, UpdateOp};
use crate::types::{Doc, Ref};

/// Apply a transaction to a document map.
///
/// Create inserts (an existing id is a duplicate-create), update merges
/// field operations, delete removes. Update and delete of a missing id are
/// not-found errors. On error the map is left untouched.
pub fn apply_tx(docs: &mut HashMap<Ref, Doc>, tx: &Tx) -> Result<()> {
    match &tx.kind {
        TxKind::Create { attributes } => {
            if docs.contains_key(&tx.object_id) {
                return Err(ReplicaError::DuplicateCreate {
                    id: tx.object_id.clone(),
                });
            }
            let doc = Doc {
                id: tx.object_id.clone(),
                class: tx.object_class.clone(),
                space: tx.object_space.clone(),
                modified_on: tx.modified_on,
                modified_by: tx.modified_by.clone(),
                attributes: attributes.clone(),
                mixins: Default::default(),
            };
            docs.insert(doc.id.clone(), doc);
            Ok(())
        }

        TxKind::Update { operations, mixin } => {
            let current = docs.get(&tx.object_id).ok_or_else(|| ReplicaError::NotFound {
                id: tx.object_id.clone(),
            })?;

            // Work on a copy so a failing operation leaves the stored document as is.
            let mut updated = current.clone();
            let fields = match mixin {
                Some(mixin) => updated.mixins.entry(mixin.clone()).or_default(),
                None => &mut updated.attributes,
            };
            for op in operations {
                apply_update(fields, op)?;
            }
            updated.modified_on = tx.modified_on;
            updated.modified_by = tx.modified_by.clone();

            docs.insert(updated.id.clone(), updated);
            Ok(())
        }

        TxKind::Delete => match docs.remove(&tx.object_id) {
            Some(_) => Ok(()),
            None => Err(ReplicaError::NotFound {
                id: tx.object_id.clone(),
            }),
        },
    }
}

/// Apply one field operation.
pub fn apply_update(fields: &mut Map<String, Value>, op: &UpdateOp) -> Result<()> {
    match op {
        UpdateOp::Set { fields: values } => {
            for (name, value) in values {
                fields.insert(name.clone(), value.clone());
            }
            Ok(())
        }

        UpdateOp::Unset { field } => {
            fields.remove(field);
            Ok(())
        }

        UpdateOp::Push { field, value } => {
            match fields
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                Value::Array(items) => {
                    items.push(value.clone());
                    Ok(())
                }
                other => Err(ReplicaError::InvalidUpdate(format!(
                    "push to non-array field '{}' ({})",
                    field, other
                ))),
            }
        }

        UpdateOp::Pull { field, value } => match fields.get_mut(field) {
            Some(Value::Array(items)) => {
                items.retain(|item| item != value);
                Ok(())
            }
            None => Ok(()),
            Some(other) => Err(ReplicaError::InvalidUpdate(format!(
                "pull from non-array field '{}' ({})",
                field, other
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassRef;
    use proptest::prelude::*;
    use serde_json::json;

    const TASK: &str = "class:task.Task";

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn store_with_task() -> HashMap<Ref, Doc> {
        let mut docs = HashMap::new();
        let tx = Tx::create("t1", TASK, attrs(json!({"title": "Write docs", "tags": ["a"]})))
            .with_space("sp1")
            .with_modified_by("alice");
        apply_tx(&mut docs, &tx).unwrap();
        docs
    }

    #[test]
    fn test_create() {
        let docs = store_with_task();
        let doc = &docs[&Ref::from("t1")];
        assert_eq!(doc.class.as_str(), TASK);
        assert_eq!(doc.space, Some(Ref::from("sp1")));
        assert_eq!(doc.modified_by, "alice");
        assert_eq!(doc.get_str("title"), Some("Write docs"));
    }

    #[test]
    fn test_duplicate_create_leaves_state() {
        let mut docs = store_with_task();
        let tx = Tx::create("t1", TASK, attrs(json!({"title": "other"})));

        let err = apply_tx(&mut docs, &tx).unwrap_err();
        assert!(matches!(err, ReplicaError::DuplicateCreate { .. }));
        assert_eq!(docs[&Ref::from("t1")].get_str("title"), Some("Write docs"));
    }

    #[test]
    fn test_update_merges_fields() {
        let mut docs = store_with_task();
        let tx = Tx::update(
            "t1",
            TASK,
            vec![
                UpdateOp::set("title", "Write docs v2"),
                UpdateOp::Push {
                    field: "tags".into(),
                    value: json!("b"),
                },
                UpdateOp::Pull {
                    field: "tags".into(),
                    value: json!("a"),
                },
            ],
        )
        .with_modified_by("bob");
        apply_tx(&mut docs, &tx).unwrap();

        let doc = &docs[&Ref::from("t1")];
        assert_eq!(doc.get_str("title"), Some("Write docs v2"));
        assert_eq!(doc.attributes["tags"], json!(["b"]));
        assert_eq!(doc.modified_by, "bob");
    }

    #[test]
    fn test_update_mixin() {
        let mut docs = store_with_task();
        let tx = Tx::update_mixin("t1", TASK, "mixin:task.Estimate", vec![UpdateOp::set("hours", 4)]);
        apply_tx(&mut docs, &tx).unwrap();

        let doc = &docs[&Ref::from("t1")];
        assert!(doc.has_mixin(&"mixin:task.Estimate".into()));
        assert_eq!(doc.mixins[&ClassRef::from("mixin:task.Estimate")]["hours"], json!(4));
        assert!(!doc.attributes.contains_key("hours"));
    }

    #[test]
    fn test_failed_update_is_atomic() {
        let mut docs = store_with_task();
        let tx = Tx::update(
            "t1",
            TASK,
            vec![
                UpdateOp::set("title", "changed"),
                UpdateOp::Push {
                    field: "title".into(),
                    value: json!("x"),
                },
            ],
        );

        let err = apply_tx(&mut docs, &tx).unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidUpdate(_)));
        assert_eq!(docs[&Ref::from("t1")].get_str("title"), Some("Write docs"));
    }

    #[test]
    fn test_missing_document() {
        let mut docs = HashMap::new();
        let update = Tx::update("nope", TASK, vec![UpdateOp::set("a", 1)]);
        let delete = Tx::delete("nope", TASK);

        assert!(matches!(
            apply_tx(&mut docs, &update),
            Err(ReplicaError::NotFound { .. })
        ));
        assert!(matches!(
            apply_tx(&mut docs, &delete),
            Err(ReplicaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let mut docs = store_with_task();
        apply_tx(&mut docs, &Tx::delete("t1", TASK)).unwrap();
        assert!(docs.is_empty());
    }

    proptest! {
        #[test]
        fn prop_set_is_last_writer_wins(values in proptest::collection::vec(any::<i64>(), 1..20)) {
            let mut docs = store_with_task();
            for v in &values {
                apply_tx(&mut docs, &Tx::update("t1", TASK, vec![UpdateOp::set("n", *v)])).unwrap();
            }
            let last = values.last().copied().unwrap();
            prop_assert_eq!(&docs[&Ref::from("t1")].attributes["n"], &json!(last));
        }

        #[test]
        fn prop_push_then_pull_removes(items in proptest::collection::vec(0u8..5, 1..20), target in 0u8..5) {
            let mut fields = Map::new();
            for item in &items {
                apply_update(&mut fields, &UpdateOp::Push { field: "xs".into(), value: json!(item) }).unwrap();
            }
            apply_update(&mut fields, &UpdateOp::Pull { field: "xs".into(), value: json!(target) }).unwrap();

            let expected: Vec<Value> = items.iter().filter(|i| **i != target).map(|i| json!(i)).collect();
            prop_assert_eq!(&fields["xs"], &Value::Array(expected));
        }
    }
}
