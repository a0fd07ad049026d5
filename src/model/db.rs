//! In-memory schema registry and model-domain store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use super::classes::{core_classes, ClassInfo, ClassKind, GENERIC_DOMAIN};
use crate::error::{ReplicaError, Result};
use crate::storage::{apply_tx, DocStorage};
use crate::tx::Tx;
use crate::types::{ClassRef, Doc, Ref};

/// Longest `extends` chain followed before giving up (guards against cycles).
const MAX_HIERARCHY_DEPTH: usize = 64;

#[derive(Default)]
struct ModelState {
    /// Every document of the model domain, descriptors included.
    docs: HashMap<Ref, Doc>,
    classes: HashMap<ClassRef, ClassInfo>,
}

impl ModelState {
    fn with_docs(docs: HashMap<Ref, Doc>) -> Self {
        let classes = docs
            .values()
            .filter_map(ClassInfo::from_doc)
            .map(|info| (info.id.clone(), info))
            .collect();
        Self { docs, classes }
    }

    /// Walk `class` and its ancestors, nearest first.
    fn ancestors<'a>(&'a self, class: &'a ClassRef) -> impl Iterator<Item = &'a ClassRef> + 'a {
        let mut current = Some(class);
        let mut depth = 0;
        std::iter::from_fn(move || {
            if depth >= MAX_HIERARCHY_DEPTH {
                return None;
            }
            depth += 1;
            let this = current?;
            current = self.classes.get(this).and_then(|c| c.extends.as_ref());
            Some(this)
        })
    }

    fn domain(&self, class: &ClassRef) -> String {
        self.ancestors(class)
            .find_map(|c| self.classes.get(c).and_then(|info| info.domain.clone()))
            .unwrap_or_else(|| GENERIC_DOMAIN.to_string())
    }

    fn is_derived(&self, class: &ClassRef, base: &ClassRef) -> bool {
        self.ancestors(class).any(|c| c == base)
    }

    fn is_mixin(&self, class: &ClassRef) -> bool {
        matches!(self.classes.get(class), Some(info) if info.kind == ClassKind::Mixin)
    }
}

/// The schema registry.
///
/// Populated once from the model domain at startup. Class descriptors may
/// later be added or edited by transactions, but a class never changes
/// domain once known.
pub struct ModelDb {
    state: RwLock<ModelState>,
}

impl ModelDb {
    /// Create a registry holding only the core classes.
    pub fn new() -> Self {
        let docs = core_classes()
            .into_iter()
            .map(|info| {
                let doc = info.to_doc();
                (doc.id.clone(), doc)
            })
            .collect();
        Self {
            state: RwLock::new(ModelState::with_docs(docs)),
        }
    }

    /// Ingest the raw documents of the model domain.
    ///
    /// Loaded documents replace core descriptors with the same id.
    pub fn load_model(&self, raw: Vec<Doc>) {
        let mut state = self.state.write();
        let mut docs = std::mem::take(&mut state.docs);
        let count = raw.len();
        for doc in raw {
            docs.insert(doc.id.clone(), doc);
        }
        *state = ModelState::with_docs(docs);
        debug!(documents = count, classes = state.classes.len(), "model loaded");
    }

    /// Domain owning documents of `class`: the nearest declared domain up the
    /// hierarchy, or [`GENERIC_DOMAIN`].
    pub fn get_domain(&self, class: &ClassRef) -> String {
        self.state.read().domain(class)
    }

    pub fn class(&self, class: &ClassRef) -> Option<ClassInfo> {
        self.state.read().classes.get(class).cloned()
    }

    pub fn classes(&self) -> Vec<ClassInfo> {
        self.state.read().classes.values().cloned().collect()
    }

    /// `class` and its ancestors, nearest first.
    pub fn ancestors(&self, class: &ClassRef) -> Vec<ClassRef> {
        self.state.read().ancestors(class).cloned().collect()
    }

    /// True if `class` is `base` or inherits from it.
    pub fn is_derived(&self, class: &ClassRef, base: &ClassRef) -> bool {
        self.state.read().is_derived(class, base)
    }

    pub fn is_mixin(&self, class: &ClassRef) -> bool {
        self.state.read().is_mixin(class)
    }

    /// Whether a query over `class` should see `doc`.
    pub fn matches_class(&self, doc: &Doc, class: &ClassRef) -> bool {
        let state = self.state.read();
        state.is_derived(&doc.class, class) || (state.is_mixin(class) && doc.has_mixin(class))
    }

    /// Whether `tx` may change the results of a query over `class`.
    ///
    /// Conservative: any transaction on a subclass counts; for a mixin query
    /// any transaction on the class the mixin extends counts.
    pub fn affects(&self, class: &ClassRef, tx: &Tx) -> bool {
        let state = self.state.read();
        if state.is_derived(&tx.object_class, class) {
            return true;
        }
        match state.classes.get(class) {
            Some(info) if info.kind == ClassKind::Mixin => {
                tx.mixin() == Some(class)
                    || info
                        .extends
                        .as_ref()
                        .map_or(true, |target| state.is_derived(&tx.object_class, target))
            }
            _ => false,
        }
    }

    /// Cast a raw document to `class`.
    ///
    /// Succeeds when the document's class derives from `class`, or when
    /// `class` is a mixin applicable to it; mixin fields are then overlaid on
    /// the attributes. Anything else is a [`ReplicaError::Cast`].
    pub fn cast(&self, doc: &Doc, class: &ClassRef) -> Result<Doc> {
        let state = self.state.read();
        if state.is_derived(&doc.class, class) {
            return Ok(doc.clone());
        }

        let cast_error = || ReplicaError::Cast {
            doc: doc.id.clone(),
            expected: class.clone(),
            actual: doc.class.clone(),
        };

        let info = state.classes.get(class).ok_or_else(cast_error)?;
        if info.kind != ClassKind::Mixin {
            return Err(cast_error());
        }
        if let Some(target) = &info.extends {
            if !state.is_derived(&doc.class, target) {
                return Err(cast_error());
            }
        }

        let mut cast = doc.clone();
        if let Some(fields) = doc.mixins.get(class) {
            for (name, value) in fields {
                cast.attributes.insert(name.clone(), value.clone());
            }
        }
        Ok(cast)
    }
}

impl Default for ModelDb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStorage for ModelDb {
    /// Apply a transaction to the model domain.
    ///
    /// The new model is built aside and only installed if no known class
    /// would change domain.
    fn apply(&self, tx: &Tx) -> Result<()> {
        let mut state = self.state.write();

        let mut docs = state.docs.clone();
        apply_tx(&mut docs, tx)?;
        let next = ModelState::with_docs(docs);

        for class in state.classes.keys() {
            let before = state.domain(class);
            let after = next.domain(class);
            if before != after {
                return Err(ReplicaError::DomainChange {
                    class: class.clone(),
                    from: before,
                    to: after,
                });
            }
        }

        *state = next;
        Ok(())
    }

    fn get(&self, id: &Ref) -> Option<Doc> {
        self.state.read().docs.get(id).cloned()
    }

    fn scan(&self, visit: &mut dyn FnMut(&Doc)) {
        for doc in self.state.read().docs.values() {
            visit(doc);
        }
    }

    fn len(&self) -> usize {
        self.state.read().docs.len()
    }
}
