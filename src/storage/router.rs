//! Class → queriable storage routing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::ModelDb;
use crate::query::QueriableStorage;
use crate::types::ClassRef;

/// Resolves the queriable storage responsible for a class's domain.
///
/// Domains without a dedicated storage fall back to the generic one.
pub struct DomainRouter {
    model: Arc<ModelDb>,
    domains: HashMap<String, Arc<QueriableStorage>>,
    fallback: Arc<QueriableStorage>,
}

impl DomainRouter {
    pub fn new(model: Arc<ModelDb>, fallback: Arc<QueriableStorage>) -> Self {
        Self {
            model,
            domains: HashMap::new(),
            fallback,
        }
    }

    /// Give `domain` its own storage.
    pub fn with_domain(mut self, domain: impl Into<String>, storage: Arc<QueriableStorage>) -> Self {
        self.domains.insert(domain.into(), storage);
        self
    }

    pub fn route(&self, class: &ClassRef) -> &Arc<QueriableStorage> {
        let domain = self.model.get_domain(class);
        self.domains.get(&domain).unwrap_or(&self.fallback)
    }

    pub fn for_domain(&self, domain: &str) -> &Arc<QueriableStorage> {
        self.domains.get(domain).unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &Arc<QueriableStorage> {
        &self.fallback
    }

    /// Every distinct storage, dedicated ones first.
    pub fn storages(&self) -> Vec<&Arc<QueriableStorage>> {
        let mut all: Vec<&Arc<QueriableStorage>> = self.domains.values().collect();
        if !all.iter().any(|s| Arc::ptr_eq(s, &self.fallback)) {
            all.push(&self.fallback);
        }
        all
    }
}
