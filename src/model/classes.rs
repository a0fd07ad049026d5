//! Class descriptors and well-known classes and domains.

use serde_json::Value;

use crate::types::{ClassRef, Doc};

/// Domain holding class descriptors and other schema documents.
pub const MODEL_DOMAIN: &str = "model";

/// Domain of title documents.
pub const TITLE_DOMAIN: &str = "title";

/// Default partition for classes with no domain of their own.
pub const GENERIC_DOMAIN: &str = "generic";

pub const CLASS_DOC: &str = "class:core.Doc";
pub const CLASS_CLASS: &str = "class:core.Class";
pub const CLASS_MIXIN: &str = "class:core.Mixin";
pub const CLASS_TX: &str = "class:core.Tx";
pub const CLASS_TITLE: &str = "class:core.Title";
pub const CLASS_REFERENCE: &str = "class:core.Reference";
pub const CLASS_SPACE: &str = "class:core.Space";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    /// Extension applied to documents of the class it extends.
    Mixin,
}

/// A class as seen by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassRef,
    pub kind: ClassKind,
    pub extends: Option<ClassRef>,
    /// Domain declared on the class itself (not inherited).
    pub domain: Option<String>,
}

impl ClassInfo {
    /// Read a descriptor from a model document. `None` if the document is
    /// not a class descriptor.
    pub fn from_doc(doc: &Doc) -> Option<Self> {
        let kind = match doc.class.as_str() {
            CLASS_CLASS => ClassKind::Class,
            CLASS_MIXIN => ClassKind::Mixin,
            _ => return None,
        };

        let extends = doc
            .attributes
            .get("extends")
            .and_then(Value::as_str)
            .map(ClassRef::from);
        let domain = doc
            .attributes
            .get("domain")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            id: ClassRef(doc.id.0.clone()),
            kind,
            extends,
            domain,
        })
    }

    /// Descriptor document for a class, as stored in the model domain.
    pub fn to_doc(&self) -> Doc {
        let class = match self.kind {
            ClassKind::Class => CLASS_CLASS,
            ClassKind::Mixin => CLASS_MIXIN,
        };
        let mut doc = Doc::new(self.id.0.as_str(), class);
        if let Some(extends) = &self.extends {
            doc = doc.with_attr("extends", extends.0.as_str());
        }
        if let Some(domain) = &self.domain {
            doc = doc.with_attr("domain", domain.as_str());
        }
        doc
    }

    pub fn class(id: impl Into<ClassRef>) -> Self {
        Self {
            id: id.into(),
            kind: ClassKind::Class,
            extends: None,
            domain: None,
        }
    }

    pub fn mixin(id: impl Into<ClassRef>, extends: impl Into<ClassRef>) -> Self {
        Self {
            id: id.into(),
            kind: ClassKind::Mixin,
            extends: Some(extends.into()),
            domain: None,
        }
    }

    pub fn extending(mut self, parent: impl Into<ClassRef>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Descriptors of the core classes every model contains.
pub(crate) fn core_classes() -> Vec<ClassInfo> {
    vec![
        ClassInfo::class(CLASS_DOC),
        ClassInfo::class(CLASS_CLASS)
            .extending(CLASS_DOC)
            .in_domain(MODEL_DOMAIN),
        ClassInfo::class(CLASS_MIXIN)
            .extending(CLASS_CLASS)
            .in_domain(MODEL_DOMAIN),
        ClassInfo::class(CLASS_TX).extending(CLASS_DOC),
        ClassInfo::class(CLASS_TITLE)
            .extending(CLASS_DOC)
            .in_domain(TITLE_DOMAIN),
        ClassInfo::class(CLASS_REFERENCE).extending(CLASS_DOC),
        ClassInfo::class(CLASS_SPACE).extending(CLASS_DOC),
    ]
}
