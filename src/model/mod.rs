//! Document model: the schema registry mirrored from the model domain.
//!
//! Class descriptors are ordinary documents of class [`CLASS_CLASS`] or
//! [`CLASS_MIXIN`]. The registry resolves each class to exactly one storage
//! domain and casts raw documents to a requested class or mixin.

mod classes;
mod db;

pub use classes::{
    ClassInfo, ClassKind, CLASS_CLASS, CLASS_DOC, CLASS_MIXIN, CLASS_REFERENCE, CLASS_SPACE,
    CLASS_TITLE, CLASS_TX, GENERIC_DOMAIN, MODEL_DOMAIN, TITLE_DOMAIN,
};
pub use db::ModelDb;
