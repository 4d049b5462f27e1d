//! Typed annotations attachable to runtime entities.

use std::any::TypeId;
use std::fmt::Debug;
use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};
use parking_lot::RwLock;
use smallvec::SmallVec;

/// Marker trait for annotations. Retrieved by concrete type.
pub trait Annotation: DowncastSync + Debug {}

impl_downcast!(sync Annotation);

/// Adding two annotations of the same concrete type is forbidden.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("an annotation of this type is already attached")]
pub struct DuplicateAnnotation;

/// List of annotations keyed by concrete type.
#[derive(Debug, Default)]
pub struct AnnotationList {
    inner: RwLock<SmallVec<[Arc<dyn Annotation>; 2]>>,
}

impl AnnotationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, annotation: Arc<dyn Annotation>) -> Result<(), DuplicateAnnotation> {
        let mut inner = self.inner.write();
        let type_id = annotation.as_any().type_id();
        if inner.iter().any(|a| a.as_any().type_id() == type_id) {
            return Err(DuplicateAnnotation);
        }
        inner.push(annotation);
        Ok(())
    }

    pub fn get<T: Annotation>(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .iter()
            .find(|a| a.as_any().type_id() == TypeId::of::<T>())
            .cloned()
            .map(|a| {
                a.downcast_arc::<T>()
                    .unwrap_or_else(|_| unreachable!("type id matched"))
            })
    }

    pub fn has<T: Annotation>(&self) -> bool {
        self.inner
            .read()
            .iter()
            .any(|a| a.as_any().type_id() == TypeId::of::<T>())
    }
}
