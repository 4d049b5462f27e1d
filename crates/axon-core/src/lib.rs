mod annotation;
mod buffer;
pub mod types;
mod unit;
pub mod watchdog;

pub use annotation::{Annotation, AnnotationList, DuplicateAnnotation};
pub use buffer::{
    Buffer, BufferPool, BufferRef, OwnedBuffer, PublishAccounting, RefCounter, REF_BANKS,
};
pub use types::{
    MethodInfo, ParseValueError, PortInterface, PortValue, SimpleValue, TypeInfo, TypeKind,
    TypeRegistration, TypeRegistry, TypeUid, WireError, WirePayload, CHEAP_COPY_UID_LIMIT,
};
pub use unit::Unit;

/// Lower bound on pool size per producer-consumer relation.
///
/// With four reference-counter banks, a publish may still hold locks
/// in flight on the bank a buffer was recycled away from. Keeping at
/// least this many buffers per relation guarantees the live bank and
/// any in-flight bank never coincide. This is a configuration
/// responsibility; it is not enforced at runtime.
pub const MIN_POOL_BUFFERS: usize = 5;
