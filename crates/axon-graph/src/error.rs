use thiserror::Error;

/// A structural operation on the framework-element tree failed.
///
/// These are fatal at the offending call site; callers do not recover
/// from them beyond reporting.
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("element already has a primary parent")]
    AlreadyHasParent,
    #[error("parent element is deleted")]
    ParentDeleted,
    #[error("element is deleted")]
    Deleted,
    #[error("globally unique link '{0}' already exists")]
    DuplicateUniqueLink(String),
    #[error("the runtime has been dropped")]
    RuntimeGone,
    #[error("data type '{0}' has no buffer factory")]
    NoFactory(String),
}

/// Connecting two ports failed. The graph is unmodified.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot connect a port to itself")]
    SelfConnection,
    #[error("port data types differ: '{src_ty}' vs '{target}'")]
    TypeMismatch { src_ty: String, target: String },
    #[error("ports are already connected")]
    AlreadyConnected,
    #[error("one of the ports is deleted")]
    Deleted,
    #[error("element is not a port")]
    NotAPort,
}

/// Reading or applying a configuration document failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
