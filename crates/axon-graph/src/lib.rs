mod edges;
mod element;
mod error;
pub mod param;
mod port;
mod runtime;
mod tlc;

pub use edges::{AggregatedEdge, AggregatorCell};
pub use element::{Element, ElementFlags, ElementHandle, ElementKind, InitHooks, Link};
pub use error::{ConfigError, ConnectError, StructureError};
pub use param::{ConfigFile, ConfigNode, ParameterInfo};
pub use port::{
    DataPort, Port, PortCell, PortCreationInfo, PortFlags, PortListener, PullHandler,
};
pub use runtime::{Runtime, RuntimeListener, StructureChange};
pub use tlc::ThreadLocalCache;
