pub use axon_core::*;
pub use axon_exec::*;
pub use axon_graph::*;
pub use axon_rpc::*;
