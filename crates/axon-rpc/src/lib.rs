mod call;
mod dispatch;
mod syncher;
mod wire;

pub use call::{CallError, CallStatus, MethodCall, Number, Param, MAX_PARAMS};
pub use dispatch::{
    AsyncReturnHandler, InterfacePort, MethodHandler, NetPort, RpcPortInfo, RpcPortKind,
    RpcThreadPool,
};
pub use syncher::{
    handle_method_return, perform_synch_call, syncher, MethodCallSyncher, MAX_SYNCHERS,
};
pub use wire::{deserialize_call, serialize_call, RemoteTypes};
