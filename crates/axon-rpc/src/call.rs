//! Method-call objects.
//!
//! A call carries the target method, up to four discriminated
//! parameter cells, its status, and the return-matching bookkeeping
//! (syncher id, caller thread UID, call index). Call objects are
//! pooled per thread; a finished call is recycled back into the pool.

use std::cell::RefCell;
use std::time::Duration;

use arrayvec::ArrayVec;
use axon_core::{PortValue, TypeUid, Unit, WireError};
use axon_graph::ElementHandle;

/// Maximum number of parameter cells per call.
pub const MAX_PARAMS: usize = 4;

/// Status of a method call.
///
/// `None -> {SynchCall, AsynchCall} -> {SynchReturn, AsynchReturn,
/// Exception} -> None (recycled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    None,
    SynchCall,
    AsynchCall,
    SynchReturn,
    AsynchReturn,
    Exception,
}

impl CallStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            CallStatus::None => 0,
            CallStatus::SynchCall => 1,
            CallStatus::AsynchCall => 2,
            CallStatus::SynchReturn => 3,
            CallStatus::AsynchReturn => 4,
            CallStatus::Exception => 5,
        }
    }

    pub fn from_wire(byte: u8) -> Result<CallStatus, WireError> {
        Ok(match byte {
            0 => CallStatus::None,
            1 => CallStatus::SynchCall,
            2 => CallStatus::AsynchCall,
            3 => CallStatus::SynchReturn,
            4 => CallStatus::AsynchReturn,
            5 => CallStatus::Exception,
            other => return Err(WireError::InvalidTag(other)),
        })
    }
}

/// Exception kinds carried in-band on a call object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("the call timed out")]
    Timeout,
    #[error("no connection to a server port")]
    NoConnection,
    #[error("unknown method")]
    UnknownMethod,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("programming error in call handling")]
    ProgrammingError,
}

impl CallError {
    pub fn to_wire(self) -> u8 {
        match self {
            CallError::Timeout => 1,
            CallError::NoConnection => 2,
            CallError::UnknownMethod => 3,
            CallError::InvalidParam => 4,
            CallError::ProgrammingError => 5,
        }
    }

    pub fn from_wire(byte: u8) -> Result<Option<CallError>, WireError> {
        Ok(Some(match byte {
            0 => return Ok(None),
            1 => CallError::Timeout,
            2 => CallError::NoConnection,
            3 => CallError::UnknownMethod,
            4 => CallError::InvalidParam,
            5 => CallError::ProgrammingError,
            other => return Err(WireError::InvalidTag(other)),
        }))
    }
}

/// A self-describing number parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

/// One parameter cell of a method call.
#[derive(Debug)]
pub enum Param {
    Null,
    Number { value: Number, unit: Unit },
    Object { type_uid: TypeUid, value: Box<dyn PortValue> },
}

impl Param {
    pub fn number(value: Number) -> Param {
        Param::Number {
            value,
            unit: Unit::None,
        }
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Param) -> bool {
        match (self, other) {
            (Param::Null, Param::Null) => true,
            (
                Param::Number { value: a, unit: ua },
                Param::Number { value: b, unit: ub },
            ) => a == b && ua == ub,
            (
                Param::Object {
                    type_uid: ta,
                    value: va,
                },
                Param::Object {
                    type_uid: tb,
                    value: vb,
                },
            ) => ta == tb && va.eq_value(&**vb),
            _ => false,
        }
    }
}

/// A complete method call.
#[derive(Debug)]
pub struct MethodCall {
    pub method_index: u8,
    /// Interface (method type) the call targets.
    pub interface_type: Option<TypeUid>,
    pub status: CallStatus,
    pub exception: Option<CallError>,
    /// Syncher slot of the calling thread; -1 for asynchronous calls.
    pub syncher_id: i8,
    pub thread_uid: u32,
    /// Monotonically increasing per syncher; filters stale returns.
    pub call_index: u16,
    pub net_timeout: Duration,
    /// Only used while the call sits in a network queue.
    pub local_port: Option<ElementHandle>,
    pub remote_port: Option<ElementHandle>,
    pub params: ArrayVec<Param, MAX_PARAMS>,
}

impl Default for MethodCall {
    fn default() -> Self {
        Self {
            method_index: 0,
            interface_type: None,
            status: CallStatus::None,
            exception: None,
            syncher_id: -1,
            thread_uid: 0,
            call_index: 0,
            net_timeout: Duration::ZERO,
            local_port: None,
            remote_port: None,
            params: ArrayVec::new(),
        }
    }
}

thread_local! {
    static CALL_POOL: RefCell<Vec<Box<MethodCall>>> = const { RefCell::new(Vec::new()) };
}

#[cfg(test)]
pub(crate) static RECYCLED_CALLS: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

impl MethodCall {
    /// Fetch a blank call object from the calling thread's pool.
    pub fn obtain() -> Box<MethodCall> {
        CALL_POOL
            .with(|pool| pool.borrow_mut().pop())
            .unwrap_or_default()
    }

    /// Reset and return a finished call to the pool.
    pub fn recycle(mut call: Box<MethodCall>) {
        call.reset();
        #[cfg(test)]
        RECYCLED_CALLS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        CALL_POOL.with(|pool| pool.borrow_mut().push(call));
    }

    pub fn reset(&mut self) {
        self.method_index = 0;
        self.interface_type = None;
        self.status = CallStatus::None;
        self.exception = None;
        self.syncher_id = -1;
        self.thread_uid = 0;
        self.call_index = 0;
        self.net_timeout = Duration::ZERO;
        self.local_port = None;
        self.remote_port = None;
        self.params.clear();
    }

    pub fn set_method(&mut self, method_index: u8, interface_type: TypeUid) {
        self.method_index = method_index;
        self.interface_type = Some(interface_type);
    }

    pub fn push_param(&mut self, param: Param) {
        self.params.push(param);
    }

    /// Clear the parameters and mark the call failed.
    pub fn set_exception(&mut self, error: CallError) {
        self.params.clear();
        self.status = CallStatus::Exception;
        self.exception = Some(error);
    }

    /// Flip a call status into the matching return status.
    pub fn set_status_return(&mut self) {
        self.status = match self.status {
            CallStatus::SynchCall => CallStatus::SynchReturn,
            CallStatus::AsynchCall => CallStatus::AsynchReturn,
            other => {
                debug_assert!(false, "set_status_return on {other:?}");
                other
            }
        };
    }

    pub fn has_exception(&self) -> bool {
        self.status == CallStatus::Exception
    }

    pub fn is_returning(&self, include_exception: bool) -> bool {
        self.status == CallStatus::SynchReturn
            || self.status == CallStatus::AsynchReturn
            || (include_exception && self.status == CallStatus::Exception)
    }
}
