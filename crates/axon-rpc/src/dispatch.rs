//! Method-call dispatch over interface ports.
//!
//! An interface port is a port whose data type is a method type. Four
//! dispatch modes exist: local in the caller's thread, local on an
//! RPC worker, remote synchronous (the caller parks on its syncher),
//! and remote asynchronous (a worker performs the blocking call).
//! Calls received from the network whose target is itself a network
//! port are forwarded by a worker and the return travels back through
//! the original source port.

use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use axon_core::watchdog::WatchdogTask;
use axon_core::{Annotation, MethodInfo, TypeInfo};
use axon_graph::{Element, Port, PortCreationInfo, PortFlags, Runtime, StructureError};

use crate::call::{CallError, CallStatus, MethodCall};
use crate::syncher::{handle_method_return, perform_synch_call};

/// Server-side implementation of an interface's methods.
///
/// The handler reads the call's parameters and replaces them with the
/// return values; the dispatcher manages the status transitions.
pub trait MethodHandler: Send + Sync {
    fn handle_call(&self, call: &mut MethodCall) -> Result<(), CallError>;
}

/// Receives the result of an asynchronous call.
pub trait AsyncReturnHandler: Send + Sync {
    /// The returned call; the handler owns it and recycles it.
    fn handle_return(&self, call: Box<MethodCall>);
    /// The exception branch of a failed asynchronous call.
    fn handle_exception(&self, error: CallError);
}

/// Network-port contract, supplied by the external peer.
pub trait NetPort: Send + Sync {
    /// Ship a call toward the remote peer. Must not deliver the
    /// matching return synchronously on the calling thread.
    fn send_call(&self, call: Box<MethodCall>);
}

/// The role of an interface port.
#[derive(Clone)]
pub enum RpcPortKind {
    /// Answers calls with the given handler.
    Server(Arc<dyn MethodHandler>),
    /// Issues calls.
    Client,
    /// Bridges to a remote peer.
    Network(Arc<dyn NetPort>),
    /// Passes calls through towards a server.
    Routing,
}

/// Annotation tying an element to its RPC role.
pub struct RpcPortInfo {
    pub kind: RpcPortKind,
}

impl std::fmt::Debug for RpcPortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            RpcPortKind::Server(_) => "Server",
            RpcPortKind::Client => "Client",
            RpcPortKind::Network(_) => "Network",
            RpcPortKind::Routing => "Routing",
        };
        write!(f, "RpcPortInfo({kind})")
    }
}

impl Annotation for RpcPortInfo {}

/// A port carrying method calls instead of data.
#[derive(Clone)]
pub struct InterfacePort {
    port: Port,
    interface_type: Arc<TypeInfo>,
}

impl InterfacePort {
    pub fn new(
        runtime: &Arc<Runtime>,
        parent: &Arc<Element>,
        name: &str,
        interface_type: Arc<TypeInfo>,
        kind: RpcPortKind,
    ) -> Result<InterfacePort, StructureError> {
        assert!(
            interface_type.is_method_type(),
            "interface ports need a method type"
        );
        let port = Port::new(
            PortCreationInfo::new(runtime, parent, name, interface_type.clone())
                .with_flags(PortFlags::empty()),
        )?;
        port.element()
            .add_annotation(Arc::new(RpcPortInfo { kind }))
            .expect("fresh element already annotated");
        Ok(InterfacePort { port, interface_type })
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn element(&self) -> &Arc<Element> {
        self.port.element()
    }

    pub fn interface_type(&self) -> &Arc<TypeInfo> {
        &self.interface_type
    }

    pub fn connect_to(&self, target: &InterfacePort) -> Result<(), axon_graph::ConnectError> {
        self.port.connect_to(&target.port)
    }

    fn method(&self, index: u8) -> Option<MethodInfo> {
        self.interface_type
            .interface()
            .and_then(|i| i.method(index))
            .cloned()
    }

    fn kind_of(element: &Arc<Element>) -> Option<RpcPortKind> {
        element
            .get_annotation::<RpcPortInfo>()
            .map(|info| info.kind.clone())
    }

    /// Walk edges from a client or routing port to the handling
    /// endpoint (server or network port).
    fn resolve_server(&self) -> Option<(Arc<Element>, RpcPortKind)> {
        let mut current = self.port.element().clone();
        for _ in 0..16 {
            match Self::kind_of(&current) {
                Some(kind @ (RpcPortKind::Server(_) | RpcPortKind::Network(_))) => {
                    return Some((current, kind));
                }
                Some(RpcPortKind::Client | RpcPortKind::Routing) => {
                    let port = Port::from_element(&current)?;
                    current = port.connections().into_iter().next()?;
                }
                None => return None,
            }
        }
        None
    }

    fn effective_timeout(&self, call: &MethodCall, method: &MethodInfo) -> Duration {
        if call.net_timeout > Duration::ZERO {
            call.net_timeout
        } else {
            method.default_net_timeout
        }
    }

    /// Synchronous call: blocks until the return arrives or the
    /// timeout elapses. A failed call surfaces its exception here.
    pub fn call_sync(&self, mut call: Box<MethodCall>) -> Result<Box<MethodCall>, CallError> {
        let Some(method) = self.method(call.method_index) else {
            MethodCall::recycle(call);
            return Err(CallError::UnknownMethod);
        };
        call.interface_type = Some(self.interface_type.uid());
        let timeout = self.effective_timeout(&call, &method);

        let Some((_, kind)) = self.resolve_server() else {
            MethodCall::recycle(call);
            return Err(CallError::NoConnection);
        };

        match kind {
            RpcPortKind::Server(handler) if !method.handle_in_extra_thread => {
                call.status = CallStatus::SynchCall;
                execute_handler(&handler, &mut call);
                finish_sync_local(call)
            }
            RpcPortKind::Server(handler) => perform_synch_call(call, timeout, move |call| {
                RpcThreadPool::global().execute(Box::new(move || {
                    let mut call = call;
                    execute_handler(&handler, &mut call);
                    handle_method_return(call);
                }));
            }),
            RpcPortKind::Network(net) => {
                call.net_timeout = timeout;
                perform_synch_call(call, timeout, move |call| net.send_call(call))
            }
            RpcPortKind::Client | RpcPortKind::Routing => {
                MethodCall::recycle(call);
                Err(CallError::NoConnection)
            }
        }
    }

    /// Asynchronous call: returns immediately; the result reaches the
    /// return handler (or is recycled for void methods).
    pub fn call_async(
        &self,
        mut call: Box<MethodCall>,
        return_handler: Option<Arc<dyn AsyncReturnHandler>>,
    ) -> Result<(), CallError> {
        let Some(method) = self.method(call.method_index) else {
            MethodCall::recycle(call);
            return Err(CallError::UnknownMethod);
        };
        call.interface_type = Some(self.interface_type.uid());
        let timeout = self.effective_timeout(&call, &method);

        let Some((_, kind)) = self.resolve_server() else {
            MethodCall::recycle(call);
            return Err(CallError::NoConnection);
        };

        match kind {
            RpcPortKind::Server(handler) if !method.handle_in_extra_thread => {
                call.status = CallStatus::AsynchCall;
                execute_handler(&handler, &mut call);
                deliver_async_result(call, return_handler);
                Ok(())
            }
            RpcPortKind::Server(handler) => {
                call.status = CallStatus::AsynchCall;
                RpcThreadPool::global().execute(Box::new(move || {
                    let mut call = call;
                    execute_handler(&handler, &mut call);
                    deliver_async_result(call, return_handler);
                }));
                Ok(())
            }
            RpcPortKind::Network(net) => {
                // The worker performs the blocking network call.
                RpcThreadPool::global().execute(Box::new(move || {
                    match perform_synch_call(call, timeout, |call| net.send_call(call)) {
                        Ok(ret) => deliver_async_result(ret, return_handler),
                        Err(error) => {
                            if let Some(handler) = return_handler {
                                handler.handle_exception(error);
                            }
                        }
                    }
                }));
                Ok(())
            }
            RpcPortKind::Client | RpcPortKind::Routing => {
                MethodCall::recycle(call);
                Err(CallError::NoConnection)
            }
        }
    }

    /// Entry point for the external peer: a call arrived from the
    /// network for this port. The return (or exception) travels back
    /// through `source`.
    pub fn handle_call_from_network(&self, mut call: Box<MethodCall>, source: Arc<dyn NetPort>) {
        let Some(method) = self.method(call.method_index) else {
            call.set_exception(CallError::UnknownMethod);
            source.send_call(call);
            return;
        };
        let timeout = self.effective_timeout(&call, &method);

        let Some((_, kind)) = self.resolve_server() else {
            call.set_exception(CallError::NoConnection);
            source.send_call(call);
            return;
        };

        match kind {
            RpcPortKind::Server(handler) if !method.handle_in_extra_thread => {
                execute_and_return(handler, call, source, method.has_return);
            }
            RpcPortKind::Server(handler) => {
                RpcThreadPool::global().execute(Box::new(move || {
                    execute_and_return(handler, call, source, method.has_return);
                }));
            }
            RpcPortKind::Network(dest) => {
                // Forward: a worker performs the blocking call on the
                // destination and routes the return to the source.
                RpcThreadPool::global().execute(Box::new(move || {
                    forward_call(call, dest, source, timeout);
                }));
            }
            RpcPortKind::Client | RpcPortKind::Routing => {
                call.set_exception(CallError::NoConnection);
                source.send_call(call);
            }
        }
    }
}

fn execute_handler(handler: &Arc<dyn MethodHandler>, call: &mut MethodCall) {
    match handler.handle_call(call) {
        Ok(()) => call.set_status_return(),
        Err(error) => call.set_exception(error),
    }
}

fn finish_sync_local(call: Box<MethodCall>) -> Result<Box<MethodCall>, CallError> {
    if call.has_exception() {
        let error = call.exception.unwrap_or(CallError::ProgrammingError);
        MethodCall::recycle(call);
        Err(error)
    } else {
        Ok(call)
    }
}

fn deliver_async_result(call: Box<MethodCall>, return_handler: Option<Arc<dyn AsyncReturnHandler>>) {
    match return_handler {
        Some(handler) => {
            if call.has_exception() {
                let error = call.exception.unwrap_or(CallError::ProgrammingError);
                MethodCall::recycle(call);
                handler.handle_exception(error);
            } else {
                handler.handle_return(call);
            }
        }
        None => MethodCall::recycle(call),
    }
}

/// Run a handler for a call that came in over the network and send
/// the result back through the source port. Void asynchronous calls
/// produce no return frame.
fn execute_and_return(
    handler: Arc<dyn MethodHandler>,
    mut call: Box<MethodCall>,
    source: Arc<dyn NetPort>,
    has_return: bool,
) {
    let was_synch = call.status == CallStatus::SynchCall;
    execute_handler(&handler, &mut call);
    if was_synch || call.has_exception() || has_return {
        source.send_call(call);
    } else {
        MethodCall::recycle(call);
    }
}

/// Forward a network call to another network port, preserving the
/// original caller's return-matching fields.
fn forward_call(
    call: Box<MethodCall>,
    dest: Arc<dyn NetPort>,
    source: Arc<dyn NetPort>,
    timeout: Duration,
) {
    let method_index = call.method_index;
    let interface_type = call.interface_type;
    let syncher_id = call.syncher_id;
    let thread_uid = call.thread_uid;
    let call_index = call.call_index;

    let restore = |mut ret: Box<MethodCall>| -> Box<MethodCall> {
        ret.syncher_id = syncher_id;
        ret.thread_uid = thread_uid;
        ret.call_index = call_index;
        ret
    };

    match perform_synch_call(call, timeout, |call| dest.send_call(call)) {
        Ok(ret) => source.send_call(restore(ret)),
        Err(error) => {
            let mut exception = MethodCall::obtain();
            exception.method_index = method_index;
            exception.interface_type = interface_type;
            exception.set_exception(error);
            source.send_call(restore(exception));
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Deadline for one RPC worker job; only enforced in debug builds.
const WORKER_JOB_DEADLINE: Duration = Duration::from_secs(30);

/// Shared pool of RPC worker threads. Grows on demand; idle workers
/// return to the pool after each job.
pub struct RpcThreadPool {
    idle: Mutex<Vec<mpsc::Sender<Job>>>,
}

impl RpcThreadPool {
    pub fn global() -> &'static RpcThreadPool {
        static POOL: OnceLock<RpcThreadPool> = OnceLock::new();
        POOL.get_or_init(|| RpcThreadPool {
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Run a job on an unused worker thread, spawning one if none is
    /// idle.
    pub fn execute(&'static self, job: Job) {
        let mut job = job;
        loop {
            let worker = self.idle.lock().pop();
            match worker {
                Some(tx) => match tx.send(job) {
                    Ok(()) => return,
                    // Worker died; try the next one.
                    Err(mpsc::SendError(returned)) => job = returned,
                },
                None => {
                    let tx = self.spawn_worker();
                    tx.send(job).expect("fresh worker hung up");
                    return;
                }
            }
        }
    }

    fn spawn_worker(&'static self) -> mpsc::Sender<Job> {
        let (tx, rx) = mpsc::channel::<Job>();
        let own_tx = tx.clone();
        std::thread::Builder::new()
            .name("axon-rpc-worker".into())
            .spawn(move || {
                let watchdog = WatchdogTask::register(cfg!(debug_assertions));
                while let Ok(job) = rx.recv() {
                    watchdog.set_current("rpc worker job");
                    watchdog.arm(Instant::now() + WORKER_JOB_DEADLINE);
                    job();
                    watchdog.disarm();
                    self.idle.lock().push(own_tx.clone());
                }
            })
            .expect("failed to spawn rpc worker");
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Number, Param};
    use axon_core::{PortInterface, TypeRegistry};
    use axon_graph::{ElementFlags, ElementKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_interface() -> Arc<TypeInfo> {
        let mut interface = PortInterface::new();
        interface.add_method(MethodInfo {
            name: "double".into(),
            index: 0,
            arity: 1,
            has_return: true,
            handle_in_extra_thread: false,
            default_net_timeout: Duration::from_millis(100),
        });
        interface.add_method(MethodInfo {
            name: "double_deferred".into(),
            index: 1,
            arity: 1,
            has_return: true,
            handle_in_extra_thread: true,
            default_net_timeout: Duration::from_millis(500),
        });
        TypeRegistry::global().register_method_type("TestInterface", interface)
    }

    struct Doubler;
    impl MethodHandler for Doubler {
        fn handle_call(&self, call: &mut MethodCall) -> Result<(), CallError> {
            let Some(Param::Number {
                value: Number::I64(v),
                ..
            }) = call.params.first()
            else {
                return Err(CallError::InvalidParam);
            };
            let doubled = *v * 2;
            call.params.clear();
            call.push_param(Param::number(Number::I64(doubled)));
            Ok(())
        }
    }

    fn setup(kind: RpcPortKind) -> (Arc<Runtime>, InterfacePort, InterfacePort) {
        let rt = Runtime::new();
        let module = Element::new(
            &rt,
            rt.root(),
            "module",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        let interface_type = test_interface();
        let server =
            InterfacePort::new(&rt, &module, "server", interface_type.clone(), kind).unwrap();
        let client = InterfacePort::new(
            &rt,
            &module,
            "client",
            interface_type,
            RpcPortKind::Client,
        )
        .unwrap();
        client.connect_to(&server).unwrap();
        module.init().unwrap();
        (rt, client, server)
    }

    #[test]
    fn local_sync_call_runs_in_the_callers_thread() {
        let (_rt, client, _server) = setup(RpcPortKind::Server(Arc::new(Doubler)));

        let mut call = MethodCall::obtain();
        call.method_index = 0;
        call.push_param(Param::number(Number::I64(21)));

        let ret = client.call_sync(call).unwrap();
        assert_eq!(ret.status, CallStatus::SynchReturn);
        assert_eq!(ret.params[0], Param::number(Number::I64(42)));
        MethodCall::recycle(ret);
    }

    #[test]
    fn extra_thread_sync_call_parks_and_returns() {
        let (_rt, client, _server) = setup(RpcPortKind::Server(Arc::new(Doubler)));

        let mut call = MethodCall::obtain();
        call.method_index = 1;
        call.push_param(Param::number(Number::I64(4)));

        let ret = client.call_sync(call).unwrap();
        assert_eq!(ret.status, CallStatus::SynchReturn);
        assert_eq!(ret.params[0], Param::number(Number::I64(8)));
        MethodCall::recycle(ret);
    }

    #[test]
    fn invalid_parameters_surface_as_exception() {
        let (_rt, client, _server) = setup(RpcPortKind::Server(Arc::new(Doubler)));

        let mut call = MethodCall::obtain();
        call.method_index = 0;
        call.push_param(Param::Null);
        assert!(matches!(
            client.call_sync(call),
            Err(CallError::InvalidParam)
        ));
    }

    #[test]
    fn unknown_method_and_missing_connection_fail_fast() {
        let (rt, client, _server) = setup(RpcPortKind::Server(Arc::new(Doubler)));

        let mut call = MethodCall::obtain();
        call.method_index = 9;
        assert!(matches!(
            client.call_sync(call),
            Err(CallError::UnknownMethod)
        ));

        let module = Element::new(
            &rt,
            rt.root(),
            "other",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        let lonely = InterfacePort::new(
            &rt,
            &module,
            "lonely",
            test_interface(),
            RpcPortKind::Client,
        )
        .unwrap();
        module.init().unwrap();
        let mut call = MethodCall::obtain();
        call.method_index = 0;
        assert!(matches!(
            lonely.call_sync(call),
            Err(CallError::NoConnection)
        ));
    }

    /// A network peer that never answers.
    struct SilentPeer;
    impl NetPort for SilentPeer {
        fn send_call(&self, call: Box<MethodCall>) {
            MethodCall::recycle(call);
        }
    }

    #[test]
    fn remote_sync_call_times_out_within_bounds() {
        let (_rt, client, _server) = setup(RpcPortKind::Network(Arc::new(SilentPeer)));

        let mut call = MethodCall::obtain();
        call.method_index = 0;
        call.push_param(Param::number(Number::I64(1)));

        let start = Instant::now();
        let result = client.call_sync(call);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(CallError::Timeout)));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    /// A network peer answering after a delay from its own thread.
    struct EchoPeer {
        delay: Duration,
    }
    impl NetPort for EchoPeer {
        fn send_call(&self, call: Box<MethodCall>) {
            let delay = self.delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                let mut ret = call;
                ret.set_status_return();
                handle_method_return(ret);
            });
        }
    }

    #[test]
    fn remote_sync_call_returns_the_peers_answer() {
        let (_rt, client, _server) = setup(RpcPortKind::Network(Arc::new(EchoPeer {
            delay: Duration::from_millis(10),
        })));

        let mut call = MethodCall::obtain();
        call.method_index = 0;
        call.push_param(Param::number(Number::I64(5)));
        let ret = client.call_sync(call).unwrap();
        assert_eq!(ret.status, CallStatus::SynchReturn);
        MethodCall::recycle(ret);
    }

    struct CountingReturns {
        returns: AtomicUsize,
        exceptions: AtomicUsize,
    }
    impl AsyncReturnHandler for CountingReturns {
        fn handle_return(&self, call: Box<MethodCall>) {
            self.returns.fetch_add(1, Ordering::SeqCst);
            MethodCall::recycle(call);
        }
        fn handle_exception(&self, _error: CallError) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn async_call_reports_through_the_return_handler() {
        let (_rt, client, _server) = setup(RpcPortKind::Server(Arc::new(Doubler)));
        let probe = Arc::new(CountingReturns {
            returns: AtomicUsize::new(0),
            exceptions: AtomicUsize::new(0),
        });

        let mut call = MethodCall::obtain();
        call.method_index = 1;
        call.push_param(Param::number(Number::I64(3)));
        client.call_async(call, Some(probe.clone())).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.returns.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(probe.returns.load(Ordering::SeqCst), 1);
        assert_eq!(probe.exceptions.load(Ordering::SeqCst), 0);
    }

    /// Captures what a server port sends back towards the peer.
    struct CapturingSource {
        captured: Mutex<Vec<Box<MethodCall>>>,
    }
    impl NetPort for CapturingSource {
        fn send_call(&self, call: Box<MethodCall>) {
            self.captured.lock().push(call);
        }
    }

    #[test]
    fn network_calls_are_answered_through_the_source_port() {
        let (_rt, _client, server) = setup(RpcPortKind::Server(Arc::new(Doubler)));
        let source = Arc::new(CapturingSource {
            captured: Mutex::new(Vec::new()),
        });

        let mut call = MethodCall::obtain();
        call.method_index = 0;
        call.status = CallStatus::SynchCall;
        call.syncher_id = 7;
        call.call_index = 3;
        call.push_param(Param::number(Number::I64(10)));

        server.handle_call_from_network(call, source.clone());

        let captured = source.captured.lock();
        assert_eq!(captured.len(), 1);
        let ret = &captured[0];
        assert_eq!(ret.status, CallStatus::SynchReturn);
        assert_eq!(ret.syncher_id, 7);
        assert_eq!(ret.call_index, 3);
        assert_eq!(ret.params[0], Param::number(Number::I64(20)));
    }
}
