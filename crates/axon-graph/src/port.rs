//! Ports: typed endpoints supporting publish/subscribe and pull.
//!
//! The port variant (standard, cheap-copy, queued) is selected once at
//! creation and stored as plain data in the port cell; the publish
//! path contains no dynamic dispatch. The current value lives in a
//! swap slot that holds one bank lock on the contained buffer, so the
//! observed value sequence of a single port is monotonic and readers
//! never block.

use std::collections::VecDeque;
use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axon_core::{
    BufferPool, BufferRef, OwnedBuffer, PublishAccounting, SimpleValue, TypeInfo, Unit,
    WirePayload,
};
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::edges;
use crate::element::{Element, ElementFlags, ElementHandle, ElementKind};
use crate::error::{ConnectError, StructureError};
use crate::runtime::{Runtime, StructureChange};
use crate::tlc::ThreadLocalCache;

bitflags! {
    /// Strategy flags of a port, fixed at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        /// Port emits data (outgoing edges start here).
        const OUTPUT        = 1 << 0;
        /// Port accepts pushed data.
        const PUSH_STRATEGY = 1 << 1;
        /// Reads go through the pull chain first.
        const PULL_STRATEGY = 1 << 2;
        /// Incoming values are additionally kept in a bounded FIFO.
        const HAS_QUEUE     = 1 << 3;
    }
}

/// Observer of value changes on one port. Fired after the new value
/// is committed to the port.
pub trait PortListener: Send + Sync {
    fn port_changed(&self, port: &Arc<Element>, value: &BufferRef);
}

/// Lazily produces a port's value on demand.
pub trait PullHandler: Send + Sync {
    /// Produce the current value, or `None` to let the pull continue
    /// along reverse edges.
    fn pull(&self, port: &Port) -> Option<OwnedBuffer>;
}

/// Parameters for creating a port.
pub struct PortCreationInfo<'a> {
    pub runtime: &'a Arc<Runtime>,
    pub parent: &'a Arc<Element>,
    pub name: &'a str,
    pub data_type: Arc<TypeInfo>,
    pub flags: PortFlags,
    pub element_flags: ElementFlags,
    pub max_queue_len: usize,
    pub unit: Unit,
}

impl<'a> PortCreationInfo<'a> {
    pub fn new(
        runtime: &'a Arc<Runtime>,
        parent: &'a Arc<Element>,
        name: &'a str,
        data_type: Arc<TypeInfo>,
    ) -> Self {
        Self {
            runtime,
            parent,
            name,
            data_type,
            flags: PortFlags::PUSH_STRATEGY,
            element_flags: ElementFlags::empty(),
            max_queue_len: 0,
            unit: Unit::None,
        }
    }

    pub fn output(mut self) -> Self {
        self.flags |= PortFlags::OUTPUT;
        self
    }

    pub fn queued(mut self, max_len: usize) -> Self {
        self.flags |= PortFlags::HAS_QUEUE;
        self.max_queue_len = max_len;
        self
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }
}

/// Payload of a port element.
pub struct PortCell {
    data_type: Arc<TypeInfo>,
    unit: Unit,
    flags: PortFlags,
    max_queue_len: usize,
    /// Per-port pool for standard types; cheap-copy types draw from
    /// thread-local pools instead.
    pool: Option<Arc<BufferPool>>,
    /// Current value. The slot itself holds one bank lock on the
    /// contained buffer; `None` for method-type (interface) ports.
    value: Option<ArcSwap<BufferRef>>,
    queue: Option<Mutex<VecDeque<BufferRef>>>,
    pull_handler: RwLock<Option<Arc<dyn PullHandler>>>,
    listeners: RwLock<Vec<Arc<dyn PortListener>>>,
    pub(crate) outgoing: RwLock<SmallVec<[std::sync::Weak<Element>; 4]>>,
    pub(crate) incoming: RwLock<SmallVec<[std::sync::Weak<Element>; 4]>>,
}

impl std::fmt::Debug for PortCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortCell")
            .field("type", &self.data_type.name())
            .field("flags", &self.flags)
            .finish()
    }
}

impl PortCell {
    fn build(info: &PortCreationInfo) -> Result<PortCell, StructureError> {
        let data_type = info.data_type.clone();

        let (pool, value) = if data_type.is_method_type() {
            (None, None)
        } else {
            let (pool, sentinel) = if data_type.is_cheap_copy() {
                let owned = ThreadLocalCache::with(|tlc| tlc.get_unused(&data_type))
                    .ok_or_else(|| StructureError::NoFactory(data_type.name().to_string()))?;
                (None, owned)
            } else {
                let pool = BufferPool::new(data_type.clone(), false);
                let owned = pool
                    .get_unused()
                    .ok_or_else(|| StructureError::NoFactory(data_type.name().to_string()))?;
                (Some(pool), owned)
            };
            // The sentinel keeps reads well-defined before the first
            // publish.
            let mut acc = PublishAccounting::begin(sentinel, 1);
            let initial = acc.assign();
            acc.finish();
            (pool, Some(ArcSwap::from_pointee(initial)))
        };

        let queue = if info.flags.contains(PortFlags::HAS_QUEUE) {
            Some(Mutex::new(VecDeque::with_capacity(info.max_queue_len)))
        } else {
            None
        };

        Ok(PortCell {
            data_type,
            unit: info.unit,
            flags: info.flags,
            max_queue_len: info.max_queue_len,
            pool,
            value,
            queue,
            pull_handler: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            outgoing: RwLock::new(SmallVec::new()),
            incoming: RwLock::new(SmallVec::new()),
        })
    }

    pub fn data_type(&self) -> &Arc<TypeInfo> {
        &self.data_type
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }
}

/// Handle to a port element.
#[derive(Clone)]
pub struct Port {
    element: Arc<Element>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Port({})", self.element.qualified_name())
    }
}

impl Port {
    pub fn new(info: PortCreationInfo) -> Result<Port, StructureError> {
        let element_flags = ElementFlags::PORT | info.element_flags;
        let cell = PortCell::build(&info)?;
        let element = Element::new(
            info.runtime,
            info.parent,
            info.name,
            element_flags,
            ElementKind::Port(cell),
        )?;
        Ok(Port { element })
    }

    pub fn from_element(element: &Arc<Element>) -> Option<Port> {
        element.port_cell().map(|_| Port {
            element: element.clone(),
        })
    }

    pub fn element(&self) -> &Arc<Element> {
        &self.element
    }

    fn cell(&self) -> &PortCell {
        self.element.port_cell().expect("element is not a port")
    }

    pub fn data_type(&self) -> &Arc<TypeInfo> {
        &self.cell().data_type
    }

    pub fn flags(&self) -> PortFlags {
        self.cell().flags
    }

    pub fn pool(&self) -> Option<&Arc<BufferPool>> {
        self.cell().pool.as_ref()
    }

    /// Fetch an unused buffer to write the next value into.
    pub fn get_unused(&self) -> Option<OwnedBuffer> {
        let cell = self.cell();
        if cell.data_type.is_cheap_copy() {
            ThreadLocalCache::with(|tlc| tlc.get_unused(&cell.data_type))
        } else {
            cell.pool.as_ref()?.get_unused()
        }
    }

    /// Publish a written buffer: estimate the reachable accepting
    /// targets, lock once, assign along the push closure, release the
    /// shortfall, then fire listeners.
    pub fn publish(&self, owned: OwnedBuffer) {
        let cell = self.cell();
        let Some(slot) = cell.value.as_ref() else {
            log::warn!(
                "dropping publish on '{}': not a data port",
                self.element.qualified_name()
            );
            return;
        };

        let mut targets: SmallVec<[Arc<Element>; 8]> = SmallVec::new();
        collect_push_targets(&self.element, &mut targets);

        let estimate = targets.len() as i16 + 1;
        let mut acc = PublishAccounting::begin(owned, estimate);

        // Own slot first; the old value's slot lock drops with the
        // swapped-out Arc.
        let own = acc.assign();
        slot.store(Arc::new(own));

        for target in &targets {
            let Some(target_cell) = target.port_cell() else {
                continue;
            };
            if !target.is_ready() || target.is_deleted() {
                continue;
            }
            let reference = acc.assign();
            deliver(target, target_cell, reference);
        }
        acc.finish();

        let committed = slot.load_full();
        notify_listeners(&self.element, cell, &committed);

        let size = cell.data_type.memcpy_size();
        for target in cell.outgoing.read().iter().filter_map(|w| w.upgrade()) {
            edges::update_statistics(&self.element, &target, size);
        }
    }

    /// The current value. Always a ready buffer of the port's type.
    pub fn get(&self) -> Arc<BufferRef> {
        self.cell()
            .value
            .as_ref()
            .expect("not a data port")
            .load_full()
    }

    /// Read honoring the pull strategy: propagate a pull along reverse
    /// edges until a handler answers, then return the current value.
    pub fn read(&self) -> Arc<BufferRef> {
        if self.cell().flags.contains(PortFlags::PULL_STRATEGY) {
            return self.pull();
        }
        self.get()
    }

    /// Explicit pull. Without any handler in the reverse chain this
    /// returns the port's current (default) value.
    pub fn pull(&self) -> Arc<BufferRef> {
        let mut visited: SmallVec<[ElementHandle; 8]> = SmallVec::new();
        if let Some(owned) = pull_chain(self, &mut visited) {
            self.publish(owned);
        }
        self.get()
    }

    /// Pop the oldest queued value.
    pub fn dequeue(&self) -> Option<BufferRef> {
        self.cell().queue.as_ref()?.lock().pop_front()
    }

    /// Pop the oldest queued value and keep it locked in the calling
    /// thread's cache until that cache is torn down.
    pub fn dequeue_auto_locked(&self) -> Option<BufferRef> {
        let reference = self.dequeue()?;
        ThreadLocalCache::with(|tlc| tlc.add_auto_lock(reference.clone()));
        Some(reference)
    }

    pub fn set_pull_handler(&self, handler: Arc<dyn PullHandler>) {
        *self.cell().pull_handler.write() = Some(handler);
    }

    pub fn add_listener(&self, listener: Arc<dyn PortListener>) {
        self.cell().listeners.write().push(listener);
    }

    /// Connect this port to `target`. Both edge lists record the edge
    /// and it is mirrored on the aggregated edge between the two
    /// ports' aggregators.
    pub fn connect_to(&self, target: &Port) -> Result<(), ConnectError> {
        let runtime = self.element.runtime().ok_or(ConnectError::Deleted)?;
        let _guard = runtime.lock_registry();
        self.connect_locked(target, &runtime)
    }

    fn connect_locked(&self, target: &Port, runtime: &Arc<Runtime>) -> Result<(), ConnectError> {
        if Arc::ptr_eq(&self.element, &target.element) {
            return Err(ConnectError::SelfConnection);
        }
        let source_cell = self.cell();
        let target_cell = target.cell();
        if source_cell.data_type.uid() != target_cell.data_type.uid() {
            return Err(ConnectError::TypeMismatch {
                src_ty: source_cell.data_type.name().to_string(),
                target: target_cell.data_type.name().to_string(),
            });
        }
        if self.element.is_deleted() || target.element.is_deleted() {
            return Err(ConnectError::Deleted);
        }
        let already = source_cell.outgoing.read().iter().any(|w| {
            w.upgrade()
                .map(|e| Arc::ptr_eq(&e, &target.element))
                .unwrap_or(false)
        });
        if already {
            return Err(ConnectError::AlreadyConnected);
        }

        source_cell
            .outgoing
            .write()
            .push(Arc::downgrade(&target.element));
        target_cell
            .incoming
            .write()
            .push(Arc::downgrade(&self.element));

        edges::edge_added(
            &self.element,
            &target.element,
            !source_cell.data_type.is_method_type(),
        );
        runtime.fire_edge_change(StructureChange::Added, &self.element, &target.element);
        Ok(())
    }

    /// Remove the edge to `target`; returns false if it did not exist.
    pub fn disconnect_from(&self, target: &Port) -> bool {
        let Some(runtime) = self.element.runtime() else {
            return false;
        };
        let _guard = runtime.lock_registry();
        let source_cell = self.cell();
        let mut removed = false;
        source_cell.outgoing.write().retain(|w| {
            let matches = w
                .upgrade()
                .map(|e| Arc::ptr_eq(&e, &target.element))
                .unwrap_or(false);
            removed |= matches;
            !matches
        });
        if !removed {
            return false;
        }
        target.cell().incoming.write().retain(|w| {
            !w.upgrade()
                .map(|e| Arc::ptr_eq(&e, &self.element))
                .unwrap_or(false)
        });
        edges::edge_removed(
            &self.element,
            &target.element,
            !source_cell.data_type.is_method_type(),
        );
        runtime.fire_edge_change(StructureChange::Removed, &self.element, &target.element);
        true
    }

    /// Release all edges of this port.
    pub fn disconnect_all(&self) {
        let Some(runtime) = self.element.runtime() else {
            return;
        };
        let _guard = runtime.lock_registry();
        disconnect_all_locked(&self.element, &runtime);
    }

    /// Direct edge targets of this port.
    pub fn connections(&self) -> Vec<Arc<Element>> {
        self.cell()
            .outgoing
            .read()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// Direct edge sources of this port.
    pub fn incoming_connections(&self) -> Vec<Arc<Element>> {
        self.cell()
            .incoming
            .read()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }
}

fn pull_chain(port: &Port, visited: &mut SmallVec<[ElementHandle; 8]>) -> Option<OwnedBuffer> {
    let handle = port.element.handle();
    if visited.contains(&handle) {
        return None;
    }
    visited.push(handle);

    let handler = port.cell().pull_handler.read().clone();
    if let Some(handler) = handler {
        if let Some(owned) = handler.pull(port) {
            return Some(owned);
        }
    }
    for source in port.incoming_connections() {
        if let Some(source_port) = Port::from_element(&source) {
            if let Some(owned) = pull_chain(&source_port, visited) {
                return Some(owned);
            }
        }
    }
    None
}

/// The transitive set of ports a pushed value reaches: direct targets
/// plus anything behind routing ports that accept pushes.
fn collect_push_targets(source: &Arc<Element>, out: &mut SmallVec<[Arc<Element>; 8]>) {
    let Some(cell) = source.port_cell() else {
        return;
    };
    let direct: SmallVec<[Arc<Element>; 4]> = cell
        .outgoing
        .read()
        .iter()
        .filter_map(|w| w.upgrade())
        .collect();
    for target in direct {
        if out.iter().any(|e| Arc::ptr_eq(e, &target)) {
            continue;
        }
        let Some(target_cell) = target.port_cell() else {
            continue;
        };
        if !target.is_ready()
            || target.is_deleted()
            || !target_cell.flags.contains(PortFlags::PUSH_STRATEGY)
            || target_cell.value.is_none()
        {
            continue;
        }
        out.push(target.clone());
        collect_push_targets(&target, out);
    }
}

fn deliver(target: &Arc<Element>, cell: &PortCell, reference: BufferRef) {
    if let Some(queue) = &cell.queue {
        let mut q = queue.lock();
        if cell.max_queue_len > 0 && q.len() >= cell.max_queue_len {
            q.pop_front();
        }
        q.push_back(reference.clone());
    }
    let value = Arc::new(reference);
    if let Some(slot) = &cell.value {
        slot.store(value.clone());
    }
    notify_listeners(target, cell, &value);
}

fn notify_listeners(element: &Arc<Element>, cell: &PortCell, value: &Arc<BufferRef>) {
    let listeners: Vec<_> = cell.listeners.read().clone();
    for listener in listeners {
        listener.port_changed(element, value);
    }
}

/// Release all edges of a port. Caller holds the registry lock.
pub(crate) fn disconnect_all_locked(element: &Arc<Element>, runtime: &Arc<Runtime>) {
    let Some(cell) = element.port_cell() else {
        return;
    };
    let data_flow = !cell.data_type.is_method_type();

    let targets: Vec<Arc<Element>> = cell
        .outgoing
        .write()
        .drain(..)
        .filter_map(|w| w.upgrade())
        .collect();
    for target in targets {
        if let Some(target_cell) = target.port_cell() {
            target_cell.incoming.write().retain(|w| {
                !w.upgrade()
                    .map(|e| Arc::ptr_eq(&e, element))
                    .unwrap_or(false)
            });
        }
        edges::edge_removed(element, &target, data_flow);
        runtime.fire_edge_change(StructureChange::Removed, element, &target);
    }

    let sources: Vec<Arc<Element>> = cell
        .incoming
        .write()
        .drain(..)
        .filter_map(|w| w.upgrade())
        .collect();
    for source in sources {
        if let Some(source_cell) = source.port_cell() {
            source_cell.outgoing.write().retain(|w| {
                !w.upgrade()
                    .map(|e| Arc::ptr_eq(&e, element))
                    .unwrap_or(false)
            });
        }
        edges::edge_removed(&source, element, data_flow);
        runtime.fire_edge_change(StructureChange::Removed, &source, element);
    }
}

/// Typed convenience wrapper around a [`Port`] carrying
/// [`SimpleValue`] payloads.
pub struct DataPort<T> {
    port: Port,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DataPort<T> {
    fn clone(&self) -> Self {
        Self {
            port: self.port.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> DataPort<T>
where
    T: WirePayload,
    <T as FromStr>::Err: Display,
{
    pub fn new(info: PortCreationInfo) -> Result<DataPort<T>, StructureError> {
        Ok(Self {
            port: Port::new(info)?,
            _marker: PhantomData,
        })
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Publish a value. Degrades to dropping the publish with a
    /// warning when no buffer is available.
    pub fn publish(&self, value: T) -> bool {
        let Some(mut owned) = self.port.get_unused() else {
            log::warn!(
                "dropping publish on '{}': no buffer available",
                self.port.element.qualified_name()
            );
            return false;
        };
        owned
            .value_mut()
            .downcast_mut::<SimpleValue<T>>()
            .expect("port value has unexpected concrete type")
            .0 = value;
        self.port.publish(owned);
        true
    }

    pub fn get(&self) -> T {
        self.port
            .get()
            .value()
            .downcast_ref::<SimpleValue<T>>()
            .expect("port value has unexpected concrete type")
            .0
            .clone()
    }

    pub fn dequeue(&self) -> Option<T> {
        self.port.dequeue().map(|r| {
            r.value()
                .downcast_ref::<SimpleValue<T>>()
                .expect("port value has unexpected concrete type")
                .0
                .clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::TypeRegistry;

    fn int_type() -> Arc<TypeInfo> {
        TypeRegistry::global().register_value::<i64>("Int64", true)
    }

    fn blob_type() -> Arc<TypeInfo> {
        TypeRegistry::global().register_value::<String>("Text", false)
    }

    fn group(rt: &Arc<Runtime>, name: &str) -> Arc<Element> {
        Element::new(
            rt,
            rt.root(),
            name,
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap()
    }

    #[test]
    fn trivial_publish_read() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let out: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "out", int_type()).output(),
        )
        .unwrap();
        parent.init().unwrap();

        out.publish(42);
        assert_eq!(out.get(), 42);

        // The value slot holds exactly one lock; readers share it.
        let current = out.port().get();
        assert_eq!(
            current.buffer().bank(current.bank() as usize).locks(),
            1
        );
    }

    #[test]
    fn standard_pool_reaches_steady_state() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let out: DataPort<String> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "out", blob_type()).output(),
        )
        .unwrap();
        parent.init().unwrap();

        for i in 0..32 {
            out.publish(format!("value {i}"));
        }
        assert_eq!(out.get(), "value 31");
        // Sentinel + one in-flight buffer; everything else recycled.
        assert!(out.port().pool().unwrap().allocated() <= 2);
    }

    #[test]
    fn push_propagates_along_edges() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let out: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "out", int_type()).output(),
        )
        .unwrap();
        let input: DataPort<i64> = DataPort::new(PortCreationInfo::new(
            &rt,
            &parent,
            "in",
            int_type(),
        ))
        .unwrap();
        out.port().connect_to(input.port()).unwrap();
        parent.init().unwrap();

        out.publish(7);
        assert_eq!(input.get(), 7);
    }

    #[test]
    fn queued_port_drops_oldest_on_overflow() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let out: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "out", int_type()).output(),
        )
        .unwrap();
        let input: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "in", int_type()).queued(2),
        )
        .unwrap();
        out.port().connect_to(input.port()).unwrap();
        parent.init().unwrap();

        out.publish(1);
        out.publish(2);
        out.publish(3);
        assert_eq!(input.dequeue(), Some(2));
        assert_eq!(input.dequeue(), Some(3));
        assert_eq!(input.dequeue(), None);
    }

    #[test]
    fn connect_rejects_type_mismatch_and_self() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let a: DataPort<i64> =
            DataPort::new(PortCreationInfo::new(&rt, &parent, "a", int_type()).output()).unwrap();
        let b: DataPort<String> =
            DataPort::new(PortCreationInfo::new(&rt, &parent, "b", blob_type())).unwrap();

        assert!(matches!(
            a.port().connect_to(b.port()),
            Err(ConnectError::TypeMismatch { .. })
        ));
        assert!(matches!(
            a.port().connect_to(a.port()),
            Err(ConnectError::SelfConnection)
        ));

        let c: DataPort<i64> =
            DataPort::new(PortCreationInfo::new(&rt, &parent, "c", int_type())).unwrap();
        a.port().connect_to(c.port()).unwrap();
        assert!(matches!(
            a.port().connect_to(c.port()),
            Err(ConnectError::AlreadyConnected)
        ));
    }

    #[test]
    fn pull_walks_reverse_edges_to_a_handler() {
        struct CountingHandler;
        impl PullHandler for CountingHandler {
            fn pull(&self, port: &Port) -> Option<OwnedBuffer> {
                let mut owned = port.get_unused()?;
                owned
                    .value_mut()
                    .downcast_mut::<SimpleValue<i64>>()
                    .unwrap()
                    .0 = 99;
                Some(owned)
            }
        }

        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let source: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "src", int_type()).output(),
        )
        .unwrap();
        let sink: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "sink", int_type())
                .with_flags(PortFlags::PULL_STRATEGY),
        )
        .unwrap();
        source.port().connect_to(sink.port()).unwrap();
        parent.init().unwrap();

        source.port().set_pull_handler(Arc::new(CountingHandler));
        let value = sink.port().read();
        assert_eq!(
            value.value().downcast_ref::<SimpleValue<i64>>().unwrap().0,
            99
        );
    }

    #[test]
    fn pull_without_handler_returns_the_default_value() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let sink: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "sink", int_type())
                .with_flags(PortFlags::PULL_STRATEGY),
        )
        .unwrap();
        parent.init().unwrap();
        assert_eq!(sink.get(), 0);
        let pulled = sink.port().read();
        assert_eq!(
            pulled.value().downcast_ref::<SimpleValue<i64>>().unwrap().0,
            0
        );
    }

    #[test]
    fn listeners_fire_after_the_value_is_committed() {
        use std::sync::atomic::{AtomicI64, Ordering};

        struct Probe(AtomicI64);
        impl PortListener for Probe {
            fn port_changed(&self, _port: &Arc<Element>, value: &BufferRef) {
                let v = value.value().downcast_ref::<SimpleValue<i64>>().unwrap().0;
                self.0.store(v, Ordering::SeqCst);
            }
        }

        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let out: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "out", int_type()).output(),
        )
        .unwrap();
        parent.init().unwrap();

        let probe = Arc::new(Probe(AtomicI64::new(-1)));
        out.port().add_listener(probe.clone());
        out.publish(5);
        assert_eq!(probe.0.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn managed_delete_releases_edges() {
        let rt = Runtime::new();
        let parent = group(&rt, "module");
        let out: DataPort<i64> = DataPort::new(
            PortCreationInfo::new(&rt, &parent, "out", int_type()).output(),
        )
        .unwrap();
        let input: DataPort<i64> =
            DataPort::new(PortCreationInfo::new(&rt, &parent, "in", int_type())).unwrap();
        out.port().connect_to(input.port()).unwrap();
        parent.init().unwrap();

        input.port().element().managed_delete();
        assert!(out.port().connections().is_empty());

        // Publishing into the void is fine.
        out.publish(1);
        assert_eq!(out.get(), 1);
    }
}
