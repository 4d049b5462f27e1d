//! The runtime environment: root of the element tree, element
//! registry, registry lock, and change listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, MutexGuard, RwLock};
use thunderdome::Arena;

use crate::element::{Element, ElementHandle};
use crate::error::StructureError;

/// What happened to an element or edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureChange {
    Added,
    Ready,
    Removed,
}

/// Observer of structural runtime changes. Callbacks run under the
/// registry lock; keep them short and do not take it again.
pub trait RuntimeListener: Send + Sync {
    fn element_change(&self, _change: StructureChange, _element: &Arc<Element>) {}
    fn edge_change(
        &self,
        _change: StructureChange,
        _source: &Arc<Element>,
        _target: &Arc<Element>,
    ) {
    }
}

/// The process-wide runtime environment.
pub struct Runtime {
    /// Serializes all structural changes to the tree and edge lists.
    registry_lock: Mutex<()>,
    elements: RwLock<Arena<Arc<Element>>>,
    root: OnceLock<Arc<Element>>,
    listeners: RwLock<Vec<Arc<dyn RuntimeListener>>>,
    command_line: RwLock<AHashMap<String, String>>,
    unique_links: Mutex<AHashSet<String>>,
    shutdown: AtomicBool,
}

impl Runtime {
    pub fn new() -> Arc<Runtime> {
        let runtime = Arc::new(Runtime {
            registry_lock: Mutex::new(()),
            elements: RwLock::new(Arena::new()),
            root: OnceLock::new(),
            listeners: RwLock::new(Vec::new()),
            command_line: RwLock::new(AHashMap::new()),
            unique_links: Mutex::new(AHashSet::new()),
            shutdown: AtomicBool::new(false),
        });
        let root = Element::new_root(&runtime);
        runtime.root.set(root).expect("root created twice");
        runtime
    }

    pub fn root(&self) -> &Arc<Element> {
        self.root.get().expect("runtime root missing")
    }

    /// Take the registry lock. All structural changes happen under it.
    pub fn lock_registry(&self) -> MutexGuard<'_, ()> {
        self.registry_lock.lock()
    }

    /// Look up an element by handle. Lock-free with respect to the
    /// registry lock.
    pub fn element(&self, handle: ElementHandle) -> Option<Arc<Element>> {
        self.elements.read().get(handle.0).cloned()
    }

    pub(crate) fn register_element(&self, element: &Arc<Element>) -> ElementHandle {
        ElementHandle(self.elements.write().insert(element.clone()))
    }

    pub(crate) fn unregister_element(&self, handle: ElementHandle) {
        self.elements.write().remove(handle.0);
    }

    pub(crate) fn claim_unique_link(&self, name: String) -> Result<(), StructureError> {
        if !self.unique_links.lock().insert(name.clone()) {
            return Err(StructureError::DuplicateUniqueLink(name));
        }
        Ok(())
    }

    pub(crate) fn release_unique_link(&self, name: &str) {
        self.unique_links.lock().remove(name);
    }

    pub fn add_listener(&self, listener: Arc<dyn RuntimeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RuntimeListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn fire_element_change(&self, change: StructureChange, element: &Arc<Element>) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.element_change(change, element);
        }
    }

    pub(crate) fn fire_edge_change(
        &self,
        change: StructureChange,
        source: &Arc<Element>,
        target: &Arc<Element>,
    ) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.edge_change(change, source, target);
        }
    }

    /// Command-line arguments handed over by the bootstrap wrapper.
    pub fn set_command_line_arg(&self, key: &str, value: &str) {
        self.command_line
            .write()
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove_command_line_arg(&self, key: &str) {
        self.command_line.write().remove(key);
    }

    pub fn command_line_arg(&self, key: &str) -> Option<String> {
        self.command_line.read().get(key).cloned()
    }

    /// Request process-wide shutdown; loop threads exit at their next
    /// boundary.
    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementFlags, ElementKind};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        added: AtomicUsize,
        ready: AtomicUsize,
        removed: AtomicUsize,
    }

    impl RuntimeListener for Counter {
        fn element_change(&self, change: StructureChange, _element: &Arc<Element>) {
            let slot = match change {
                StructureChange::Added => &self.added,
                StructureChange::Ready => &self.ready,
                StructureChange::Removed => &self.removed,
            };
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn listeners_observe_the_element_lifecycle() {
        let rt = Runtime::new();
        let counter = Arc::new(Counter::default());
        rt.add_listener(counter.clone());

        let el = Element::new(
            &rt,
            rt.root(),
            "module",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        el.init().unwrap();
        el.managed_delete();

        assert_eq!(counter.added.load(Ordering::Relaxed), 1);
        assert_eq!(counter.ready.load(Ordering::Relaxed), 1);
        assert_eq!(counter.removed.load(Ordering::Relaxed), 1);

        let listener: Arc<dyn RuntimeListener> = counter.clone();
        rt.remove_listener(&listener);
        let el2 = Element::new(
            &rt,
            rt.root(),
            "module2",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        drop(el2);
        assert_eq!(counter.added.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn handles_resolve_until_deletion() {
        let rt = Runtime::new();
        let el = Element::new(
            &rt,
            rt.root(),
            "module",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        let handle = el.handle();
        assert!(Arc::ptr_eq(&rt.element(handle).unwrap(), &el));
        el.managed_delete();
        assert!(rt.element(handle).is_none());
    }
}
