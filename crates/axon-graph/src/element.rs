//! The framework-element tree.
//!
//! Every runtime entity is a node in one process-wide tree: modules,
//! groups, interfaces and ports. An element has exactly one primary
//! parent (secondary links may alias it elsewhere), a flag word, an
//! annotation list, and a payload selected once at creation. All
//! structural changes are serialized by the runtime's registry lock;
//! read-only traversal takes uncontended shared locks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use axon_core::{Annotation, AnnotationList, DuplicateAnnotation};
use bitflags::bitflags;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::edges::AggregatorCell;
use crate::error::StructureError;
use crate::port::PortCell;
use crate::runtime::{Runtime, StructureChange};
use crate::{param, port};

bitflags! {
    /// Constant and lifecycle flags of a framework element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ElementFlags: u32 {
        const PORT                 = 1 << 0;
        const EDGE_AGGREGATOR      = 1 << 1;
        const INTERFACE            = 1 << 2;
        const FINSTRUCTABLE_GROUP  = 1 << 3;
        const NETWORK_ELEMENT      = 1 << 4;
        const GLOBALLY_UNIQUE_LINK = 1 << 5;
        /// Element deals with sensor data (scheduling hint).
        const SENSE_DATA           = 1 << 6;
        /// Set after `init`; the element is visible in the tree.
        const READY                = 1 << 7;
        /// Set once by `managed_delete`.
        const DELETED              = 1 << 8;
    }
}

/// Generational handle of an element in the runtime registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub thunderdome::Index);

/// One entry in an element's link list. The primary link comes first.
pub struct Link {
    pub name: String,
    /// `None` only for the runtime root.
    pub parent: Option<Weak<Element>>,
}

/// Payload of an element, selected once at creation.
pub enum ElementKind {
    Plain,
    Port(PortCell),
    Aggregator(AggregatorCell),
}

/// Per-element initialization hooks, run by `init` before and after
/// the element's children are initialized.
#[derive(Default)]
pub struct InitHooks {
    pub pre_child_init: Option<Box<dyn Fn(&Arc<Element>) + Send + Sync>>,
    pub post_child_init: Option<Box<dyn Fn(&Arc<Element>) + Send + Sync>>,
}

impl std::fmt::Debug for InitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitHooks")
            .field("pre_child_init", &self.pre_child_init.is_some())
            .field("post_child_init", &self.post_child_init.is_some())
            .finish()
    }
}

impl Annotation for InitHooks {}

pub struct Element {
    runtime: Weak<Runtime>,
    handle: OnceLock<ElementHandle>,
    flags: AtomicU32,
    links: RwLock<SmallVec<[Link; 1]>>,
    children: RwLock<Vec<Arc<Element>>>,
    annotations: AnnotationList,
    me: Weak<Element>,
    pub(crate) kind: ElementKind,
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Element({})", self.qualified_name())
    }
}

impl Element {
    /// Create an element under `parent` and register it.
    pub fn new(
        runtime: &Arc<Runtime>,
        parent: &Arc<Element>,
        name: &str,
        flags: ElementFlags,
        kind: ElementKind,
    ) -> Result<Arc<Element>, StructureError> {
        let _guard = runtime.lock_registry();
        Self::new_locked(runtime, parent, name, flags, kind)
    }

    pub(crate) fn new_locked(
        runtime: &Arc<Runtime>,
        parent: &Arc<Element>,
        name: &str,
        flags: ElementFlags,
        kind: ElementKind,
    ) -> Result<Arc<Element>, StructureError> {
        debug_assert!(!flags.intersects(ElementFlags::READY | ElementFlags::DELETED));

        let element = Arc::new_cyclic(|me| Element {
            runtime: Arc::downgrade(runtime),
            handle: OnceLock::new(),
            flags: AtomicU32::new(flags.bits()),
            links: RwLock::new(SmallVec::new()),
            children: RwLock::new(Vec::new()),
            annotations: AnnotationList::new(),
            me: me.clone(),
            kind,
        });

        Self::add_child_locked(parent, &element, name)?;

        let handle = runtime.register_element(&element);
        element
            .handle
            .set(handle)
            .expect("element registered twice");

        runtime.fire_element_change(StructureChange::Added, &element);

        Ok(element)
    }

    pub(crate) fn new_root(runtime: &Arc<Runtime>) -> Arc<Element> {
        let element = Arc::new_cyclic(|me| Element {
            runtime: Arc::downgrade(runtime),
            handle: OnceLock::new(),
            flags: AtomicU32::new(ElementFlags::READY.bits()),
            links: RwLock::new(SmallVec::from_iter([Link {
                name: String::new(),
                parent: None,
            }])),
            children: RwLock::new(Vec::new()),
            annotations: AnnotationList::new(),
            me: me.clone(),
            kind: ElementKind::Plain,
        });
        let handle = runtime.register_element(&element);
        element.handle.set(handle).expect("root registered twice");
        element
    }

    /// Self reference. Valid as long as anything in the runtime still
    /// holds the element.
    fn me(&self) -> Arc<Element> {
        self.me.upgrade().expect("element outlived its last Arc")
    }

    /// Link `child` under `parent` as its primary parent. Attaching an
    /// element that already has a primary parent fails.
    fn add_child_locked(
        parent: &Arc<Element>,
        child: &Arc<Element>,
        name: &str,
    ) -> Result<(), StructureError> {
        if parent.is_deleted() {
            return Err(StructureError::ParentDeleted);
        }
        if !child.links.read().is_empty() {
            return Err(StructureError::AlreadyHasParent);
        }
        child.links.write().push(Link {
            name: name.to_string(),
            parent: Some(Arc::downgrade(parent)),
        });
        parent.children.write().push(child.clone());
        Ok(())
    }

    /// Add a secondary link to this element under another parent.
    pub fn add_secondary_link(
        &self,
        parent: &Arc<Element>,
        name: &str,
    ) -> Result<(), StructureError> {
        let runtime = self.runtime().ok_or(StructureError::RuntimeGone)?;
        let _guard = runtime.lock_registry();
        if parent.is_deleted() {
            return Err(StructureError::ParentDeleted);
        }
        debug_assert!(!self.links.read().is_empty(), "element has no primary link");
        self.links.write().push(Link {
            name: name.to_string(),
            parent: Some(Arc::downgrade(parent)),
        });
        parent.children.write().push(self.me());
        Ok(())
    }

    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.upgrade()
    }

    pub fn handle(&self) -> ElementHandle {
        *self.handle.get().expect("element not registered")
    }

    pub fn flags(&self) -> ElementFlags {
        ElementFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn get_flag(&self, flag: ElementFlags) -> bool {
        self.flags().contains(flag)
    }

    fn set_flag(&self, flag: ElementFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Atomically set DELETED; returns false if it was already set.
    fn mark_deleted(&self) -> bool {
        let prev = self.flags.fetch_or(ElementFlags::DELETED.bits(), Ordering::AcqRel);
        prev & ElementFlags::DELETED.bits() == 0
    }

    pub fn is_ready(&self) -> bool {
        self.get_flag(ElementFlags::READY)
    }

    pub fn is_deleted(&self) -> bool {
        self.get_flag(ElementFlags::DELETED)
    }

    pub fn is_port(&self) -> bool {
        self.get_flag(ElementFlags::PORT)
    }

    pub fn is_root(&self) -> bool {
        self.links.read().first().map(|l| l.parent.is_none()).unwrap_or(false)
    }

    /// Name of the primary link.
    pub fn name(&self) -> String {
        self.links
            .read()
            .first()
            .map(|l| l.name.clone())
            .unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Arc<Element>> {
        self.links
            .read()
            .first()
            .and_then(|l| l.parent.as_ref())
            .and_then(|w| w.upgrade())
    }

    /// Slash-separated chain of primary link names from the root.
    pub fn qualified_name(&self) -> String {
        let mut names: Vec<String> = Vec::new();
        if !self.is_root() {
            names.push(self.name());
            let mut cur = self.parent();
            while let Some(el) = cur {
                if el.is_root() {
                    break;
                }
                names.push(el.name());
                cur = el.parent();
            }
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.reverse();
        let mut out = String::new();
        for name in &names {
            out.push('/');
            out.push_str(name);
        }
        out
    }

    /// Snapshot of the current children.
    pub fn children(&self) -> Vec<Arc<Element>> {
        self.children.read().clone()
    }

    /// Snapshot of the whole sub-tree below this element, depth-first.
    pub fn sub_elements(&self) -> Vec<Arc<Element>> {
        let mut out = Vec::new();
        for child in self.children() {
            collect_sub(&child, &mut out);
        }
        out
    }

    /// Is this element below `ancestor` (or equal to it)?
    pub fn is_below(&self, ancestor: &Arc<Element>, include_self: bool) -> bool {
        if include_self && std::ptr::eq(self, Arc::as_ptr(ancestor)) {
            return true;
        }
        let mut cur = self.parent();
        while let Some(el) = cur {
            if Arc::ptr_eq(&el, ancestor) {
                return true;
            }
            cur = el.parent();
        }
        false
    }

    pub fn annotations(&self) -> &AnnotationList {
        &self.annotations
    }

    pub fn add_annotation(&self, annotation: Arc<dyn Annotation>) -> Result<(), DuplicateAnnotation> {
        self.annotations.add(annotation)
    }

    pub fn get_annotation<T: Annotation>(&self) -> Option<Arc<T>> {
        self.annotations.get::<T>()
    }

    pub(crate) fn port_cell(&self) -> Option<&PortCell> {
        match &self.kind {
            ElementKind::Port(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn aggregator(&self) -> Option<&AggregatorCell> {
        match &self.kind {
            ElementKind::Aggregator(cell) => Some(cell),
            _ => None,
        }
    }

    /// Initialize this element and its sub-tree: parent-first, then
    /// children, then mark READY. Also applies parameter values.
    pub fn init(&self) -> Result<(), StructureError> {
        let runtime = self.runtime().ok_or(StructureError::RuntimeGone)?;
        let _guard = runtime.lock_registry();
        self.init_locked(&runtime)
    }

    fn init_locked(&self, runtime: &Arc<Runtime>) -> Result<(), StructureError> {
        if self.is_deleted() {
            return Err(StructureError::Deleted);
        }
        let this = self.me();
        let first_init = !self.is_ready();
        let hooks = self.get_annotation::<InitHooks>();

        if first_init {
            if self.get_flag(ElementFlags::GLOBALLY_UNIQUE_LINK) {
                runtime.claim_unique_link(self.qualified_name())?;
            }
            if let Some(pre) = hooks.as_ref().and_then(|h| h.pre_child_init.as_ref()) {
                pre(&this);
            }
        }

        for child in self.children() {
            child.init_locked(runtime)?;
        }

        if first_init {
            if let Some(post) = hooks.as_ref().and_then(|h| h.post_child_init.as_ref()) {
                post(&this);
            }
            self.set_flag(ElementFlags::READY);
            param::load_on_init(&this);
            runtime.fire_element_change(StructureChange::Ready, &this);
        }
        Ok(())
    }

    /// Delete this element and its sub-tree. Idempotent. Edges are
    /// released port-by-port before the tree is taken apart.
    pub fn managed_delete(&self) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        let _guard = runtime.lock_registry();
        self.delete_locked(&runtime);
    }

    fn delete_locked(&self, runtime: &Arc<Runtime>) {
        if !self.mark_deleted() {
            return;
        }
        let this = self.me();

        if self.port_cell().is_some() {
            port::disconnect_all_locked(&this, runtime);
        }

        let children: Vec<Arc<Element>> = std::mem::take(&mut *self.children.write());
        for child in children {
            child.delete_locked(runtime);
        }

        if self.get_flag(ElementFlags::GLOBALLY_UNIQUE_LINK) {
            runtime.release_unique_link(&self.qualified_name());
        }

        for link in self.links.read().iter() {
            if let Some(parent) = link.parent.as_ref().and_then(|w| w.upgrade()) {
                parent
                    .children
                    .write()
                    .retain(|c| !Arc::ptr_eq(c, &this));
            }
        }

        runtime.unregister_element(self.handle());
        runtime.fire_element_change(StructureChange::Removed, &this);
    }
}

fn collect_sub(element: &Arc<Element>, out: &mut Vec<Arc<Element>>) {
    out.push(element.clone());
    for child in element.children() {
        collect_sub(&child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(
        runtime: &Arc<Runtime>,
        parent: &Arc<Element>,
        name: &str,
    ) -> Arc<Element> {
        Element::new(runtime, parent, name, ElementFlags::empty(), ElementKind::Plain).unwrap()
    }

    #[test]
    fn qualified_names_chain_from_root() {
        let rt = Runtime::new();
        let group = plain(&rt, rt.root(), "group");
        let module = plain(&rt, &group, "module");
        assert_eq!(rt.root().qualified_name(), "/");
        assert_eq!(group.qualified_name(), "/group");
        assert_eq!(module.qualified_name(), "/group/module");
    }

    #[test]
    fn second_primary_attach_fails() {
        let rt = Runtime::new();
        let a = plain(&rt, rt.root(), "a");
        let b = plain(&rt, rt.root(), "b");
        let _c = plain(&rt, &a, "c");
        // c already hangs under a; a fresh add_child must be rejected.
        let c = a.children()[0].clone();
        let err = {
            let _g = rt.lock_registry();
            Element::add_child_locked(&b, &c, "c2")
        };
        assert!(matches!(err, Err(StructureError::AlreadyHasParent)));
    }

    #[test]
    fn init_marks_the_subtree_ready_parent_first() {
        let rt = Runtime::new();
        let group = plain(&rt, rt.root(), "group");
        let module = plain(&rt, &group, "module");
        assert!(!group.is_ready());
        group.init().unwrap();
        assert!(group.is_ready());
        assert!(module.is_ready());
    }

    #[test]
    fn every_ready_element_has_exactly_one_primary_path() {
        let rt = Runtime::new();
        let group = plain(&rt, rt.root(), "group");
        let module = plain(&rt, &group, "module");
        let port_like = plain(&rt, &module, "out");
        group.init().unwrap();

        for el in [&group, &module, &port_like] {
            // Exactly one chain of primary parents reaches the root.
            let mut cur = (*el).clone();
            let mut hops = 0;
            while !cur.is_root() {
                cur = cur.parent().expect("primary chain broken");
                hops += 1;
                assert!(hops < 16);
            }
        }
        assert_eq!(rt.root().sub_elements().len(), 3);
    }

    #[test]
    fn managed_delete_is_idempotent_and_detaches() {
        let rt = Runtime::new();
        let group = plain(&rt, rt.root(), "group");
        let module = plain(&rt, &group, "module");
        group.init().unwrap();

        let before = rt.root().children().len();
        module.managed_delete();
        module.managed_delete();
        assert!(module.is_deleted());
        assert!(group.children().is_empty());
        assert_eq!(rt.root().children().len(), before);
        assert!(rt.element(module.handle()).is_none());
    }

    #[test]
    fn duplicate_unique_link_is_rejected_at_init() {
        let rt = Runtime::new();
        let a = Element::new(
            &rt,
            rt.root(),
            "sensor",
            ElementFlags::GLOBALLY_UNIQUE_LINK,
            ElementKind::Plain,
        )
        .unwrap();
        a.init().unwrap();

        let group = plain(&rt, rt.root(), "other");
        let b = Element::new(
            &rt,
            &group,
            "sensor",
            ElementFlags::GLOBALLY_UNIQUE_LINK,
            ElementKind::Plain,
        )
        .unwrap();
        // Different qualified name: fine.
        b.init().unwrap();

        let c = Element::new(
            &rt,
            rt.root(),
            "sensor2",
            ElementFlags::GLOBALLY_UNIQUE_LINK,
            ElementKind::Plain,
        )
        .unwrap();
        c.init().unwrap();
        let d = Element::new(
            &rt,
            rt.root(),
            "sensor",
            ElementFlags::GLOBALLY_UNIQUE_LINK,
            ElementKind::Plain,
        );
        // Same qualified name as `a`.
        assert!(matches!(
            d.unwrap().init(),
            Err(StructureError::DuplicateUniqueLink(_))
        ));
    }
}
