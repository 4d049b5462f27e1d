//! Task annotations read by the scheduler.

use std::sync::{Arc, Weak};

use axon_core::{Annotation, DuplicateAnnotation};
use axon_graph::Element;

/// Callback invoked once per cycle for a scheduled task.
pub type TaskCallback = Arc<dyn Fn() + Send + Sync>;

/// Annotation declaring a periodic task on a framework element.
///
/// `incoming` and `outgoing` name the edge-aggregator interfaces the
/// task reads from and publishes through; the scheduler traces
/// aggregated edges between them to order tasks.
pub struct PeriodicTask {
    pub callback: TaskCallback,
    pub incoming: Vec<Weak<Element>>,
    pub outgoing: Vec<Weak<Element>>,
    /// Sense tasks run before all other tasks of a container.
    pub sense_task: bool,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .field("sense_task", &self.sense_task)
            .finish()
    }
}

impl Annotation for PeriodicTask {}

impl PeriodicTask {
    pub fn new(
        callback: TaskCallback,
        incoming: &[&Arc<Element>],
        outgoing: &[&Arc<Element>],
        sense_task: bool,
    ) -> PeriodicTask {
        PeriodicTask {
            callback,
            incoming: incoming.iter().map(|e| Arc::downgrade(e)).collect(),
            outgoing: outgoing.iter().map(|e| Arc::downgrade(e)).collect(),
            sense_task,
        }
    }

    pub fn attach(element: &Arc<Element>, task: PeriodicTask) -> Result<(), DuplicateAnnotation> {
        element.add_annotation(Arc::new(task))
    }
}

/// Annotation marking the thread container responsible for a subtree.
#[derive(Debug)]
pub struct ExecutionControl {
    pub container: Weak<Element>,
}

impl Annotation for ExecutionControl {}

/// The container responsible for `element`: the nearest execution
/// control on the path to the root.
pub fn find_execution_control(element: &Arc<Element>) -> Option<Arc<Element>> {
    let mut cur = Some(element.clone());
    while let Some(el) = cur {
        if let Some(control) = el.get_annotation::<ExecutionControl>() {
            return control.container.upgrade();
        }
        cur = el.parent();
    }
    None
}
