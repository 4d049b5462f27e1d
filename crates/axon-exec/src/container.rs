//! Thread containers: loop threads that order and execute the
//! periodic tasks of their subtree.
//!
//! On every (re)build the container collects the tasks whose nearest
//! execution control it is, sense tasks first, traces aggregated
//! edges to record predecessor/successor pairs, and topologically
//! sorts. A cycle is broken deterministically: the first remaining
//! task in discovery order is emitted with one warning. Each cycle
//! publishes the previous cycle's duration to a status port and runs
//! under a watchdog deadline of four cycle times plus one second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use atomic_float::AtomicF64;
use parking_lot::Mutex;

use axon_core::watchdog::WatchdogTask;
use axon_core::TypeRegistry;
use axon_graph::{
    DataPort, Element, ElementFlags, ElementHandle, ElementKind, PortCreationInfo, Runtime,
    RuntimeListener, StructureChange, StructureError,
};

use crate::task::{find_execution_control, ExecutionControl, PeriodicTask, TaskCallback};

const NOTIFY_RING_CAPACITY: usize = 64;

/// A framework element owning a loop thread with a fixed cycle time.
pub struct ThreadContainer {
    element: Arc<Element>,
    runtime: Arc<Runtime>,
    cycle_time: Duration,
    shared: Arc<Shared>,
    status_port: DataPort<f64>,
    listener: Arc<ChangeListener>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    consumer: Mutex<Option<rtrb::Consumer<()>>>,
}

struct Shared {
    reschedule: AtomicBool,
    stop: AtomicBool,
    last_cycle_secs: AtomicF64,
}

/// Runtime listener nudging the loop when a structural change touches
/// the container's subtree.
struct ChangeListener {
    container: std::sync::Weak<Element>,
    notify: Mutex<rtrb::Producer<()>>,
    shared: Arc<Shared>,
}

impl ChangeListener {
    fn nudge(&self) {
        if self.notify.lock().push(()).is_err() {
            // Ring full: a reschedule is pending anyway.
            self.shared.reschedule.store(true, Ordering::Release);
        }
    }
}

impl RuntimeListener for ChangeListener {
    fn element_change(&self, _change: StructureChange, element: &Arc<Element>) {
        if let Some(container) = self.container.upgrade() {
            if element.is_below(&container, true) {
                self.nudge();
            }
        }
    }

    fn edge_change(
        &self,
        _change: StructureChange,
        source: &Arc<Element>,
        target: &Arc<Element>,
    ) {
        if let Some(container) = self.container.upgrade() {
            if source.is_below(&container, false) && target.is_below(&container, false) {
                self.nudge();
            }
        }
    }
}

impl ThreadContainer {
    pub fn new(
        runtime: &Arc<Runtime>,
        parent: &Arc<Element>,
        name: &str,
        cycle_time: Duration,
    ) -> Result<Arc<ThreadContainer>, StructureError> {
        let element = Element::new(
            runtime,
            parent,
            name,
            ElementFlags::EDGE_AGGREGATOR,
            ElementKind::Aggregator(axon_graph::AggregatorCell::new()),
        )?;
        element
            .add_annotation(Arc::new(ExecutionControl {
                container: Arc::downgrade(&element),
            }))
            .expect("fresh element already annotated");

        let double_type = TypeRegistry::global().register_value::<f64>("Double", true);
        let status_port: DataPort<f64> = DataPort::new(
            PortCreationInfo::new(runtime, &element, "LastCycleTime", double_type).output(),
        )?;

        let shared = Arc::new(Shared {
            reschedule: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            last_cycle_secs: AtomicF64::new(0.0),
        });
        let (producer, consumer) = rtrb::RingBuffer::new(NOTIFY_RING_CAPACITY);
        let listener = Arc::new(ChangeListener {
            container: Arc::downgrade(&element),
            notify: Mutex::new(producer),
            shared: shared.clone(),
        });

        Ok(Arc::new(ThreadContainer {
            element,
            runtime: runtime.clone(),
            cycle_time,
            shared,
            status_port,
            listener,
            thread: Mutex::new(None),
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    pub fn element(&self) -> &Arc<Element> {
        &self.element
    }

    pub fn cycle_time(&self) -> Duration {
        self.cycle_time
    }

    /// Duration of the previous execution cycle.
    pub fn last_cycle_time(&self) -> Duration {
        Duration::from_secs_f64(self.shared.last_cycle_secs.load(Ordering::Relaxed))
    }

    /// Port publishing the previous cycle's duration in seconds.
    pub fn status_port(&self) -> &DataPort<f64> {
        &self.status_port
    }

    /// Start the loop thread. The container must be initialized.
    pub fn start(&self) {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return;
        }
        let Some(consumer) = self.consumer.lock().take() else {
            log::warn!(
                "thread container '{}' cannot be restarted after stop",
                self.element.name()
            );
            return;
        };
        self.runtime.add_listener(self.listener.clone());

        let ctx = LoopCtx {
            element: self.element.clone(),
            runtime: self.runtime.clone(),
            cycle_time: self.cycle_time,
            shared: self.shared.clone(),
            status_port: self.status_port.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("ThreadContainer {}", self.element.name()))
            .spawn(move || ctx.run(consumer))
            .expect("failed to spawn thread container loop");
        *slot = Some(handle);
    }

    /// Stop the loop thread and wait for it to exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        let listener: Arc<dyn RuntimeListener> = self.listener.clone();
        self.runtime.remove_listener(&listener);
    }

}

/// Everything the loop thread needs, detached from the container
/// handle so the thread owns its state.
struct LoopCtx {
    element: Arc<Element>,
    runtime: Arc<Runtime>,
    cycle_time: Duration,
    shared: Arc<Shared>,
    status_port: DataPort<f64>,
}

impl LoopCtx {
    fn run(self, mut consumer: rtrb::Consumer<()>) {
        let watchdog = WatchdogTask::register(cfg!(debug_assertions));
        let mut schedule: Vec<ScheduledTask> = Vec::new();
        let mut last_cycle = Duration::ZERO;

        loop {
            if self.shared.stop.load(Ordering::Acquire) || self.runtime.is_shutting_down() {
                break;
            }

            let mut needs_rebuild = self.shared.reschedule.swap(false, Ordering::AcqRel);
            while consumer.pop().is_ok() {
                needs_rebuild = true;
            }
            if needs_rebuild {
                let _guard = self.runtime.lock_registry();
                let (new_schedule, warnings) = build_schedule_locked(&self.element);
                for warning in warnings {
                    log::warn!("{warning}");
                }
                schedule = new_schedule;
            }

            let start = Instant::now();
            self.status_port.publish(last_cycle.as_secs_f64());

            watchdog.arm(start + self.cycle_time * 4 + Duration::from_secs(1));
            for task in &schedule {
                watchdog.set_current(&task.qualified_name);
                (task.callback)();
            }
            watchdog.disarm();

            last_cycle = start.elapsed();
            self.shared
                .last_cycle_secs
                .store(last_cycle.as_secs_f64(), Ordering::Relaxed);

            if last_cycle < self.cycle_time {
                std::thread::sleep(self.cycle_time - last_cycle);
            }
        }
    }
}

struct ScheduledTask {
    qualified_name: String,
    callback: TaskCallback,
}

struct TaskNode {
    element: Arc<Element>,
    task: Arc<PeriodicTask>,
    predecessors: Vec<usize>,
    successors: Vec<usize>,
}

/// Build the execution order for all tasks controlled by `container`.
/// Caller holds the registry lock. Returns the schedule plus any
/// cycle warnings.
fn build_schedule_locked(container: &Arc<Element>) -> (Vec<ScheduledTask>, Vec<String>) {
    let mut sense: Vec<(Arc<Element>, Arc<PeriodicTask>)> = Vec::new();
    let mut other: Vec<(Arc<Element>, Arc<PeriodicTask>)> = Vec::new();

    for element in container.sub_elements() {
        if !element.is_ready() {
            continue;
        }
        // Elements of nested containers belong to those containers.
        match find_execution_control(&element) {
            Some(control) if Arc::ptr_eq(&control, container) => {}
            _ => continue,
        }
        if let Some(task) = element.get_annotation::<PeriodicTask>() {
            if task.sense_task {
                sense.push((element, task));
            } else {
                other.push((element, task));
            }
        }
    }

    let mut nodes: Vec<TaskNode> = sense
        .into_iter()
        .chain(other)
        .map(|(element, task)| TaskNode {
            element,
            task,
            predecessors: Vec::new(),
            successors: Vec::new(),
        })
        .collect();

    let by_handle: AHashMap<ElementHandle, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.element.handle(), i))
        .collect();

    // Trace aggregated edges from every task's outgoing interfaces.
    let mut edges: Vec<(usize, usize)> = Vec::new();
    for index in 0..nodes.len() {
        let outgoing: Vec<Arc<Element>> = nodes[index]
            .task
            .outgoing
            .iter()
            .filter_map(|w| w.upgrade())
            .collect();
        let mut trace: Vec<ElementHandle> = Vec::new();
        for aggregator in outgoing {
            trace_outgoing(index, &aggregator, &mut trace, &mut edges, &by_handle);
        }
    }
    for &(from, to) in &edges {
        if from == to {
            continue;
        }
        if !nodes[from].successors.contains(&to) {
            nodes[from].successors.push(to);
            nodes[to].predecessors.push(from);
        }
    }

    // Kahn-style emission; ties and cycle breaks resolve in discovery
    // order.
    let count = nodes.len();
    let mut pred_count: Vec<usize> = nodes.iter().map(|n| n.predecessors.len()).collect();
    let mut emitted = vec![false; count];
    let mut remaining: Vec<usize> = (0..count).collect();
    let mut schedule = Vec::with_capacity(count);
    let mut warnings = Vec::new();

    while !remaining.is_empty() {
        let position = remaining.iter().position(|&i| pred_count[i] == 0);
        let position = match position {
            Some(position) => position,
            None => {
                let stuck = remaining[0];
                warnings.push(format!(
                    "schedule of '{}' contains a cycle; continuing with '{}'",
                    container.qualified_name(),
                    nodes[stuck].element.qualified_name()
                ));
                0
            }
        };
        let index = remaining.remove(position);
        emitted[index] = true;
        schedule.push(ScheduledTask {
            qualified_name: nodes[index].element.qualified_name(),
            callback: nodes[index].task.callback.clone(),
        });
        for &successor in &nodes[index].successors {
            if !emitted[successor] && pred_count[successor] > 0 {
                pred_count[successor] -= 1;
            }
        }
    }

    (schedule, warnings)
}

/// Follow aggregated edges from `outgoing` until another task is
/// reached (record an ordering edge) or the reachable subgraph is
/// exhausted. Pass-through interface elements are traversed.
fn trace_outgoing(
    task: usize,
    outgoing: &Arc<Element>,
    trace: &mut Vec<ElementHandle>,
    edges: &mut Vec<(usize, usize)>,
    by_handle: &AHashMap<ElementHandle, usize>,
) {
    trace.push(outgoing.handle());

    let emerging = outgoing
        .aggregator()
        .map(|cell| cell.emerging_edges())
        .unwrap_or_default();
    for edge in emerging {
        let Some(dest) = edge.destination() else {
            continue;
        };
        if trace.contains(&dest.handle()) {
            continue;
        }

        if let Some(target) = task_of(&dest, by_handle) {
            edges.push((task, target));
            continue;
        }

        let dest_has_edges = dest
            .aggregator()
            .map(|cell| !cell.emerging_edges().is_empty())
            .unwrap_or(false);
        if dest_has_edges {
            trace_outgoing(task, &dest, trace, edges, by_handle);
        } else if dest.get_flag(ElementFlags::INTERFACE) {
            // A pass-through interface: continue at its parent group
            // and the group's other interfaces.
            if let Some(parent) = dest.parent() {
                if parent.get_flag(ElementFlags::EDGE_AGGREGATOR)
                    && !trace.contains(&parent.handle())
                {
                    trace_outgoing(task, &parent, trace, edges, by_handle);
                }
                for sibling in parent.children() {
                    if sibling.is_ready()
                        && sibling.get_flag(ElementFlags::EDGE_AGGREGATOR)
                        && sibling.get_flag(ElementFlags::INTERFACE)
                        && !trace.contains(&sibling.handle())
                    {
                        trace_outgoing(task, &sibling, trace, edges, by_handle);
                    }
                }
            }
        }
    }

    debug_assert_eq!(trace.last(), Some(&outgoing.handle()));
    trace.pop();
}

/// The task a traced aggregator belongs to: its own annotation, or
/// its parent's when the aggregator is an interface.
fn task_of(element: &Arc<Element>, by_handle: &AHashMap<ElementHandle, usize>) -> Option<usize> {
    if element.annotations().has::<PeriodicTask>() {
        return by_handle.get(&element.handle()).copied();
    }
    if element.get_flag(ElementFlags::INTERFACE) {
        if let Some(parent) = element.parent() {
            if parent.annotations().has::<PeriodicTask>() {
                return by_handle.get(&parent.handle()).copied();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_graph::AggregatorCell;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        order: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                order: Mutex::new(Vec::new()),
            })
        }
    }

    fn record(recorder: &Arc<Recorder>, name: &'static str) -> TaskCallback {
        let recorder = recorder.clone();
        Arc::new(move || recorder.order.lock().push(name))
    }

    fn int_type() -> Arc<axon_core::TypeInfo> {
        TypeRegistry::global().register_value::<i64>("Int64", true)
    }

    /// A module: an aggregator element carrying a periodic task, with
    /// one input and one output port.
    fn make_module(
        rt: &Arc<Runtime>,
        container: &Arc<Element>,
        name: &'static str,
        callback: TaskCallback,
        sense: bool,
    ) -> (Arc<Element>, DataPort<i64>, DataPort<i64>) {
        let module = Element::new(
            rt,
            container,
            name,
            ElementFlags::EDGE_AGGREGATOR,
            ElementKind::Aggregator(AggregatorCell::new()),
        )
        .unwrap();
        let input: DataPort<i64> =
            DataPort::new(PortCreationInfo::new(rt, &module, "in", int_type())).unwrap();
        let output: DataPort<i64> =
            DataPort::new(PortCreationInfo::new(rt, &module, "out", int_type()).output()).unwrap();
        PeriodicTask::attach(
            &module,
            PeriodicTask::new(callback, &[&module], &[&module], sense),
        )
        .unwrap();
        (module, input, output)
    }

    fn build(container: &Arc<Element>, rt: &Arc<Runtime>) -> (Vec<String>, Vec<String>) {
        let _guard = rt.lock_registry();
        let (schedule, warnings) = build_schedule_locked(container);
        (
            schedule.iter().map(|t| t.qualified_name.clone()).collect(),
            warnings,
        )
    }

    #[test]
    fn schedule_follows_the_data_flow() {
        let rt = Runtime::new();
        let container = ThreadContainer::new(&rt, rt.root(), "main", Duration::from_millis(10))
            .unwrap();
        let recorder = Recorder::new();

        let (_, _a_in, a_out) = make_module(
            &rt,
            container.element(),
            "A",
            record(&recorder, "A"),
            false,
        );
        let (_, b_in, b_out) = make_module(
            &rt,
            container.element(),
            "B",
            record(&recorder, "B"),
            false,
        );
        let (_, c_in, _c_out) = make_module(
            &rt,
            container.element(),
            "C",
            record(&recorder, "C"),
            false,
        );

        // C reads from B, B reads from A; create edges in reverse
        // order so the schedule cannot just mirror insertion order.
        b_out.port().connect_to(c_in.port()).unwrap();
        a_out.port().connect_to(b_in.port()).unwrap();
        container.element().init().unwrap();

        let (order, warnings) = build(container.element(), &rt);
        assert!(warnings.is_empty());
        assert_eq!(order, vec!["/main/A", "/main/B", "/main/C"]);
    }

    #[test]
    fn sense_tasks_run_first() {
        let rt = Runtime::new();
        let container = ThreadContainer::new(&rt, rt.root(), "main", Duration::from_millis(10))
            .unwrap();
        let recorder = Recorder::new();

        make_module(&rt, container.element(), "act", record(&recorder, "act"), false);
        make_module(
            &rt,
            container.element(),
            "sense",
            record(&recorder, "sense"),
            true,
        );
        container.element().init().unwrap();

        let (order, warnings) = build(container.element(), &rt);
        assert!(warnings.is_empty());
        assert_eq!(order, vec!["/main/sense", "/main/act"]);
    }

    #[test]
    fn cycle_produces_one_warning_and_a_complete_schedule() {
        let rt = Runtime::new();
        let container = ThreadContainer::new(&rt, rt.root(), "main", Duration::from_millis(10))
            .unwrap();
        let recorder = Recorder::new();

        let (_, a_in, a_out) =
            make_module(&rt, container.element(), "A", record(&recorder, "A"), false);
        let (_, b_in, b_out) =
            make_module(&rt, container.element(), "B", record(&recorder, "B"), false);
        let (_, c_in, c_out) =
            make_module(&rt, container.element(), "C", record(&recorder, "C"), false);

        a_out.port().connect_to(b_in.port()).unwrap();
        b_out.port().connect_to(c_in.port()).unwrap();
        c_out.port().connect_to(a_in.port()).unwrap();
        container.element().init().unwrap();

        let (order, warnings) = build(container.element(), &rt);
        assert_eq!(warnings.len(), 1);
        assert!(["A", "B", "C"]
            .iter()
            .any(|name| warnings[0].contains(&format!("/main/{name}"))));
        assert_eq!(order.len(), 3);
        for name in ["/main/A", "/main/B", "/main/C"] {
            assert_eq!(order.iter().filter(|n| n.as_str() == name).count(), 1);
        }
    }

    #[test]
    fn loop_executes_tasks_in_order_and_reports_cycle_time() {
        let rt = Runtime::new();
        let container = ThreadContainer::new(&rt, rt.root(), "main", Duration::from_millis(5))
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = counter.clone();

        let module = Element::new(
            &rt,
            container.element(),
            "tick",
            ElementFlags::EDGE_AGGREGATOR,
            ElementKind::Aggregator(AggregatorCell::new()),
        )
        .unwrap();
        PeriodicTask::attach(
            &module,
            PeriodicTask::new(
                Arc::new(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
                &[],
                &[&module],
                false,
            ),
        )
        .unwrap();
        container.element().init().unwrap();

        container.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        container.stop();

        assert!(counter.load(Ordering::SeqCst) >= 3);
        // The status port carries the previous cycle's duration.
        assert!(container.status_port().get() >= 0.0);
    }

    #[test]
    fn structural_changes_trigger_a_reschedule() {
        let rt = Runtime::new();
        let container = ThreadContainer::new(&rt, rt.root(), "main", Duration::from_millis(5))
            .unwrap();
        container.element().init().unwrap();
        container.start();

        // Added after the loop is already running.
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = counter.clone();
        let module = Element::new(
            &rt,
            container.element(),
            "late",
            ElementFlags::EDGE_AGGREGATOR,
            ElementKind::Aggregator(AggregatorCell::new()),
        )
        .unwrap();
        PeriodicTask::attach(
            &module,
            PeriodicTask::new(
                Arc::new(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
                &[],
                &[&module],
                false,
            ),
        )
        .unwrap();
        module.init().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        container.stop();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }
}
