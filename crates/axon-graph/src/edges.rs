//! Edge aggregation.
//!
//! Edge aggregators are the interface parents of ports. All port-level
//! edges between the same pair of aggregators are mirrored onto one
//! aggregated edge owned by the source aggregator; the scheduler
//! traces these instead of individual port edges. Aggregated edges
//! also carry publish telemetry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;

use crate::element::{Element, ElementFlags};

/// Summary of all port-level edges between two edge aggregators.
pub struct AggregatedEdge {
    source: Weak<Element>,
    destination: Weak<Element>,
    data_flow_edges: AtomicUsize,
    control_flow_edges: AtomicUsize,
    created: Instant,
    publish_count: AtomicU64,
    publish_size: AtomicU64,
}

impl AggregatedEdge {
    fn new(source: &Arc<Element>, destination: &Arc<Element>) -> Self {
        Self {
            source: Arc::downgrade(source),
            destination: Arc::downgrade(destination),
            data_flow_edges: AtomicUsize::new(0),
            control_flow_edges: AtomicUsize::new(0),
            created: Instant::now(),
            publish_count: AtomicU64::new(0),
            publish_size: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> Option<Arc<Element>> {
        self.source.upgrade()
    }

    pub fn destination(&self) -> Option<Arc<Element>> {
        self.destination.upgrade()
    }

    fn count_cell(&self, data_flow: bool) -> &AtomicUsize {
        if data_flow {
            &self.data_flow_edges
        } else {
            &self.control_flow_edges
        }
    }

    pub fn data_flow_edge_count(&self) -> usize {
        self.data_flow_edges.load(Ordering::Relaxed)
    }

    pub fn control_flow_edge_count(&self) -> usize {
        self.control_flow_edges.load(Ordering::Relaxed)
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    pub fn publish_size(&self) -> u64 {
        self.publish_size.load(Ordering::Relaxed)
    }

    pub(crate) fn record_publish(&self, size: usize) {
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        self.publish_size.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Average bytes transferred over this edge per second.
    pub fn data_rate(&self) -> f64 {
        let secs = self.created.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.publish_size() as f64 / secs
        }
    }

    /// Average publishes over this edge per second.
    pub fn publish_rate(&self) -> f64 {
        let secs = self.created.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.publish_count() as f64 / secs
        }
    }
}

impl std::fmt::Debug for AggregatedEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let src = self.source().map(|e| e.qualified_name()).unwrap_or_default();
        let dst = self
            .destination()
            .map(|e| e.qualified_name())
            .unwrap_or_default();
        write!(f, "AggregatedEdge({} -> {})", src, dst)
    }
}

/// Payload of an edge-aggregator element: its outgoing aggregated
/// edges.
#[derive(Debug, Default)]
pub struct AggregatorCell {
    emerging: RwLock<Vec<Arc<AggregatedEdge>>>,
}

impl AggregatorCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the outgoing aggregated edges.
    pub fn emerging_edges(&self) -> Vec<Arc<AggregatedEdge>> {
        self.emerging.read().clone()
    }

    fn find_to(&self, destination: &Arc<Element>) -> Option<Arc<AggregatedEdge>> {
        self.emerging
            .read()
            .iter()
            .find(|e| {
                e.destination()
                    .map(|d| Arc::ptr_eq(&d, destination))
                    .unwrap_or(false)
            })
            .cloned()
    }
}

/// Nearest ancestor carrying the EDGE_AGGREGATOR flag.
pub(crate) fn nearest_aggregator(element: &Arc<Element>) -> Option<Arc<Element>> {
    let mut cur = element.parent();
    while let Some(el) = cur {
        if el.get_flag(ElementFlags::EDGE_AGGREGATOR) {
            return Some(el);
        }
        cur = el.parent();
    }
    None
}

/// Mirror a new port-level edge onto the aggregated edge between the
/// two ports' aggregators. Called under the registry lock.
pub(crate) fn edge_added(source: &Arc<Element>, target: &Arc<Element>, data_flow: bool) {
    let (Some(src_agg), Some(dst_agg)) = (nearest_aggregator(source), nearest_aggregator(target))
    else {
        return;
    };
    if Arc::ptr_eq(&src_agg, &dst_agg) {
        return;
    }
    let Some(cell) = src_agg.aggregator() else {
        return;
    };
    let edge = match cell.find_to(&dst_agg) {
        Some(edge) => edge,
        None => {
            let edge = Arc::new(AggregatedEdge::new(&src_agg, &dst_agg));
            cell.emerging.write().push(edge.clone());
            edge
        }
    };
    edge.count_cell(data_flow).fetch_add(1, Ordering::Relaxed);
}

/// Drop one mirrored port-level edge; removing the last one deletes
/// the aggregated edge. Called under the registry lock.
pub(crate) fn edge_removed(source: &Arc<Element>, target: &Arc<Element>, data_flow: bool) {
    let (Some(src_agg), Some(dst_agg)) = (nearest_aggregator(source), nearest_aggregator(target))
    else {
        return;
    };
    let Some(cell) = src_agg.aggregator() else {
        return;
    };
    let Some(edge) = cell.find_to(&dst_agg) else {
        return;
    };
    edge.count_cell(data_flow).fetch_sub(1, Ordering::Relaxed);
    if edge.data_flow_edge_count() == 0 && edge.control_flow_edge_count() == 0 {
        cell.emerging.write().retain(|e| !Arc::ptr_eq(e, &edge));
    }
}

/// Update publish telemetry for one port-level delivery.
pub(crate) fn update_statistics(source: &Arc<Element>, target: &Arc<Element>, size: usize) {
    let (Some(src_agg), Some(dst_agg)) = (nearest_aggregator(source), nearest_aggregator(target))
    else {
        return;
    };
    if let Some(edge) = src_agg.aggregator().and_then(|c| c.find_to(&dst_agg)) {
        edge.record_publish(size);
    }
}
