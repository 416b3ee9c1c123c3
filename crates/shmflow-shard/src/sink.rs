//! Destination for reconstructed streams.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use shmflow_types::{FlowId, Seq, Side};

/// Receives the bytes a handler drains, in stream order per (flow, side).
///
/// Called only from handler threads; a given flow is always reported by the
/// same handler while it owns the flow.
pub trait StreamSink: Send + Sync {
    /// A handler took ownership of `flow`.
    fn flow_started(&self, _flow: FlowId, _initial_seq: Seq) {}

    /// Next contiguous bytes of one side, starting at `seq`.
    fn data(&self, flow: FlowId, side: Side, seq: Seq, bytes: &[u8]);

    /// Bytes `[expected, resumed_at)` were never stored and will not arrive.
    fn gap(&self, _flow: FlowId, _side: Side, _expected: Seq, _resumed_at: Seq) {}

    /// The flow went idle and its reader state was dropped.
    fn flow_expired(&self, _flow: FlowId) {}
}

/// A hole reported through [`StreamSink::gap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapEvent {
    pub flow: FlowId,
    pub side: Side,
    pub expected: Seq,
    pub resumed_at: Seq,
}

#[derive(Debug, Default)]
struct Collected {
    streams: HashMap<(FlowId, Side), Vec<u8>>,
    started: Vec<FlowId>,
    expired: Vec<FlowId>,
    gaps: Vec<GapEvent>,
}

/// In-memory sink. Clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes delivered so far for one side of `flow`.
    #[must_use]
    pub fn stream(&self, flow: FlowId, side: Side) -> Vec<u8> {
        self.inner
            .lock()
            .streams
            .get(&(flow, side))
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn started_flows(&self) -> Vec<FlowId> {
        self.inner.lock().started.clone()
    }

    #[must_use]
    pub fn expired_flows(&self) -> Vec<FlowId> {
        self.inner.lock().expired.clone()
    }

    #[must_use]
    pub fn gaps(&self) -> Vec<GapEvent> {
        self.inner.lock().gaps.clone()
    }

    /// Total bytes delivered across all flows.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().streams.values().map(Vec::len).sum()
    }
}

impl StreamSink for CollectingSink {
    fn flow_started(&self, flow: FlowId, _initial_seq: Seq) {
        self.inner.lock().started.push(flow);
    }

    fn data(&self, flow: FlowId, side: Side, _seq: Seq, bytes: &[u8]) {
        self.inner
            .lock()
            .streams
            .entry((flow, side))
            .or_default()
            .extend_from_slice(bytes);
    }

    fn gap(&self, flow: FlowId, side: Side, expected: Seq, resumed_at: Seq) {
        self.inner.lock().gaps.push(GapEvent {
            flow,
            side,
            expected,
            resumed_at,
        });
    }

    fn flow_expired(&self, flow: FlowId) {
        self.inner.lock().expired.push(flow);
    }
}
