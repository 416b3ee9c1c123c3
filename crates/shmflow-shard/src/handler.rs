//! Per-shard drain loop.
//!
//! A [`Handler`] owns a subset of flows. Each cycle it walks the store range
//! of every owned (flow, side), delivers ready blocks to its [`StreamSink`] in
//! sequence order and erases them. The distributor hands flows over through a
//! [`HandlerHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use shmflow_accum::{Accumulator, BlockKind, BlockRef, StoredBlock};
use shmflow_error::Result;
use shmflow_types::seq::{before, distance};
use shmflow_types::{Clock, Cx, FlowId, FlowKey, Micros, Seq, Side};
use tracing::{debug, info, trace, warn};

use crate::config::ShardConfig;
use crate::sink::StreamSink;

/// How far a re-announced flow's first sequence may sit from the read
/// position and still count as the same connection (16 MiB).
const CONTINUATION_WINDOW: u32 = 1 << 24;

/// Reader-side state of one owned flow.
#[derive(Debug, Clone)]
struct FlowContext {
    initial_seq: Seq,
    marker: BlockRef,
    last_consumed_seq: [Option<Seq>; 2],
    last_update_us: Micros,
    pending_blocks: usize,
    announced: bool,
}

impl FlowContext {
    fn from_marker(marker: &StoredBlock, now: Micros) -> Self {
        Self {
            initial_seq: marker.initial_seq().unwrap_or_else(|| marker.key().seq()),
            marker: marker.handle(),
            last_consumed_seq: [None; 2],
            last_update_us: now,
            pending_blocks: 0,
            announced: false,
        }
    }

    fn next_expected(&self, side: Side) -> Option<Seq> {
        self.last_consumed_seq[side.index()].map(|seq| seq.wrapping_add(1))
    }

    /// Whether `marker` re-announces this flow rather than a new one.
    ///
    /// Without a read position on the marker's side there is nothing to
    /// contradict, so the flow is taken as continued.
    fn continues_at(&self, marker: &StoredBlock) -> bool {
        let Some(expected) = self.next_expected(marker.side()) else {
            return true;
        };
        let seq = marker.initial_seq().unwrap_or_else(|| marker.key().seq());
        distance(seq, expected) <= CONTINUATION_WINDOW
            || distance(expected, seq) <= CONTINUATION_WINDOW
    }
}

#[derive(Debug)]
struct HandlerShared {
    id: usize,
    clock: Arc<dyn Clock>,
    flows: Mutex<HashMap<FlowId, FlowContext>>,
}

/// The distributor's view of a handler.
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    shared: Arc<HandlerShared>,
}

impl HandlerHandle {
    #[must_use]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Take ownership of the marker's flow. Returns `false` if already owned.
    pub fn push(&self, marker: &StoredBlock) -> bool {
        let flow = marker.flow();
        let mut flows = self.shared.flows.lock();
        if flows.contains_key(&flow) {
            return false;
        }
        let now = self.shared.clock.now_micros();
        flows.insert(flow, FlowContext::from_marker(marker, now));
        true
    }

    /// Whether the handler still holds reader state for `flow`.
    #[must_use]
    pub fn owns(&self, flow: FlowId) -> bool {
        self.shared.flows.lock().contains_key(&flow)
    }

    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.shared.flows.lock().len()
    }
}

/// Work done by one [`Handler::drain_cycle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub blocks: usize,
    pub bytes: usize,
    pub gaps: usize,
    pub expired: usize,
}

impl DrainStats {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.blocks == 0 && self.expired == 0
    }
}

pub struct Handler {
    shared: Arc<HandlerShared>,
    accum: Arc<Accumulator>,
    sink: Arc<dyn StreamSink>,
    flow_timeout_us: Micros,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.shared.id)
            .field("flow_timeout_us", &self.flow_timeout_us)
            .finish_non_exhaustive()
    }
}

impl Handler {
    #[must_use]
    pub fn new(
        id: usize,
        accum: Arc<Accumulator>,
        sink: Arc<dyn StreamSink>,
        config: &ShardConfig,
    ) -> Self {
        Self {
            shared: Arc::new(HandlerShared {
                id,
                clock: Arc::clone(accum.clock()),
                flows: Mutex::new(HashMap::new()),
            }),
            accum,
            sink,
            flow_timeout_us: config.flow_timeout_us,
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    #[must_use]
    pub fn handle(&self) -> HandlerHandle {
        HandlerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drain every owned flow once and expire idle ones.
    pub fn drain_cycle(&self) -> Result<DrainStats> {
        let owned: Vec<(FlowId, FlowContext)> = self
            .shared
            .flows
            .lock()
            .iter()
            .map(|(flow, ctx)| (*flow, ctx.clone()))
            .collect();

        let mut stats = DrainStats::default();
        let mut updated = Vec::with_capacity(owned.len());
        let mut expired = Vec::new();
        for (flow, mut ctx) in owned {
            let now = self.shared.clock.now_micros();
            self.drain_flow(flow, &mut ctx, now, &mut stats)?;
            let idle_us = now.saturating_sub(ctx.last_update_us);
            if ctx.pending_blocks == 0 && idle_us > self.flow_timeout_us {
                expired.push(flow);
            } else {
                updated.push((flow, ctx));
            }
        }

        {
            let mut flows = self.shared.flows.lock();
            for (flow, ctx) in updated {
                if let Some(slot) = flows.get_mut(&flow) {
                    *slot = ctx;
                }
            }
            for flow in &expired {
                flows.remove(flow);
            }
        }
        for flow in expired {
            info!(handler = self.id(), flow = %flow, "flow expired");
            self.sink.flow_expired(flow);
            stats.expired += 1;
        }
        Ok(stats)
    }

    fn drain_flow(
        &self,
        flow: FlowId,
        ctx: &mut FlowContext,
        now: Micros,
        stats: &mut DrainStats,
    ) -> Result<()> {
        let mut ranges = [Vec::new(), Vec::new()];
        for side in Side::BOTH {
            ranges[side.index()] = self.collect_range(flow, side)?;
        }

        // Markers first, oldest first. A writer re-announces a flow after its
        // own idle timeout; only a marker far from the read position means the
        // flow id was reused upstream.
        let mut markers: Vec<&StoredBlock> = ranges
            .iter()
            .flatten()
            .filter(|b| b.kind() == BlockKind::StartFlow && b.is_ready())
            .collect();
        markers.sort_by_key(|b| b.handle().generation());
        for marker in markers {
            if marker.handle() != ctx.marker {
                if ctx.continues_at(marker) {
                    trace!(
                        handler = self.id(),
                        flow = %flow,
                        initial_seq = ?marker.initial_seq(),
                        "flow re-announced"
                    );
                    ctx.marker = marker.handle();
                } else {
                    debug!(
                        handler = self.id(),
                        flow = %flow,
                        initial_seq = ?marker.initial_seq(),
                        "flow restarted"
                    );
                    *ctx = FlowContext::from_marker(marker, now);
                }
            }
            self.accum.erase(&marker.handle())?;
        }
        if !ctx.announced {
            self.sink.flow_started(flow, ctx.initial_seq);
            ctx.announced = true;
        }

        ctx.pending_blocks = 0;
        for side in Side::BOTH {
            let mut payload: Vec<StoredBlock> = std::mem::take(&mut ranges[side.index()])
                .into_iter()
                .filter(|b| b.kind().is_payload())
                .collect();
            let Some(anchor) = ctx
                .next_expected(side)
                .or_else(|| serial_min(payload.iter().map(|b| b.header().base_seq)))
            else {
                continue;
            };
            // Blocks behind the anchor first, so stale overlaps are trimmed
            // before newer bytes move the read position.
            payload.sort_by_key(|b| {
                let base = b.header().base_seq;
                (!before(base, anchor), distance(anchor, base), b.handle().generation())
            });

            let mut consumed = 0;
            for block in &payload {
                if !block.is_ready() {
                    break;
                }
                self.deliver(flow, side, ctx, block, stats);
                self.accum.erase(&block.handle())?;
                consumed += 1;
            }
            if consumed > 0 {
                ctx.last_update_us = now;
                stats.blocks += consumed;
            }
            ctx.pending_blocks += payload.len() - consumed;
        }
        Ok(())
    }

    /// Every entry of one (flow, side), in store order.
    fn collect_range(&self, flow: FlowId, side: Side) -> Result<Vec<StoredBlock>> {
        let mut out = Vec::new();
        let Some(mut block) = self
            .accum
            .lower_bound_block(FlowKey::range_start(flow, side))?
        else {
            return Ok(out);
        };
        while block.key().belongs_to(flow, side) {
            let handle = block.handle();
            out.push(block);
            match self.accum.next_block(&handle)? {
                // A smaller handle means the walk wrapped.
                Some(next) if next.handle() > handle => block = next,
                _ => break,
            }
        }
        Ok(out)
    }

    /// Hand one block's frames to the sink, dropping bytes already delivered.
    fn deliver(
        &self,
        flow: FlowId,
        side: Side,
        ctx: &mut FlowContext,
        block: &StoredBlock,
        stats: &mut DrainStats,
    ) {
        let mut expected = ctx.next_expected(side);
        for (mut seq, mut bytes) in block.segments() {
            if let Some(exp) = expected {
                if before(seq, exp) {
                    let stale = distance(seq, exp) as usize;
                    if stale >= bytes.len() {
                        trace!(flow = %flow, seq, len = bytes.len(), "stale frame skipped");
                        continue;
                    }
                    bytes = &bytes[stale..];
                    seq = exp;
                } else if seq != exp {
                    debug!(
                        handler = self.id(),
                        flow = %flow,
                        side = ?side,
                        expected = exp,
                        resumed_at = seq,
                        "gap in stream"
                    );
                    self.sink.gap(flow, side, exp, seq);
                    stats.gaps += 1;
                }
            }
            self.sink.data(flow, side, seq, bytes);
            stats.bytes += bytes.len();
            let end = advance(seq, bytes.len());
            expected = Some(end);
            ctx.last_consumed_seq[side.index()] = Some(end.wrapping_sub(1));
        }
        trace!(
            handler = self.id(),
            key = ?block.key(),
            used = block.header().used_len,
            "block drained"
        );
    }

    /// Drain until `cx` is cancelled.
    pub fn run(&self, cx: &Cx) -> Result<()> {
        info!(handler = self.id(), "handler started");
        while cx.checkpoint().is_ok() {
            match self.drain_cycle() {
                Ok(stats) if stats.is_idle() => thread::yield_now(),
                Ok(_) => {}
                Err(err) => warn!(handler = self.id(), error = %err, "drain cycle failed"),
            }
        }
        info!(handler = self.id(), "handler stopped");
        Ok(())
    }
}

/// Earliest sequence in serial-number order.
fn serial_min(seqs: impl Iterator<Item = Seq>) -> Option<Seq> {
    seqs.reduce(|min, seq| if before(seq, min) { seq } else { min })
}

#[allow(clippy::cast_possible_truncation)]
const fn advance(seq: Seq, by: usize) -> Seq {
    seq.wrapping_add(by as u32)
}
