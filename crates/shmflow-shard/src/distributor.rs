//! New-flow discovery and shard assignment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use shmflow_accum::{Accumulator, StoredBlock};
use shmflow_error::{Result, ShmflowError};
use shmflow_types::{Cx, FlowId, Micros};
use tracing::{debug, info, warn};

use crate::config::ShardConfig;
use crate::handler::HandlerHandle;

/// What one [`Distributor::poll`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// `false` when the call fell inside the idle-check interval.
    pub ran: bool,
    pub blocks_closed: usize,
    pub assigned: usize,
    pub reassigned: usize,
    pub released: usize,
}

/// Assigns each newly observed flow to one handler, round robin.
pub struct Distributor {
    accum: Arc<Accumulator>,
    handlers: Vec<HandlerHandle>,
    config: ShardConfig,
    assignments: HashMap<FlowId, usize>,
    next: usize,
    last_poll_us: Option<Micros>,
    last_sweep_us: Option<Micros>,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("handlers", &self.handlers.len())
            .field("assignments", &self.assignments.len())
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl Distributor {
    pub fn new(
        accum: Arc<Accumulator>,
        handlers: Vec<HandlerHandle>,
        config: ShardConfig,
    ) -> Result<Self> {
        if handlers.is_empty() {
            return Err(ShmflowError::invalid_config(
                "distributor needs at least one handler",
            ));
        }
        Ok(Self {
            accum,
            handlers,
            config,
            assignments: HashMap::new(),
            next: 0,
            last_poll_us: None,
            last_sweep_us: None,
        })
    }

    /// Handler index currently assigned to `flow`.
    #[must_use]
    pub fn assignment(&self, flow: FlowId) -> Option<usize> {
        self.assignments.get(&flow).copied()
    }

    #[must_use]
    pub fn assigned_flows(&self) -> usize {
        self.assignments.len()
    }

    /// One distributor cycle. Returns immediately if the previous cycle ran
    /// less than the idle-check interval ago.
    pub fn poll(&mut self) -> Result<PollStats> {
        let now = self.accum.clock().now_micros();
        if let Some(last) = self.last_poll_us {
            if now.saturating_sub(last) < self.config.idle_check_interval_us {
                return Ok(PollStats::default());
            }
        }
        self.last_poll_us = Some(now);

        let mut stats = PollStats {
            ran: true,
            blocks_closed: self.accum.mark_expired_blocks()?,
            ..PollStats::default()
        };

        let mut seen = HashSet::new();
        while let Some(marker) = self.accum.get()? {
            if !seen.insert(marker.handle()) {
                break;
            }
            self.route(&marker, &mut stats);
        }

        let last_sweep = *self.last_sweep_us.get_or_insert(now);
        if now.saturating_sub(last_sweep) >= self.config.assignment_sweep_interval_us {
            stats.released = self.sweep();
            self.last_sweep_us = Some(now);
        }
        Ok(stats)
    }

    fn route(&mut self, marker: &StoredBlock, stats: &mut PollStats) {
        let flow = marker.flow();
        let previous = match self.assignments.get(&flow) {
            Some(&idx) if self.handlers[idx].owns(flow) => return,
            Some(&idx) => Some(idx),
            None => None,
        };

        let idx = self.next % self.handlers.len();
        self.next = self.next.wrapping_add(1);
        self.handlers[idx].push(marker);
        self.assignments.insert(flow, idx);
        if let Some(previous) = previous {
            info!(flow = %flow, from = previous, to = idx, "flow reassigned");
            stats.reassigned += 1;
        } else {
            info!(
                flow = %flow,
                handler = idx,
                initial_seq = ?marker.initial_seq(),
                "flow assigned"
            );
            stats.assigned += 1;
        }
    }

    /// Drop assignments whose handler has expired the flow.
    fn sweep(&mut self) -> usize {
        let handlers = &self.handlers;
        let before = self.assignments.len();
        self.assignments.retain(|flow, idx| {
            let owned = handlers[*idx].owns(*flow);
            if !owned {
                debug!(flow = %flow, handler = *idx, "assignment released");
            }
            owned
        });
        before - self.assignments.len()
    }

    /// Poll until `cx` is cancelled.
    pub fn run(&mut self, cx: &Cx) -> Result<()> {
        info!(handlers = self.handlers.len(), "distributor started");
        while cx.checkpoint().is_ok() {
            match self.poll() {
                Ok(stats) if !stats.ran => thread::yield_now(),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "distributor poll failed"),
            }
        }
        info!(assigned = self.assignments.len(), "distributor stopped");
        Ok(())
    }
}
