//! The shared flow accumulator.
//!
//! Writers call [`Accumulator::put`] with decoded segments; readers in any
//! process attached to the same region drain completed blocks through
//! [`Accumulator::get`], [`Accumulator::lower_bound_block`],
//! [`Accumulator::next_block`] and [`Accumulator::erase`].
//!
//! Every operation runs under the region lock. Writer cursors and the `get`
//! rotation cursor are process-local and live behind `local`, which is always
//! locked before the region.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;
use shmflow_error::{Result, ShmflowError};
use shmflow_shm::ShmRegion;
use shmflow_types::seq::{before, distance, in_range};
use shmflow_types::{Clock, FlowId, FlowKey, Micros, Segment, Seq, Side, SystemClock};
use tracing::{debug, info, trace, warn};

use crate::block::{BlockHeader, BlockKind, BlockSegments, PushCode, SequenceGate, ISN_PREFIX_LEN};
use crate::config::StoreConfig;
use crate::index::{BlockRef, IndexEntry};
use crate::layout::StoreLayout;
use crate::store::LockedStore;

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// What `put` did with a segment.
///
/// When a segment is split across several blocks the first stored piece
/// determines the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PutOutcome {
    /// Appended to the side's open block.
    Appended,
    /// Appended to an earlier, still writable block that it abuts.
    Backfilled,
    /// Stored in a newly allocated block.
    NewBlock,
    /// Every byte was already stored; nothing written.
    Retransmission,
    /// Zero-length payload; only flow bookkeeping was done.
    Empty,
    /// Not stored (store full or block rejected the frame).
    Dropped,
}

impl PutOutcome {
    /// Whether any new bytes were stored.
    #[must_use]
    pub const fn stored(self) -> bool {
        matches!(self, Self::Appended | Self::Backfilled | Self::NewBlock)
    }
}

/// A copy of one stored block, taken under the region lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    handle: BlockRef,
    header: BlockHeader,
    payload: Vec<u8>,
    ready: bool,
}

impl StoredBlock {
    #[must_use]
    pub const fn handle(&self) -> BlockRef {
        self.handle
    }

    #[must_use]
    pub const fn key(&self) -> FlowKey {
        self.handle.key()
    }

    #[must_use]
    pub const fn flow(&self) -> FlowId {
        self.handle.key().flow()
    }

    #[must_use]
    pub const fn side(&self) -> Side {
        self.handle.key().side()
    }

    #[must_use]
    pub const fn kind(&self) -> BlockKind {
        self.header.kind
    }

    #[must_use]
    pub const fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Complete and past its grace window when the snapshot was taken.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Used part of the payload area, prefix included.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Initial sequence number carried in the payload prefix.
    #[must_use]
    pub fn initial_seq(&self) -> Option<Seq> {
        let prefix = self.payload.get(..ISN_PREFIX_LEN)?;
        Some(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]))
    }

    /// The `(seq, bytes)` frames stored in this block.
    #[must_use]
    pub fn segments(&self) -> BlockSegments<'_> {
        BlockSegments::new(&self.payload, self.header.base_seq)
    }

    /// Total stream bytes held.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.segments().map(|(_, bytes)| bytes.len()).sum()
    }
}

/// Store occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: u32,
    pub free_slots: u32,
    pub max_blocks: u32,
    pub block_capacity: u32,
    /// Flows with a writer cursor in this process.
    pub writer_flows: usize,
}

// ---------------------------------------------------------------------------
// Process-local writer state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct SideCursor {
    initial_seq: Option<Seq>,
    open_block: Option<BlockRef>,
}

#[derive(Debug, Clone)]
struct ActiveFlowContext {
    created_us: Micros,
    last_write_us: Micros,
    sides: [SideCursor; 2],
}

impl ActiveFlowContext {
    fn new(now: Micros) -> Self {
        Self {
            created_us: now,
            last_write_us: now,
            sides: [SideCursor::default(); 2],
        }
    }

    const fn is_stale(&self, now: Micros, timeout_us: Micros) -> bool {
        now.saturating_sub(self.last_write_us) > timeout_us
    }
}

#[derive(Debug, Default)]
struct LocalState {
    flows: HashMap<FlowId, ActiveFlowContext>,
    read_cursor: Option<BlockRef>,
}

/// How one piece of a segment was handled.
#[derive(Debug, Clone, Copy)]
struct Placement {
    consumed: usize,
    outcome: PutOutcome,
}

impl Placement {
    const fn new(consumed: usize, outcome: PutOutcome) -> Self {
        Self { consumed, outcome }
    }
}

/// Identifies the piece being placed.
#[derive(Debug, Clone, Copy)]
struct Piece {
    flow: FlowId,
    side: Side,
    seq: Seq,
    isn: Seq,
    now: Micros,
}

impl Piece {
    const fn key(&self) -> FlowKey {
        FlowKey::new(self.flow, self.side, self.seq)
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Ordered block store shared by every process attached to its region.
pub struct Accumulator {
    region: ShmRegion,
    layout: StoreLayout,
    config: StoreConfig,
    gate: SequenceGate,
    clock: Arc<dyn Clock>,
    local: Mutex<LocalState>,
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("region_len", &self.region.len())
            .field("layout", &self.layout)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Accumulator {
    /// Region length needed for `config`.
    pub fn required_region_len(config: &StoreConfig) -> Result<usize> {
        StoreLayout::new(config.block_capacity, config.max_blocks)?.required_len()
    }

    /// Format `region` as an empty store. Existing contents are discarded.
    pub fn create(region: ShmRegion, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = StoreLayout::new(config.block_capacity, config.max_blocks)?;
        layout.format(&mut region.lock()?)?;
        info!(
            block_capacity = config.block_capacity,
            max_blocks = config.max_blocks,
            region_len = region.len(),
            "formatted flow store"
        );
        Ok(Self::from_parts(region, layout, config))
    }

    /// Attach to a store formatted by another handle or process.
    ///
    /// Geometry comes from the region header; only the timing fields of
    /// `config` are used.
    pub fn attach(region: ShmRegion, config: StoreConfig) -> Result<Self> {
        let layout = StoreLayout::attach(&region.lock()?)?;
        if layout.block_capacity() != config.block_capacity
            || layout.max_blocks() != config.max_blocks
        {
            debug!(
                header_capacity = layout.block_capacity(),
                header_blocks = layout.max_blocks(),
                "attached store geometry differs from configuration; using header"
            );
        }
        let config = StoreConfig {
            block_capacity: layout.block_capacity(),
            max_blocks: layout.max_blocks(),
            ..config
        };
        config.validate()?;
        info!(
            block_capacity = config.block_capacity,
            max_blocks = config.max_blocks,
            "attached to flow store"
        );
        Ok(Self::from_parts(region, layout, config))
    }

    /// A store in a private heap region.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        let region = ShmRegion::heap(Self::required_region_len(&config)?);
        Self::create(region, config)
    }

    fn from_parts(region: ShmRegion, layout: StoreLayout, config: StoreConfig) -> Self {
        Self {
            region,
            gate: SequenceGate::new(layout.block_capacity() as usize),
            layout,
            config,
            clock: Arc::new(SystemClock),
            local: Mutex::new(LocalState::default()),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub const fn region(&self) -> &ShmRegion {
        &self.region
    }

    fn lock_store(&self) -> Result<LockedStore<'_>> {
        LockedStore::lock(&self.region, &self.layout)
    }

    fn idle_us(&self) -> Micros {
        self.config.block_idle_timeout_us
    }

    fn snapshot(
        &self,
        store: &LockedStore<'_>,
        entry: IndexEntry,
        header: BlockHeader,
        now: Micros,
    ) -> Result<StoredBlock> {
        Ok(StoredBlock {
            handle: entry.block_ref(),
            payload: store.payload(entry.slot, header.used())?,
            ready: header.is_ready(now, self.idle_us()),
            header,
        })
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Store a segment.
    ///
    /// The first segment of a flow also records a StartFlow marker. Store
    /// exhaustion and rejected frames are logged and reported as
    /// [`PutOutcome::Dropped`]; only region failures are errors.
    pub fn put(&self, segment: &Segment) -> Result<PutOutcome> {
        let now = self.clock.now_micros();
        let mut local = self.local.lock();
        let mut store = self.lock_store()?;
        self.put_locked(&mut local, &mut store, segment, now)
    }

    fn put_locked(
        &self,
        local: &mut LocalState,
        store: &mut LockedStore<'_>,
        segment: &Segment,
        now: Micros,
    ) -> Result<PutOutcome> {
        let flow = segment.flow;
        let timeout = self.config.writer_flow_timeout_us;
        let ctx = match local.flows.entry(flow) {
            Entry::Occupied(entry) if !entry.get().is_stale(now, timeout) => entry.into_mut(),
            entry => {
                match store.insert_block(
                    BlockKind::StartFlow,
                    segment.key(),
                    &segment.sequence.to_le_bytes(),
                    true,
                    now,
                ) {
                    Ok(_) => {}
                    Err(ShmflowError::StoreFull { max_blocks }) => {
                        warn!(flow = %flow, max_blocks, "store full; flow start dropped");
                        return Ok(PutOutcome::Dropped);
                    }
                    Err(e) => return Err(e),
                }
                debug!(
                    flow = %flow,
                    side = ?segment.side,
                    seq = segment.sequence,
                    "flow started"
                );
                match entry {
                    Entry::Occupied(mut stale) => {
                        stale.insert(ActiveFlowContext::new(now));
                        stale.into_mut()
                    }
                    Entry::Vacant(vacant) => vacant.insert(ActiveFlowContext::new(now)),
                }
            }
        };
        ctx.last_write_us = now;

        if segment.payload.is_empty() {
            return Ok(PutOutcome::Empty);
        }

        let cursor = &mut ctx.sides[segment.side.index()];
        let isn = *cursor.initial_seq.get_or_insert(segment.sequence);

        let mut piece = Piece {
            flow,
            side: segment.side,
            seq: segment.sequence,
            isn,
            now,
        };
        let mut rest: &[u8] = &segment.payload;
        let mut stored = None;
        let mut duplicate = false;
        while !rest.is_empty() {
            let placed = self.place_piece(store, cursor, &piece, rest)?;
            match placed.outcome {
                PutOutcome::Dropped => return Ok(stored.unwrap_or(PutOutcome::Dropped)),
                PutOutcome::Retransmission => duplicate = true,
                outcome => {
                    stored.get_or_insert(outcome);
                }
            }
            piece.seq = advance(piece.seq, placed.consumed);
            rest = &rest[placed.consumed..];
        }

        Ok(stored.unwrap_or(if duplicate {
            PutOutcome::Retransmission
        } else {
            PutOutcome::Dropped
        }))
    }

    /// Place the longest prefix of `data` that fits without crossing an
    /// existing block. Always consumes at least one byte.
    fn place_piece(
        &self,
        store: &mut LockedStore<'_>,
        cursor: &mut SideCursor,
        piece: &Piece,
        data: &[u8],
    ) -> Result<Placement> {
        let (seq, now) = (piece.seq, piece.now);

        // Re-resolve the open block; forget it once it can no longer grow.
        let mut open = None;
        if let Some(handle) = cursor.open_block {
            match store.resolve(&handle)? {
                None => cursor.open_block = None,
                Some((_, entry)) => {
                    let mut header = store.header(entry.slot)?;
                    if header.is_complete || header.expired(now, self.idle_us()) {
                        if !header.is_complete {
                            header.close();
                            store.set_header(entry.slot, &header)?;
                        }
                        debug!(key = ?handle.key(), used = header.used_len, "open block closed");
                        cursor.open_block = None;
                    } else {
                        open = Some((handle, entry.slot, header));
                    }
                }
            }
        }

        let mut len = data.len().min(self.gate.max_segment_len());
        if let Some(next) = successor_start(store, piece.flow, piece.side, seq)? {
            len = len.min(distance(seq, next) as usize);
        }
        let bytes = &data[..len];

        // Fast path: continue the open block.
        if let Some((handle, slot, mut header)) = open {
            if !header.has_data || header.end_seq() == seq {
                let code = self
                    .gate
                    .push(Some(&mut header), &mut store.writer(slot), bytes, seq, now)?;
                match code {
                    PushCode::Ok => {
                        store.set_header(slot, &header)?;
                        trace!(key = ?handle.key(), seq, len, "appended to open block");
                        return Ok(Placement::new(len, PutOutcome::Appended));
                    }
                    PushCode::NoSpace | PushCode::BlockClosed => {
                        store.set_header(slot, &header)?;
                        cursor.open_block = None;
                        debug!(key = ?handle.key(), used = header.used_len, "open block full");
                        return self.store_in_new_block(store, cursor, piece, bytes);
                    }
                    PushCode::InconsistentSeq => {}
                    PushCode::NoBlock | PushCode::PushError => {
                        warn!(key = ?handle.key(), seq, len, ?code, "segment rejected; dropped");
                        return Ok(Placement::new(len, PutOutcome::Dropped));
                    }
                }
            }
        }

        // Backward search: the nearest earlier payload block decides.
        if let Some((pred, slot, mut header)) = predecessor(store, piece.flow, piece.side, seq)? {
            let (start, end) = (header.base_seq, header.end_seq());
            if in_range(seq, start, end) {
                let covered = distance(seq, end) as usize;
                if covered >= len {
                    trace!(key = ?piece.key(), len, "retransmission dropped");
                    return Ok(Placement::new(len, PutOutcome::Retransmission));
                }
                trace!(key = ?piece.key(), covered, "overlap trimmed");
                return Ok(Placement::new(covered, PutOutcome::Retransmission));
            }
            if end == seq
                && !header.is_complete
                && !header.expired(now, self.idle_us())
                && header.has_room(len, self.gate.capacity())
            {
                let code = self
                    .gate
                    .push(Some(&mut header), &mut store.writer(slot), bytes, seq, now)?;
                if code == PushCode::Ok {
                    store.set_header(slot, &header)?;
                    let outcome = if cursor.open_block == Some(pred) {
                        PutOutcome::Appended
                    } else {
                        PutOutcome::Backfilled
                    };
                    trace!(key = ?pred.key(), seq, len, ?outcome, "appended to earlier block");
                    return Ok(Placement::new(len, outcome));
                }
            }
        }

        self.store_in_new_block(store, cursor, piece, bytes)
    }

    fn store_in_new_block(
        &self,
        store: &mut LockedStore<'_>,
        cursor: &mut SideCursor,
        piece: &Piece,
        bytes: &[u8],
    ) -> Result<Placement> {
        let len = bytes.len();
        let key = piece.key();
        let entry = match store.insert_block(
            BlockKind::L4Payload,
            key,
            &piece.isn.to_le_bytes(),
            false,
            piece.now,
        ) {
            Ok(entry) => entry,
            Err(ShmflowError::StoreFull { max_blocks }) => {
                warn!(key = ?key, len, max_blocks, "store full; segment dropped");
                return Ok(Placement::new(len, PutOutcome::Dropped));
            }
            Err(e) => return Err(e),
        };

        let mut header = store.header(entry.slot)?;
        let code = self.gate.push(
            Some(&mut header),
            &mut store.writer(entry.slot),
            bytes,
            piece.seq,
            piece.now,
        )?;
        if code != PushCode::Ok {
            warn!(key = ?key, len, ?code, "fresh block rejected segment; dropped");
            if let Some((pos, _)) = store.resolve(&entry.block_ref())? {
                store.remove_at(pos)?;
            }
            return Ok(Placement::new(len, PutOutcome::Dropped));
        }
        store.set_header(entry.slot, &header)?;
        debug!(key = ?key, generation = entry.generation, len, "block opened");

        // Blocks behind the frontier stay out of the cursor; the sweep closes them.
        let becomes_open = match cursor.open_block {
            None => true,
            Some(open) => match store.resolve(&open)? {
                None => true,
                Some((_, open_entry)) => {
                    !before(piece.seq, store.header(open_entry.slot)?.end_seq())
                }
            },
        };
        if becomes_open {
            cursor.open_block = Some(entry.block_ref());
        }
        Ok(Placement::new(len, PutOutcome::NewBlock))
    }

    /// Forget the writer cursor of `flow`. Its next segment starts a new flow.
    pub fn remove_flow(&self, flow: FlowId) -> bool {
        self.local.lock().flows.remove(&flow).is_some()
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Next drainable StartFlow marker, rotating through the whole store.
    ///
    /// Examines at most one full cycle. Returns the same marker again on a
    /// later call until someone erases it.
    pub fn get(&self) -> Result<Option<StoredBlock>> {
        let now = self.clock.now_micros();
        let mut local = self.local.lock();
        let store = self.lock_store()?;
        let count = store.len();
        if count == 0 {
            return Ok(None);
        }

        let start = match local.read_cursor {
            Some(cursor) => store.upper_bound(cursor.key(), cursor.generation())? % count,
            None => 0,
        };
        for step in 0..count {
            let entry = store.entry((start + step) % count)?;
            local.read_cursor = Some(entry.block_ref());
            let header = store.header(entry.slot)?;
            if header.kind == BlockKind::StartFlow && header.is_ready(now, self.idle_us()) {
                return self.snapshot(&store, entry, header, now).map(Some);
            }
        }
        Ok(None)
    }

    /// First block with a key at or after `key`, wrapping to the first block.
    pub fn lower_bound_block(&self, key: FlowKey) -> Result<Option<StoredBlock>> {
        let now = self.clock.now_micros();
        let store = self.lock_store()?;
        if store.is_empty() {
            return Ok(None);
        }
        let pos = store.lower_bound(key, 0)? % store.len();
        let entry = store.entry(pos)?;
        let header = store.header(entry.slot)?;
        self.snapshot(&store, entry, header, now).map(Some)
    }

    /// Block immediately after `handle` in store order, wrapping.
    ///
    /// `handle` need not still exist. Returns `None` for an empty store or
    /// when `handle` is the only block.
    pub fn next_block(&self, handle: &BlockRef) -> Result<Option<StoredBlock>> {
        let now = self.clock.now_micros();
        let store = self.lock_store()?;
        let count = store.len();
        if count == 0 {
            return Ok(None);
        }
        let pos = store.upper_bound(handle.key(), handle.generation())? % count;
        let entry = store.entry(pos)?;
        if entry.block_ref() == *handle {
            return Ok(None);
        }
        let header = store.header(entry.slot)?;
        self.snapshot(&store, entry, header, now).map(Some)
    }

    /// Remove a block and free its slot. Returns `false` if already gone.
    pub fn erase(&self, handle: &BlockRef) -> Result<bool> {
        let mut store = self.lock_store()?;
        let Some((pos, _)) = store.resolve(handle)? else {
            return Ok(false);
        };
        store.remove_at(pos)?;
        trace!(key = ?handle.key(), generation = handle.generation(), "block erased");
        Ok(true)
    }

    /// Close every open block idle past the threshold.
    ///
    /// Closing refreshes the timestamp, so a block closed here becomes
    /// drainable only one grace window later. Also drops writer cursors idle
    /// past the writer flow timeout. Returns the number of blocks closed.
    pub fn mark_expired_blocks(&self) -> Result<usize> {
        let now = self.clock.now_micros();
        let mut local = self.local.lock();
        let mut store = self.lock_store()?;

        let mut closed = 0;
        for pos in 0..store.len() {
            let entry = store.entry(pos)?;
            let mut header = store.header(entry.slot)?;
            if !header.is_complete && header.expired(now, self.idle_us()) {
                header.close();
                header.last_update_us = now;
                store.set_header(entry.slot, &header)?;
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "closed idle blocks");
        }

        let timeout = self.config.writer_flow_timeout_us;
        local.flows.retain(|flow, ctx| {
            let keep = !ctx.is_stale(now, timeout);
            if !keep {
                debug!(
                    flow = %flow,
                    age_us = now.saturating_sub(ctx.created_us),
                    "writer flow reaped"
                );
            }
            keep
        });
        Ok(closed)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let writer_flows = self.local.lock().flows.len();
        let store = self.lock_store()?;
        let entries = store.counters().entry_count;
        Ok(StoreStats {
            entries,
            free_slots: self.layout.max_blocks() - entries,
            max_blocks: self.layout.max_blocks(),
            block_capacity: self.layout.block_capacity(),
            writer_flows,
        })
    }
}

// ---------------------------------------------------------------------------
// Range scans
// ---------------------------------------------------------------------------

/// Start of the nearest payload block of (flow, side) strictly after
/// `seq`, searching forward and wrapping to the start of the range.
fn successor_start(
    store: &LockedStore<'_>,
    flow: FlowId,
    side: Side,
    seq: Seq,
) -> Result<Option<Seq>> {
    let begin = store.lower_bound(FlowKey::range_start(flow, side), 0)?;
    let end = store.upper_bound(FlowKey::range_end(flow, side), u64::MAX)?;
    let from = store.upper_bound(FlowKey::new(flow, side, seq), u64::MAX)?;
    for pos in (from..end).chain(begin..from) {
        let entry = store.entry(pos)?;
        if entry.key.seq() == seq {
            continue;
        }
        if store.header(entry.slot)?.kind.is_payload() {
            return Ok(Some(entry.key.seq()));
        }
    }
    Ok(None)
}

/// Nearest payload block of (flow, side) starting at or before `seq`.
///
/// Walks backward from `seq`; when the range is exhausted it re-anchors
/// once at the top of the sequence space so blocks from before a
/// wraparound are found.
fn predecessor(
    store: &LockedStore<'_>,
    flow: FlowId,
    side: Side,
    seq: Seq,
) -> Result<Option<(BlockRef, u32, BlockHeader)>> {
    let begin = store.lower_bound(FlowKey::range_start(flow, side), 0)?;
    let end = store.upper_bound(FlowKey::range_end(flow, side), u64::MAX)?;
    let upto = store.upper_bound(FlowKey::new(flow, side, seq), u64::MAX)?;
    for pos in (begin..upto).rev().chain((upto..end).rev()) {
        let entry = store.entry(pos)?;
        let header = store.header(entry.slot)?;
        if header.kind.is_payload() {
            return Ok(Some((entry.block_ref(), entry.slot, header)));
        }
    }
    Ok(None)
}

#[allow(clippy::cast_possible_truncation)]
const fn advance(seq: Seq, by: usize) -> Seq {
    seq.wrapping_add(by as u32)
}
