use crate::config::{Config, SchedulingOption, SchedulingOptions};
use crate::fifo::Fifo;
use crate::hazard::BusMask;
use crate::instruction::{Direction, Space, TransferOp};
use crate::register::{LaneValues, Register, NUM_SLOTS};
use crate::regfile::{RegFile, StoreAccess, StorePort};
use crate::workgroup::Workgroup;
use crate::xlat::Descriptor;
use console::style;

/// Transfer between the register file of a slot and an external store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub slot: usize,
    pub pc: usize,
    pub op: TransferOp,
    /// Vector row moved by the transfer.
    pub row: usize,
    /// Vector row holding the per-lane indices of an indexed transfer.
    pub index_row: Option<usize>,
    pub buffer: Descriptor,
    pub workgroup: Workgroup,
}

impl std::fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {:?} v{} slot {} buffer {} ({} warps)",
            self.op.space,
            self.op.direction,
            self.row,
            self.slot,
            self.buffer,
            self.workgroup.last_warp + 1
        )
    }
}

/// Completion of a transfer, sent back to the compute clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionNotice {
    pub slot: usize,
    pub space: Space,
    /// Retire the workgroup of the slot.
    pub retire: bool,
}

/// Cross-clock hand-off queues of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    /// Compute to external-memory clock.
    pub requests: Fifo<TransferRequest>,
    /// External-memory to compute clock.
    pub completions: Fifo<CompletionNotice>,
}

impl Handoff {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            requests: Fifo::new(Some(size)),
            completions: Fifo::new(Some(size)),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.completions.is_empty()
    }
}

/// Cluster side of the external-memory clock domain.
#[derive(Debug)]
pub struct ClusterPort<'a> {
    pub cluster_id: usize,
    pub handoff: &'a mut Handoff,
    pub regfile: &'a mut RegFile,
}

/// External memory subsystem.
///
/// Driven on the external-memory clock. Pops transfer requests, moves the
/// data through the external-store ports of the register file and posts
/// completion notices.
pub trait TransferEngine: std::fmt::Debug + Send + 'static {
    fn cycle(&mut self, cycle: u64, options: SchedulingOptions, port: ClusterPort<'_>);

    /// No transfer in flight.
    #[must_use]
    fn is_idle(&self) -> bool;

    /// Active memory cycles per space.
    #[must_use]
    fn stats(&self) -> stats::Units;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Next warp to transfer.
    Data { next_col: usize },
    /// Remaining latency.
    Latency(usize),
    /// Waiting for room in the completion queue.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Transfer {
    request: TransferRequest,
    phase: Phase,
}

#[derive(Debug, Clone, Default)]
struct ClusterState {
    bulk: Option<Transfer>,
    scratchpad: [Option<Transfer>; NUM_SLOTS],
    scratchpad_memory: Vec<u32>,
}

impl ClusterState {
    fn scratchpad_busy(&self) -> bool {
        self.scratchpad.iter().any(Option::is_some)
    }
}

/// Fixed latency memory model backed by flat word arrays.
///
/// Bulk memory is shared by all clusters, every cluster has a private
/// scratchpad.
#[derive(Debug, Clone)]
pub struct FixedLatency {
    bulk_memory: Vec<u32>,
    clusters: Vec<ClusterState>,
    lanes: usize,
    bulk_bus_width: usize,
    scratchpad_bus_width: usize,
    bulk_latency: usize,
    scratchpad_latency: usize,
    stats: stats::Units,
}

impl FixedLatency {
    #[must_use]
    pub fn new(config: &Config, bulk_words: usize, scratchpad_words: usize) -> Self {
        let cluster = ClusterState {
            scratchpad_memory: vec![0; scratchpad_words],
            ..ClusterState::default()
        };
        Self {
            bulk_memory: vec![0; bulk_words],
            clusters: vec![cluster; config.num_clusters],
            lanes: config.lanes,
            bulk_bus_width: config.bulk_bus_width,
            scratchpad_bus_width: config.scratchpad_bus_width,
            bulk_latency: config.bulk_latency,
            scratchpad_latency: config.scratchpad_latency,
            stats: stats::Units::default(),
        }
    }

    #[must_use]
    pub fn bulk_memory(&self) -> &[u32] {
        &self.bulk_memory
    }

    pub fn bulk_memory_mut(&mut self) -> &mut [u32] {
        &mut self.bulk_memory
    }

    #[must_use]
    pub fn scratchpad(&self, cluster_id: usize) -> &[u32] {
        &self.clusters[cluster_id].scratchpad_memory
    }

    pub fn scratchpad_mut(&mut self, cluster_id: usize) -> &mut [u32] {
        &mut self.clusters[cluster_id].scratchpad_memory
    }

    /// Start queued transfers whose port is free.
    fn dispatch(&mut self, cluster_id: usize, options: SchedulingOptions, handoff: &mut Handoff) {
        let forbid_parallel = options.contains(SchedulingOption::ForbidParallelBulkScratchpad);
        let state = &mut self.clusters[cluster_id];
        while let Some(request) = handoff.requests.first() {
            let free = match request.op.space {
                Space::BulkMemory => {
                    state.bulk.is_none() && !(forbid_parallel && state.scratchpad_busy())
                }
                Space::Scratchpad => {
                    state.scratchpad[request.slot].is_none()
                        && !(forbid_parallel && state.bulk.is_some())
                }
            };
            if !free {
                break;
            }
            let Some(request) = handoff.requests.dequeue() else {
                break;
            };
            log::debug!(
                "{}",
                style(format!("cluster {cluster_id}: start transfer {request}")).magenta()
            );
            let transfer = Transfer {
                phase: Phase::Data { next_col: 0 },
                request,
            };
            match transfer.request.op.space {
                Space::BulkMemory => state.bulk = Some(transfer),
                Space::Scratchpad => {
                    let slot = transfer.request.slot;
                    state.scratchpad[slot] = Some(transfer);
                }
            }
        }
    }
}

/// Word address of a lane of a transfer.
fn address(
    request: &TransferRequest,
    local: usize,
    indices: Option<&LaneValues>,
    lane: usize,
) -> Option<usize> {
    let buffer = &request.buffer;
    if !buffer.valid {
        return None;
    }
    let offset = match indices {
        Some(indices) => *indices.get(lane)? as usize,
        None => {
            let tid = request.workgroup.thread_id(local);
            if tid.x >= buffer.x || tid.y >= buffer.y.max(1) {
                return None;
            }
            tid.y * buffer.x + tid.x
        }
    };
    if offset >= buffer.len() {
        return None;
    }
    Some(buffer.base as usize + offset)
}

/// Move one beat of a transfer.
///
/// Returns the next warp to transfer.
fn beat(
    transfer: &Transfer,
    next_col: usize,
    bus_width: usize,
    lanes: usize,
    port: StorePort,
    memory: &mut [u32],
    regfile: &mut RegFile,
) -> usize {
    let request = &transfer.request;
    let warps = request.workgroup.last_warp + 1;
    let cols: Vec<usize> = (next_col..warps).take(bus_width).collect();
    let accesses: Vec<StoreAccess> = cols
        .iter()
        .map(|&col| {
            let data = Register::vector(request.row, col, request.slot);
            match request.index_row {
                Some(index) => {
                    StoreAccess::indexed(data, Register::vector(index, col, request.slot))
                }
                None => StoreAccess::new(data),
            }
        })
        .collect();

    let mut active = BusMask::ZERO;
    active[..accesses.len()].fill(true);
    let conflicts = regfile.transfer_conflicts(&accesses, &active);
    // conflicting accesses and everything after them move to the next beat
    let granted = conflicts.first_one().unwrap_or(accesses.len());
    active[granted..].fill(false);
    if granted < accesses.len() {
        regfile.stats.conflicts += 1;
        log::trace!(
            "{} port: bank conflict at warp {}, deferred",
            port,
            cols[granted]
        );
    }

    match request.op.direction {
        Direction::Store => {
            let reads = regfile.store_read(port, &accesses[..granted], &active);
            for (col, read) in cols.iter().zip(reads) {
                let Some(read) = read else {
                    continue;
                };
                for lane in read.active.iter_ones().take_while(|lane| *lane < lanes) {
                    let local = col * lanes + lane;
                    if let Some(addr) = address(request, local, read.indices.as_ref(), lane) {
                        if let (Some(word), Some(value)) =
                            (memory.get_mut(addr), read.values.get(lane))
                        {
                            *word = *value;
                        }
                    }
                }
            }
        }
        Direction::Load => {
            let indices = regfile.store_indices(port, &accesses[..granted], &active);
            let writes: Vec<(StoreAccess, LaneValues)> = accesses[..granted]
                .iter()
                .zip(cols.iter())
                .zip(indices)
                .map(|((access, col), indices)| {
                    let values = (0..lanes)
                        .map(|lane| {
                            address(request, col * lanes + lane, indices.as_ref(), lane)
                                .and_then(|addr| memory.get(addr).copied())
                                .unwrap_or_default()
                        })
                        .collect();
                    (*access, values)
                })
                .collect();
            regfile.store_write(port, &writes, &active);
        }
    }
    next_col + granted
}

fn advance(
    transfer: &mut Option<Transfer>,
    bus_width: usize,
    latency: usize,
    lanes: usize,
    port: StorePort,
    memory: &mut [u32],
    cluster: &mut ClusterPort<'_>,
) -> bool {
    let Some(current) = transfer.as_mut() else {
        return false;
    };
    match current.phase {
        Phase::Data { next_col } => {
            let next_col = beat(
                current,
                next_col,
                bus_width,
                lanes,
                port,
                memory,
                cluster.regfile,
            );
            current.phase = if next_col > current.request.workgroup.last_warp {
                Phase::Latency(latency)
            } else {
                Phase::Data { next_col }
            };
        }
        Phase::Latency(remaining) => {
            current.phase = if remaining <= 1 {
                Phase::Done
            } else {
                Phase::Latency(remaining - 1)
            };
        }
        Phase::Done => {}
    }
    if current.phase == Phase::Done {
        let notice = CompletionNotice {
            slot: current.request.slot,
            space: current.request.op.space,
            retire: current.request.op.retire,
        };
        if cluster.handoff.completions.try_enqueue(notice).is_ok() {
            log::debug!(
                "{}",
                style(format!(
                    "cluster {}: transfer done {}",
                    cluster.cluster_id, current.request
                ))
                .magenta()
            );
            *transfer = None;
        }
    }
    true
}

impl TransferEngine for FixedLatency {
    #[tracing::instrument(name = "memory_cycle", skip_all, fields(cluster = port.cluster_id))]
    fn cycle(&mut self, cycle: u64, options: SchedulingOptions, mut port: ClusterPort<'_>) {
        let cluster_id = port.cluster_id;
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} memory cluster {cluster_id}")).magenta()
        );
        self.dispatch(cluster_id, options, port.handoff);

        let lanes = self.lanes;
        let state = &mut self.clusters[cluster_id];
        if advance(
            &mut state.bulk,
            self.bulk_bus_width,
            self.bulk_latency,
            lanes,
            StorePort::BulkMemory,
            &mut self.bulk_memory,
            &mut port,
        ) {
            self.stats.bulk_memory += 1;
        }
        let mut scratchpad_active = false;
        for slot in 0..NUM_SLOTS {
            scratchpad_active |= advance(
                &mut state.scratchpad[slot],
                self.scratchpad_bus_width,
                self.scratchpad_latency,
                lanes,
                StorePort::Scratchpad(slot),
                &mut state.scratchpad_memory,
                &mut port,
            );
        }
        if scratchpad_active {
            self.stats.scratchpad += 1;
        }
    }

    fn is_idle(&self) -> bool {
        self.clusters
            .iter()
            .all(|state| state.bulk.is_none() && !state.scratchpad_busy())
    }

    fn stats(&self) -> stats::Units {
        self.stats.clone()
    }
}
