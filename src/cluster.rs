use crate::config::{Config, SchedulingOption, SchedulingOptions};
use crate::ctrl_stack::CtrlStack;
use crate::exec::ExecuteUnit;
use crate::fifo::Fifo;
use crate::ifetch::{IFetch, Signals};
use crate::imem::IMem;
use crate::instruction::{Instruction, Space};
use crate::memory::{ClusterPort, CompletionNotice, Handoff, TransferRequest};
use crate::pipeline::{Event, Pipeline, Resources};
use crate::regfile::RegFile;
use crate::register::NUM_SLOTS;
use crate::scoreboard::{self, Access, Scoreboard};
use crate::workgroup::Workgroup;
use crate::xlat::BufferToPhysXlat;
use console::style;

/// Life-cycle state of a workgroup slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SlotState {
    Empty,
    Running,
    BlockedBulkMemory,
    BlockedBulkMemoryThenRetire,
    BlockedScratchpad,
    Finished,
}

impl SlotState {
    #[must_use]
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::BlockedBulkMemory | Self::BlockedBulkMemoryThenRetire | Self::BlockedScratchpad
        )
    }
}

macro_rules! resources {
    ($cluster:expr, $imem:expr) => {
        Resources {
            regfile: &mut $cluster.regfile,
            scoreboard: &mut $cluster.scoreboard,
            ctrl_stack: &mut $cluster.ctrl_stack,
            ifetch: &mut $cluster.ifetch,
            imem: $imem,
            exec: $cluster.exec.as_mut(),
            stats: &mut $cluster.stats,
        }
    };
}

/// SIMD cluster with two workgroup slots.
///
/// Owns the pipeline units and drives the life-cycle of both slots.
pub struct SimdCluster {
    pub cluster_id: usize,
    slots: [SlotState; NUM_SLOTS],
    /// Blocking transfer waiting for the slot's in-flight instructions to drain.
    pending: [Option<TransferRequest>; NUM_SLOTS],
    /// A pair of workgroups is resident.
    pair_lock: bool,
    pub regfile: RegFile,
    pub scoreboard: Scoreboard,
    pub ctrl_stack: CtrlStack,
    pub ifetch: IFetch,
    pub xlat: BufferToPhysXlat,
    pub handoff: Handoff,
    pipeline: Pipeline,
    exec: Box<dyn ExecuteUnit>,
    pub stats: stats::Stats,
}

impl std::fmt::Debug for SimdCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SimdCluster@{}", self.cluster_id)
    }
}

impl SimdCluster {
    #[must_use]
    pub fn new(cluster_id: usize, config: &Config, exec: Box<dyn ExecuteUnit>) -> Self {
        Self {
            cluster_id,
            slots: [SlotState::Empty; NUM_SLOTS],
            pending: [None, None],
            pair_lock: false,
            regfile: RegFile::new(cluster_id, config),
            scoreboard: Scoreboard::new(scoreboard::Config {
                cluster_id,
                capacity: config.scoreboard_capacity(),
            }),
            ctrl_stack: CtrlStack::new(cluster_id, config.ctrl_stack_depth),
            ifetch: IFetch::new(cluster_id),
            xlat: BufferToPhysXlat::new(),
            handoff: Handoff::new(config.handoff_queue_size),
            pipeline: Pipeline::new(cluster_id, config.decode_stages, config.execute_depth),
            exec,
            stats: stats::Stats::new(config.num_banks),
        }
    }

    #[must_use]
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    #[must_use]
    pub fn slot_states(&self) -> [SlotState; NUM_SLOTS] {
        self.slots
    }

    /// Both slots are empty and nothing is in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|state| *state == SlotState::Empty)
            && self.pending.iter().all(Option::is_none)
            && self.pipeline.is_empty()
            && self.handoff.is_empty()
    }

    /// The cluster is done with the kernel.
    #[must_use]
    pub fn completed(&self, last_issued: bool, stream: &Fifo<Workgroup>) -> bool {
        last_issued && stream.is_empty() && self.is_idle()
    }

    /// Port handed to the external memory clock domain.
    pub fn port(&mut self) -> ClusterPort<'_> {
        ClusterPort {
            cluster_id: self.cluster_id,
            handoff: &mut self.handoff,
            regfile: &mut self.regfile,
        }
    }

    /// Statistics snapshot including the register bank counters.
    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        let mut stats = self.stats.clone();
        stats.banks = self.regfile.stats.clone();
        stats
    }

    fn transition(&mut self, cycle: u64, slot: usize, state: SlotState) {
        log::debug!(
            "cycle {} cluster {}: slot {} {} => {}",
            cycle,
            self.cluster_id,
            slot,
            self.slots[slot],
            state
        );
        self.slots[slot] = state;
    }

    /// Drain completion notices and admit workgroups.
    ///
    /// Runs serially across clusters since all clusters pull from the one
    /// workgroup stream.
    pub fn admit(
        &mut self,
        cycle: u64,
        stream: &mut Fifo<Workgroup>,
        last_issued: bool,
        options: SchedulingOptions,
    ) {
        // (1) completion drain
        while let Some(notice) = self.handoff.completions.dequeue() {
            self.complete(cycle, notice);
        }
        for slot in 0..NUM_SLOTS {
            if self.slots[slot] == SlotState::Finished && self.pipeline.slot_idle(slot) {
                assert!(
                    self.scoreboard.is_empty(slot),
                    "cycle {} cluster {}: slot {} retires with outstanding scoreboard entries {:?}",
                    cycle,
                    self.cluster_id,
                    slot,
                    self.scoreboard.entries()
                );
                self.regfile.unload_workgroup(slot);
                self.transition(cycle, slot, SlotState::Empty);
            }
        }
        let all_empty = self.slots.iter().all(|state| *state == SlotState::Empty);
        if self.pair_lock && all_empty {
            log::debug!(
                "cycle {} cluster {}: release pairwise lock",
                cycle,
                self.cluster_id
            );
            self.pair_lock = false;
        }

        // (2) admission
        if options.contains(SchedulingOption::PairwiseWorkgroups) {
            let ready = stream.len() >= 2 || stream.full() || (last_issued && !stream.is_empty());
            if all_empty && !self.pair_lock && ready {
                for slot in 0..NUM_SLOTS {
                    if let Some(workgroup) = stream.dequeue() {
                        self.load(cycle, slot, workgroup);
                    }
                }
                self.pair_lock = true;
            }
        } else if let Some(slot) = self.slots.iter().position(|s| *s == SlotState::Empty) {
            if let Some(workgroup) = stream.dequeue() {
                self.load(cycle, slot, workgroup);
            }
        }
    }

    fn load(&mut self, cycle: u64, slot: usize, workgroup: Workgroup) {
        log::debug!(
            "{}",
            style(format!(
                "cycle {:03} cluster {}: admit {} into slot {}",
                cycle, self.cluster_id, workgroup, slot
            ))
            .magenta()
        );
        self.regfile.load_workgroup(slot, workgroup);
        self.ifetch.reset_pc(slot);
        self.ctrl_stack.reset(slot);
        self.transition(cycle, slot, SlotState::Running);
    }

    fn complete(&mut self, cycle: u64, notice: CompletionNotice) {
        let CompletionNotice { slot, space, .. } = notice;
        let state = self.slots[slot];
        let next = match (state, space) {
            (SlotState::BlockedBulkMemory, Space::BulkMemory)
            | (SlotState::BlockedScratchpad, Space::Scratchpad) => SlotState::Running,
            (SlotState::BlockedBulkMemoryThenRetire, Space::BulkMemory) => SlotState::Finished,
            _ => panic!(
                "cycle {} cluster {}: {:?} completion notice for slot {} in state {}",
                cycle, self.cluster_id, space, slot, state
            ),
        };
        self.transition(cycle, slot, next);
        if next == SlotState::Running {
            self.ifetch.release(slot);
        }
    }

    /// (3) propagate slot state
    fn propagate(&mut self, cycle: u64) {
        for slot in 0..NUM_SLOTS {
            match self.slots[slot] {
                SlotState::Running
                    if self.regfile.workgroup_finished(slot)
                        && self.pipeline.slot_idle(slot)
                        && self.scoreboard.is_empty(slot) =>
                {
                    self.transition(cycle, slot, SlotState::Finished);
                }
                state if state.is_blocked() => {
                    let drained = self.pipeline.slot_idle(slot);
                    if drained && !self.handoff.requests.full() {
                        if let Some(request) = self.pending[slot].take() {
                            log::debug!(
                                "cycle {} cluster {}: request {}",
                                cycle,
                                self.cluster_id,
                                request
                            );
                            self.handoff.requests.enqueue(request);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn blocking_transfer(&mut self, cycle: u64, slot: usize, pc: usize, instr: &Instruction) {
        let (Some(op), Some(row)) = (instr.transfer(), instr.transfer_row()) else {
            unreachable!("blocking transfer without transfer operation");
        };
        let handle = instr.buffer.unwrap_or_default();
        let buffer = self.xlat.read(op.space, handle);
        assert!(
            buffer.valid,
            "cycle {} cluster {}: slot {} pc {}: {} through unmapped {:?} buffer {}",
            cycle, self.cluster_id, slot, pc, instr, op.space, handle
        );
        let Some(workgroup) = self.regfile.workgroup(slot).cloned() else {
            panic!(
                "cycle {} cluster {}: transfer {} from empty slot {}",
                cycle, self.cluster_id, instr, slot
            );
        };
        assert_eq!(
            self.slots[slot],
            SlotState::Running,
            "cycle {} cluster {}: slot {} commits {} while not running",
            cycle,
            self.cluster_id,
            slot,
            instr
        );
        let state = match op.space {
            Space::BulkMemory if op.retire => SlotState::BlockedBulkMemoryThenRetire,
            Space::BulkMemory => SlotState::BlockedBulkMemory,
            Space::Scratchpad => {
                if op.retire {
                    log::warn!(
                        "cluster {}: retire flag of scratchpad transfer {} ignored",
                        self.cluster_id,
                        instr
                    );
                }
                SlotState::BlockedScratchpad
            }
        };
        self.transition(cycle, slot, state);
        self.pending[slot] = Some(TransferRequest {
            slot,
            pc,
            op,
            row,
            index_row: instr.index_row(),
            buffer,
            workgroup,
        });
    }

    fn handle(&mut self, cycle: u64, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Transfer { slot, pc, instr } => {
                    self.blocking_transfer(cycle, slot, pc, &instr);
                }
                Event::Exited { slot } => {
                    if !self.regfile.workgroup_finished(slot) {
                        log::debug!(
                            "cycle {} cluster {}: slot {} exit leaves active lanes",
                            cycle,
                            self.cluster_id,
                            slot
                        );
                        self.ifetch.release(slot);
                    }
                }
            }
        }
    }

    fn fetch_signals(&mut self, options: SchedulingOptions) -> Signals {
        let mut eligible = [false; NUM_SLOTS];
        for (slot, eligible) in eligible.iter_mut().enumerate() {
            *eligible = self.slots[slot] == SlotState::Running
                && !self.regfile.workgroup_finished(slot);
        }
        let scratchpad_busy = self.slots.iter().any(|s| *s == SlotState::BlockedScratchpad);
        let forbidden =
            options.contains(SchedulingOption::ForbidParallelComputeScratchpad) && scratchpad_busy;
        if forbidden && eligible.iter().any(|e| *e) {
            self.stats.scheduler.fetch_policy_stall += 1;
        }
        Signals {
            eligible,
            forbidden,
            ..Signals::default()
        }
    }

    /// Advance the cluster by one compute cycle.
    #[tracing::instrument(name = "cluster_cycle", skip_all, fields(cluster = self.cluster_id))]
    pub fn cycle(&mut self, cycle: u64, imem: &IMem, options: SchedulingOptions) {
        log::debug!(
            "{}",
            style(format!(
                "cycle {:03} cluster {}: slots={:?} pc={:?}",
                cycle,
                self.cluster_id,
                self.slots.map(|s| s.to_string()),
                [self.ifetch.pc(0), self.ifetch.pc(1)],
            ))
            .green()
        );
        self.propagate(cycle);

        let events = {
            let mut res = resources!(self, imem);
            let mut events = self.pipeline.writeback(cycle, &mut res);
            events.extend(self.pipeline.execute(cycle, &mut res));
            self.pipeline.operand_read(cycle, &mut res);
            self.pipeline.decode(cycle, &mut res);
            events
        };
        self.handle(cycle, events);

        let signals = self.fetch_signals(options);
        let fetched_slot = {
            let mut res = resources!(self, imem);
            self.pipeline.fetch(&mut res, signals).map(|fetched| fetched.slot)
        };
        if let Some(slot) = fetched_slot {
            assert_eq!(
                self.slots[slot],
                SlotState::Running,
                "cycle {} cluster {}: fetch from slot {} that is not running",
                cycle,
                self.cluster_id,
                slot
            );
        }

        // (9) settle
        self.regfile.commit();
        self.scoreboard.countdown();
    }
}
