use crate::imem::IMem;
use crate::instruction::Instruction;
use crate::register::NUM_SLOTS;

/// A fetched instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub slot: usize,
    pub pc: usize,
    pub instr: Instruction,
}

impl std::fmt::Display for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[slot {} pc {}] {}", self.slot, self.pc, self.instr)
    }
}

/// Inputs of the fetch unit for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// Slot may issue: running and not finished.
    pub eligible: [bool; NUM_SLOTS],
    /// Decode hazard or vector warp enumeration in progress.
    pub stall: bool,
    /// The decode latch can take an instruction.
    pub latch_free: bool,
    /// Issue is forbidden by the scheduling policy.
    pub forbidden: bool,
}

/// Instruction fetch.
///
/// Selects the slot issuing this cycle and owns the program counters of
/// both slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IFetch {
    pub cluster_id: usize,
    pc: [usize; NUM_SLOTS],
    /// Fetch waits for a control instruction of the slot to resolve.
    held: [bool; NUM_SLOTS],
    /// PC overwritten during this cycle.
    overwritten: [bool; NUM_SLOTS],
    active: usize,
}

impl IFetch {
    #[must_use]
    pub fn new(cluster_id: usize) -> Self {
        Self {
            cluster_id,
            pc: [0; NUM_SLOTS],
            held: [false; NUM_SLOTS],
            overwritten: [false; NUM_SLOTS],
            active: 0,
        }
    }

    #[must_use]
    pub fn pc(&self, slot: usize) -> usize {
        self.pc[slot]
    }

    #[must_use]
    pub fn is_held(&self, slot: usize) -> bool {
        self.held[slot]
    }

    /// Reset the PC of a slot when a new workgroup is loaded.
    pub fn reset_pc(&mut self, slot: usize) {
        self.pc[slot] = 0;
        self.held[slot] = false;
        self.overwritten[slot] = false;
    }

    /// Overwrite the PC of a slot.
    ///
    /// Takes effect in the same cycle and releases a held slot.
    pub fn overwrite_pc(&mut self, slot: usize, pc: usize) {
        log::debug!(
            "cluster {}: slot {} pc overwrite {} => {}",
            self.cluster_id,
            slot,
            self.pc[slot],
            pc
        );
        self.pc[slot] = pc;
        self.held[slot] = false;
        self.overwritten[slot] = true;
    }

    /// Resume fetching a held slot at the next sequential PC.
    pub fn release(&mut self, slot: usize) {
        self.held[slot] = false;
    }

    /// Fetch one instruction.
    pub fn cycle(&mut self, imem: &IMem, signals: Signals) -> Option<Fetched> {
        let overwritten = std::mem::take(&mut self.overwritten);
        if !signals.latch_free || signals.forbidden {
            return None;
        }
        let ready = |slot: usize| signals.eligible[slot] && !self.held[slot];
        let other = (self.active + 1) % NUM_SLOTS;
        let slot = if ready(self.active) {
            self.active
        } else if ready(other) {
            other
        } else {
            return None;
        };
        if signals.stall && !overwritten[slot] {
            return None;
        }
        if slot != self.active {
            log::trace!(
                "cluster {}: fetch switches from slot {} to slot {}",
                self.cluster_id,
                self.active,
                slot
            );
            self.active = slot;
        }

        let pc = self.pc[slot];
        let instr = imem.read(Some(pc)).clone();
        if instr.holds_fetch() {
            self.held[slot] = true;
        }
        self.pc[slot] = pc + 1;
        let fetched = Fetched { slot, pc, instr };
        log::trace!("cluster {}: fetch {}", self.cluster_id, fetched);
        Some(fetched)
    }
}
