use crate::instruction::Instruction;
use crate::register::{Kind, Register, Special, NUM_SLOTS};
use itertools::Itertools;

/// Scoreboard entry identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entry {
    /// All warps of a register row of a slot.
    Register { kind: Kind, row: usize, slot: usize },
    /// Pending control stack mutation of a slot.
    CtrlStack { slot: usize },
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register { kind, row, slot } => write!(f, "{}{row}@slot{slot}", kind.prefix()),
            Self::CtrlStack { slot } => write!(f, "ctrl_stack@slot{slot}"),
        }
    }
}

/// Scoreboard access.
///
/// The scoreboard keeps track of in-flight register writes and control
/// stack mutations of both workgroup slots.
pub trait Access: Send + Sync + 'static {
    /// Checks if registers used by an instruction are reserved.
    ///
    /// # Returns
    /// `true` if RAW or WAW hazard (no WAR since in-order issue),
    /// or a control stack read with a pending mutation.
    #[must_use]
    fn has_collision(&self, slot: usize, instr: &Instruction) -> bool;

    /// Reserve an entry for `cycles` cycles.
    ///
    /// The entry stays reserved until [`Access::issued`] marked it issued
    /// and the cycles elapsed.
    fn reserve(&mut self, entry: Entry, cycles: usize);

    /// Reserve all entries written by an instruction at decode.
    fn reserve_all(&mut self, slot: usize, instr: &Instruction, cycles: usize);

    /// Re-arm an entry when one warp of its instruction leaves operand read.
    ///
    /// `last` marks the last warp of the instruction.
    fn issued(&mut self, entry: Entry, cycles: usize, last: bool);

    /// Release an entry immediately.
    fn release(&mut self, entry: Entry);

    /// Count down all issued entries by one cycle.
    fn countdown(&mut self);

    /// Whether a slot has no outstanding entries.
    #[must_use]
    fn is_empty(&self, slot: usize) -> bool;

    #[must_use]
    fn len(&self) -> usize;
}

/// Entries written by an instruction.
#[must_use]
pub fn writes(slot: usize, instr: &Instruction) -> Vec<Entry> {
    let mut entries = Vec::new();
    if let Some(dst) = instr.pipeline_destination() {
        let reg = dst.resolve(0, slot);
        let (kind, row, slot) = reg.identity();
        entries.push(Entry::Register { kind, row, slot });
    }
    if instr.mutates_ctrl_stack() {
        entries.push(Entry::CtrlStack { slot });
    }
    entries
}

fn special_entry(special: Special, slot: usize) -> Entry {
    Entry::Register {
        kind: special.kind(),
        row: special.row(),
        slot,
    }
}

/// Entries guarding a source register.
///
/// The derived lane active mask is written through the four control masks.
fn source_entries(reg: Register) -> Vec<Entry> {
    match reg.as_special() {
        Some(Special::LaneActive) => [Special::Run, Special::Break, Special::Return, Special::Exit]
            .into_iter()
            .map(|special| special_entry(special, reg.slot))
            .collect(),
        _ => {
            let (kind, row, slot) = reg.identity();
            vec![Entry::Register { kind, row, slot }]
        }
    }
}

/// Entries read by an instruction.
#[must_use]
pub fn reads(slot: usize, instr: &Instruction) -> Vec<Entry> {
    let mut entries: Vec<Entry> = instr
        .pipeline_sources()
        .iter()
        .flatten()
        .map(|src| src.resolve(0, slot))
        .filter(|reg| reg.kind != Kind::Immediate)
        .flat_map(source_entries)
        .collect();
    if instr.reads_ctrl_stack() {
        entries.push(Entry::CtrlStack { slot });
        // popping rejoins lanes by clearing their masks
        for special in [Special::Break, Special::Return] {
            entries.push(special_entry(special, slot));
        }
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outstanding {
    entry: Entry,
    cycles: usize,
    /// All warps of the instruction left operand read.
    issued: bool,
}

/// Scoreboard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct Config {
    pub cluster_id: usize,
    /// Maximum outstanding entries.
    pub capacity: usize,
}

/// Scoreboard implementation.
#[derive(Debug, Default)]
pub struct Scoreboard {
    pub cluster_id: usize,
    pub capacity: usize,
    outstanding: Vec<Outstanding>,
}

impl Scoreboard {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let Config {
            cluster_id,
            capacity,
        } = config;
        Self {
            cluster_id,
            capacity,
            outstanding: Vec::with_capacity(capacity),
        }
    }

    /// Remaining cycles of an entry.
    #[must_use]
    pub fn remaining(&self, entry: &Entry) -> Option<usize> {
        self.outstanding
            .iter()
            .find(|o| o.entry == *entry)
            .map(|o| o.cycles)
    }

    #[must_use]
    pub fn entries(&self) -> Vec<Entry> {
        self.outstanding.iter().map(|o| o.entry).sorted().collect()
    }
}

impl Access for Scoreboard {
    fn has_collision(&self, slot: usize, instr: &Instruction) -> bool {
        let used: Vec<Entry> = reads(slot, instr)
            .into_iter()
            .chain(writes(slot, instr))
            .collect();
        let collision = self
            .outstanding
            .iter()
            .any(|o| used.contains(&o.entry));
        if collision {
            log::trace!(
                "scoreboard: {} uses {:?} but slot {} has reserved {:?}",
                instr,
                used.iter().map(ToString::to_string).collect::<Vec<_>>(),
                slot,
                self.outstanding
                    .iter()
                    .map(|o| (o.entry.to_string(), o.cycles))
                    .collect::<Vec<_>>(),
            );
        }
        collision
    }

    fn reserve(&mut self, entry: Entry, cycles: usize) {
        assert!(
            self.outstanding.iter().all(|o| o.entry != entry),
            "trying to reserve an already reserved entry (cluster_id={}, entry={})",
            self.cluster_id,
            entry,
        );
        assert!(
            self.outstanding.len() < self.capacity,
            "scoreboard full (cluster_id={}, capacity={})",
            self.cluster_id,
            self.capacity,
        );
        log::trace!("scoreboard: reserve {} for {} cycles", entry, cycles);
        self.outstanding.push(Outstanding {
            entry,
            cycles: cycles.max(1),
            issued: false,
        });
    }

    fn reserve_all(&mut self, slot: usize, instr: &Instruction, cycles: usize) {
        for entry in writes(slot, instr) {
            self.reserve(entry, cycles);
        }
    }

    fn issued(&mut self, entry: Entry, cycles: usize, last: bool) {
        let Some(outstanding) = self.outstanding.iter_mut().find(|o| o.entry == entry) else {
            panic!(
                "issue of unreserved entry (cluster_id={}, entry={})",
                self.cluster_id, entry
            );
        };
        outstanding.cycles = outstanding.cycles.max(cycles);
        outstanding.issued |= last;
    }

    fn release(&mut self, entry: Entry) {
        let before = self.outstanding.len();
        self.outstanding.retain(|o| o.entry != entry);
        if self.outstanding.len() != before {
            log::trace!("scoreboard: release {}", entry);
        }
    }

    fn countdown(&mut self) {
        for o in &mut self.outstanding {
            if o.issued || o.cycles > 1 {
                o.cycles = o.cycles.saturating_sub(1);
            }
        }
        self.outstanding.retain(|o| {
            let done = o.cycles == 0;
            if done {
                log::trace!("scoreboard: release {}", o.entry);
            }
            !done
        });
    }

    fn is_empty(&self, slot: usize) -> bool {
        debug_assert!(slot < NUM_SLOTS);
        self.outstanding.iter().all(|o| match o.entry {
            Entry::Register { slot: s, .. } | Entry::CtrlStack { slot: s } => s != slot,
        })
    }

    fn len(&self) -> usize {
        self.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, Config, Entry, Scoreboard};
    use crate::ctrl_stack::Action;
    use crate::instruction::{Instruction, Operand};
    use crate::register::{Kind, Special};

    fn scoreboard() -> Scoreboard {
        Scoreboard::new(Config {
            cluster_id: 0,
            capacity: 8,
        })
    }

    #[test]
    fn test_read_after_write_stalls_until_writeback() {
        let mut scoreboard = scoreboard();
        let writer = Instruction::mov(Operand::vector(2), Operand::Immediate(1));
        let reader = Instruction::mov(Operand::vector(3), Operand::vector(2));
        let other_slot_reader = reader.clone();

        assert!(!scoreboard.has_collision(0, &reader));
        scoreboard.reserve_all(0, &writer, 2);
        assert!(scoreboard.has_collision(0, &reader));
        assert!(!scoreboard.has_collision(1, &other_slot_reader));
        assert!(!scoreboard.is_empty(0));
        assert!(scoreboard.is_empty(1));

        // not issued yet: the entry is held
        for _ in 0..10 {
            scoreboard.countdown();
        }
        assert!(scoreboard.has_collision(0, &reader));

        let entry = Entry::Register {
            kind: Kind::Vector,
            row: 2,
            slot: 0,
        };
        scoreboard.issued(entry, 3, true);
        assert_eq!(scoreboard.remaining(&entry), Some(3));
        scoreboard.countdown();
        scoreboard.countdown();
        assert!(scoreboard.has_collision(0, &reader));
        scoreboard.countdown();
        assert!(!scoreboard.has_collision(0, &reader));
        assert!(scoreboard.is_empty(0));
    }

    #[test]
    fn test_pop_waits_for_pending_push() {
        let mut scoreboard = scoreboard();
        let push = Instruction::push(Action::BreakPush, 12);
        scoreboard.reserve_all(1, &push, 3);
        assert!(scoreboard.has_collision(1, &Instruction::pop()));
        assert!(!scoreboard.has_collision(0, &Instruction::pop()));
        scoreboard.release(Entry::CtrlStack { slot: 1 });
        assert!(!scoreboard.has_collision(1, &Instruction::pop()));

        // pending break mask writes hold the pop as well
        let brk = Instruction::mov(Operand::Special(Special::Break), Operand::Immediate(1));
        scoreboard.reserve_all(1, &brk, 3);
        assert!(scoreboard.has_collision(1, &Instruction::pop()));
    }

    #[test]
    fn test_lane_active_read_waits_for_control_mask_writes() {
        let mut scoreboard = scoreboard();
        let branch = Instruction::branch(Operand::Special(Special::LaneActive), 4);
        assert!(!scoreboard.has_collision(0, &branch));
        for special in [Special::Run, Special::Break, Special::Return, Special::Exit] {
            let write = Instruction::mov(Operand::Special(special), Operand::Immediate(1));
            scoreboard.reserve_all(0, &write, 3);
            assert!(scoreboard.has_collision(0, &branch), "{special}");
            assert!(!scoreboard.has_collision(1, &branch), "{special}");
            scoreboard.release(super::special_entry(special, 0));
        }
        assert!(!scoreboard.has_collision(0, &branch));

        // other derived registers do not depend on the masks
        let brk = Instruction::mov(Operand::Special(Special::Break), Operand::Immediate(1));
        scoreboard.reserve_all(0, &brk, 3);
        let lane_id = Instruction::mov(Operand::vector(0), Operand::Special(Special::LaneId));
        assert!(!scoreboard.has_collision(0, &lane_id));
    }

    #[test]
    #[should_panic(expected = "already reserved")]
    fn test_double_reserve_panics() {
        let mut scoreboard = scoreboard();
        scoreboard.reserve(Entry::CtrlStack { slot: 0 }, 1);
        scoreboard.reserve(Entry::CtrlStack { slot: 0 }, 1);
    }
}
