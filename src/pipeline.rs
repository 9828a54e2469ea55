use crate::ctrl_stack::{Action, CtrlStack};
use crate::exec::{ExecContext, ExecOutput, ExecuteUnit};
use crate::ifetch::{Fetched, IFetch, Signals};
use crate::imem::IMem;
use crate::instruction::{Instruction, Opcode};
use crate::regfile::RegFile;
use crate::register::{full_mask, ControlMask, LaneValues, Register, Special};
use crate::scoreboard::{self, Access, Entry, Scoreboard};

/// Units driven by the pipeline.
#[derive(Debug)]
pub struct Resources<'a> {
    pub regfile: &'a mut RegFile,
    pub scoreboard: &'a mut Scoreboard,
    pub ctrl_stack: &'a mut CtrlStack,
    pub ifetch: &'a mut IFetch,
    pub imem: &'a IMem,
    pub exec: &'a mut dyn ExecuteUnit,
    pub stats: &'a mut stats::Stats,
}

/// Pipeline events handled by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A blocking transfer reached execute.
    Transfer {
        slot: usize,
        pc: usize,
        instr: Instruction,
    },
    /// The last warp of an exit instruction wrote back.
    Exited { slot: usize },
}

/// Instruction in the operand read stage.
#[derive(Debug, Clone)]
struct Issue {
    fetched: Fetched,
    /// Warp read next.
    col: usize,
    last_warp: usize,
    collected: [Option<LaneValues>; 3],
}

/// One warp with all operands read.
#[derive(Debug, Clone)]
struct Read {
    fetched: Fetched,
    col: usize,
    last: bool,
    operands: [Option<LaneValues>; 3],
}

#[derive(Debug, Clone)]
struct Executing {
    fetched: Fetched,
    col: usize,
    last: bool,
    out: ExecOutput,
    writeback_cycle: u64,
}

/// In-order issue pipeline of one cluster.
///
/// Stages are evaluated back to front, so every stage consumes what its
/// upstream stage produced in the previous cycle.
#[derive(Debug)]
pub struct Pipeline {
    pub cluster_id: usize,
    execute_depth: usize,
    fetch_latch: Option<Fetched>,
    decode: Vec<Option<Fetched>>,
    issue: Option<Issue>,
    read: Option<Read>,
    execute: std::collections::VecDeque<Executing>,
    /// Decode could not issue in this cycle.
    decode_stalled: bool,
}

fn target(cycle: u64, cluster_id: usize, fetched: &Fetched) -> usize {
    fetched.instr.target.unwrap_or_else(|| {
        panic!(
            "cycle {} cluster {}: {} without target",
            cycle, cluster_id, fetched
        )
    })
}

impl Pipeline {
    #[must_use]
    pub fn new(cluster_id: usize, decode_stages: usize, execute_depth: usize) -> Self {
        Self {
            cluster_id,
            execute_depth,
            fetch_latch: None,
            decode: vec![None; decode_stages],
            issue: None,
            read: None,
            execute: std::collections::VecDeque::new(),
            decode_stalled: false,
        }
    }

    /// Cycles from decode until writeback, assuming no stalls.
    #[must_use]
    pub fn writeback_latency(&self) -> usize {
        self.decode.len() + self.execute_depth + 2
    }

    /// Whether no instruction of a slot is in flight.
    #[must_use]
    pub fn slot_idle(&self, slot: usize) -> bool {
        self.fetch_latch.as_ref().map_or(true, |f| f.slot != slot)
            && self.decode.iter().flatten().all(|f| f.slot != slot)
            && self.issue.as_ref().map_or(true, |i| i.fetched.slot != slot)
            && self.read.as_ref().map_or(true, |r| r.fetched.slot != slot)
            && self.execute.iter().all(|e| e.fetched.slot != slot)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fetch_latch.is_none()
            && self.decode.iter().all(Option::is_none)
            && self.issue.is_none()
            && self.read.is_none()
            && self.execute.is_empty()
    }

    /// Upstream stall: decode hazard or vector warp enumeration.
    #[must_use]
    pub fn stalled(&self) -> bool {
        self.decode_stalled || self.issue.as_ref().is_some_and(|i| i.col < i.last_warp)
    }

    /// Write back the oldest instruction whose execution completed.
    pub fn writeback(&mut self, cycle: u64, res: &mut Resources<'_>) -> Vec<Event> {
        let mut events = Vec::new();
        let ready = self
            .execute
            .front()
            .is_some_and(|e| e.writeback_cycle <= cycle);
        if !ready {
            return events;
        }
        let Some(Executing {
            fetched,
            col,
            last,
            out,
            ..
        }) = self.execute.pop_front()
        else {
            return events;
        };
        if let (Some(dst), Some(values)) = (fetched.instr.pipeline_destination(), out.values) {
            let reg = dst.resolve(col, fetched.slot);
            log::trace!(
                "cycle {} cluster {}: writeback {} to {}",
                cycle,
                self.cluster_id,
                fetched,
                reg
            );
            res.regfile.pipeline_write(reg, out.mask, values);
        }
        res.stats.sim.instructions += 1;
        res.stats.units.writeback += 1;
        if fetched.instr.is_exit() && last {
            events.push(Event::Exited { slot: fetched.slot });
        }
        events
    }

    /// Move the read warp into execute.
    ///
    /// Resolves control flow and control stack instructions and commits
    /// blocking transfers.
    pub fn execute(&mut self, cycle: u64, res: &mut Resources<'_>) -> Vec<Event> {
        let mut events = Vec::new();
        let Some(Read {
            fetched,
            col,
            last,
            operands,
        }) = self.read.take()
        else {
            return events;
        };
        let slot = fetched.slot;
        let ctx = ExecContext {
            cluster_id: self.cluster_id,
            slot,
            col,
            pc: fetched.pc,
            lanes: res.regfile.lanes(),
            instr: &fetched.instr,
            lane_active: res.regfile.lane_active(slot, col),
        };
        let out = res.exec.execute(&ctx, &operands);
        res.stats.units.execute += 1;

        match fetched.instr.opcode {
            Opcode::Jump => {
                let target = target(cycle, self.cluster_id, &fetched);
                res.ifetch.overwrite_pc(slot, target);
            }
            Opcode::Branch => {
                if out.taken.unwrap_or(false) {
                    let target = target(cycle, self.cluster_id, &fetched);
                    res.ifetch.overwrite_pc(slot, target);
                } else {
                    res.ifetch.release(slot);
                }
            }
            Opcode::Push(action) => {
                let target = target(cycle, self.cluster_id, &fetched);
                res.ctrl_stack.push(slot, action, target);
                res.scoreboard.release(Entry::CtrlStack { slot });
            }
            Opcode::Pop => {
                let entry = res.ctrl_stack.pop(slot);
                res.scoreboard.release(Entry::CtrlStack { slot });
                let rejoin = match entry.action {
                    Action::ConditionalPush => None,
                    Action::BreakPush => Some(Special::Break),
                    Action::ReturnPush => Some(Special::Return),
                };
                if let Some(special) = rejoin {
                    self.clear_control_mask(res, slot, special);
                }
                res.ifetch.overwrite_pc(slot, entry.target);
            }
            Opcode::Transfer(_) => {
                log::debug!(
                    "cycle {} cluster {}: commit blocking transfer {}",
                    cycle,
                    self.cluster_id,
                    fetched
                );
                events.push(Event::Transfer {
                    slot,
                    pc: fetched.pc,
                    instr: fetched.instr.clone(),
                });
            }
            Opcode::Nop | Opcode::Alu | Opcode::Exit => {}
        }

        self.execute.push_back(Executing {
            fetched,
            col,
            last,
            out,
            writeback_cycle: cycle + self.execute_depth as u64,
        });
        events
    }

    fn clear_control_mask(&self, res: &mut Resources<'_>, slot: usize, special: Special) {
        let Some(last_warp) = res.regfile.workgroup(slot).map(|wg| wg.last_warp) else {
            return;
        };
        let lanes = res.regfile.lanes();
        debug_assert!(matches!(
            special.control_mask(),
            Some(ControlMask::Break | ControlMask::Return)
        ));
        for col in 0..=last_warp {
            res.regfile.pipeline_write(
                Register::special(special, col, slot),
                full_mask(lanes),
                LaneValues::from_elem(0, lanes),
            );
        }
    }

    /// Read the operands of the current warp.
    ///
    /// Operands that conflict on a register bank are deferred to the next cycle.
    pub fn operand_read(&mut self, cycle: u64, res: &mut Resources<'_>) {
        debug_assert!(self.read.is_none());
        let Some(issue) = self.issue.as_mut() else {
            return;
        };
        let slot = issue.fetched.slot;
        let col = issue.col;
        let srcs = issue.fetched.instr.pipeline_sources();
        let mut requested: [Option<Register>; 3] = [None; 3];
        for (i, src) in srcs.iter().enumerate() {
            if issue.collected[i].is_none() {
                requested[i] = src.map(|op| op.resolve(col, slot));
            }
        }
        let conflicts = res.regfile.policy().issue_conflicts(&requested);
        if conflicts.any() {
            log::debug!(
                "cycle {} cluster {}: bank conflict reading {} warp {} ({:?}), deferring {}",
                cycle,
                self.cluster_id,
                issue.fetched,
                col,
                requested,
                conflicts
            );
            res.stats.scheduler.issue_bank_conflict_stall += 1;
            res.regfile.stats.conflicts += 1;
            for i in conflicts.iter_ones() {
                requested[i] = None;
            }
        }
        let values = res.regfile.pipeline_read(&requested);
        for (i, value) in values.into_iter().enumerate() {
            if value.is_some() {
                issue.collected[i] = value;
            }
        }
        if conflicts.any() {
            return;
        }

        let last = col == issue.last_warp;
        for entry in scoreboard::writes(slot, &issue.fetched.instr) {
            if matches!(entry, Entry::Register { .. }) {
                res.scoreboard
                    .issued(entry, self.execute_depth + 2, last);
            }
        }
        let operands = std::mem::take(&mut issue.collected);
        self.read = Some(Read {
            fetched: issue.fetched.clone(),
            col,
            last,
            operands,
        });
        if last {
            self.issue = None;
        } else {
            issue.col += 1;
        }
    }

    /// Decode: move instructions towards issue.
    pub fn decode(&mut self, cycle: u64, res: &mut Resources<'_>) {
        self.decode_stalled = false;
        let stages = self.decode.len();
        if let Some(fetched) = self.decode[stages - 1].as_ref() {
            if self.issue.is_some() {
                res.stats.scheduler.issue_warp_enumeration_stall += 1;
                self.decode_stalled = true;
            } else if res.scoreboard.has_collision(fetched.slot, &fetched.instr) {
                if fetched.instr.reads_ctrl_stack() {
                    res.stats.scheduler.issue_ctrl_stack_stall += 1;
                } else {
                    res.stats.scheduler.issue_raw_hazard_stall += 1;
                }
                log::trace!(
                    "cycle {} cluster {}: scoreboard stall {}",
                    cycle,
                    self.cluster_id,
                    fetched
                );
                self.decode_stalled = true;
            } else if let Some(fetched) = self.decode[stages - 1].take() {
                let slot = fetched.slot;
                let Some(workgroup) = res.regfile.workgroup(slot) else {
                    panic!(
                        "cycle {} cluster {}: issue of {} from empty slot",
                        cycle, self.cluster_id, fetched
                    );
                };
                let last_warp = if fetched.instr.is_vector() {
                    workgroup.last_warp
                } else {
                    0
                };
                res.scoreboard
                    .reserve_all(slot, &fetched.instr, self.writeback_latency());
                res.stats.scheduler.num_issued += 1;
                res.stats.units.decode += 1;
                log::trace!(
                    "cycle {} cluster {}: issue {} over {} warps",
                    cycle,
                    self.cluster_id,
                    fetched,
                    last_warp + 1
                );
                self.issue = Some(Issue {
                    fetched,
                    col: 0,
                    last_warp,
                    collected: [None, None, None],
                });
            }
        }
        for stage in (1..stages).rev() {
            if self.decode[stage].is_none() {
                self.decode[stage] = self.decode[stage - 1].take();
            }
        }
        if self.decode[0].is_none() {
            self.decode[0] = self.fetch_latch.take();
        }
    }

    /// Fetch into the fetch latch.
    pub fn fetch(&mut self, res: &mut Resources<'_>, mut signals: Signals) -> Option<&Fetched> {
        signals.latch_free = self.fetch_latch.is_none();
        signals.stall |= self.stalled();
        let fetched = res.ifetch.cycle(res.imem, signals)?;
        res.stats.units.fetch += 1;
        self.fetch_latch = Some(fetched);
        self.fetch_latch.as_ref()
    }
}
