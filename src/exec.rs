use crate::instruction::{Instruction, Opcode};
use crate::register::{LaneMask, LaneValues};

/// Context of one warp execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    pub cluster_id: usize,
    pub slot: usize,
    /// Warp (register file column).
    pub col: usize,
    pub pc: usize,
    pub lanes: usize,
    pub instr: &'a Instruction,
    /// Lanes that are running and did not break, return or exit.
    pub lane_active: LaneMask,
}

/// Result of one warp execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Destination values.
    pub values: Option<LaneValues>,
    /// Lanes written.
    pub mask: LaneMask,
    /// Branch decision of a conditional branch.
    pub taken: Option<bool>,
}

/// Arithmetic unit.
///
/// Computes the destination of an instruction for one warp. Scheduling
/// and hazards are handled by the pipeline.
pub trait ExecuteUnit: std::fmt::Debug + Send + Sync + 'static {
    #[must_use]
    fn execute(&mut self, ctx: &ExecContext<'_>, operands: &[Option<LaneValues>; 3]) -> ExecOutput;
}

/// Copies the first operand into the destination.
///
/// Conditional branches are taken if lane 0 of the first operand is nonzero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Move;

impl ExecuteUnit for Move {
    fn execute(&mut self, ctx: &ExecContext<'_>, operands: &[Option<LaneValues>; 3]) -> ExecOutput {
        match ctx.instr.opcode {
            Opcode::Alu => ExecOutput {
                values: Some(
                    operands[0]
                        .clone()
                        .unwrap_or_else(|| LaneValues::from_elem(0, ctx.lanes)),
                ),
                mask: ctx.lane_active,
                taken: None,
            },
            Opcode::Exit => ExecOutput {
                values: Some(LaneValues::from_elem(1, ctx.lanes)),
                mask: ctx.lane_active,
                taken: None,
            },
            Opcode::Branch => ExecOutput {
                values: None,
                mask: LaneMask::ZERO,
                taken: Some(
                    operands[0]
                        .as_ref()
                        .and_then(|values| values.first())
                        .is_some_and(|value| *value != 0),
                ),
            },
            _ => ExecOutput::default(),
        }
    }
}

/// Applies a binary function to the first two operands.
///
/// Sub-opcode 0 moves operand 0, every other sub-opcode applies the function.
#[derive(Debug, Clone, Copy)]
pub struct Binary(pub fn(u32, u32) -> u32);

impl Default for Binary {
    fn default() -> Self {
        Self(u32::wrapping_add)
    }
}

impl ExecuteUnit for Binary {
    fn execute(&mut self, ctx: &ExecContext<'_>, operands: &[Option<LaneValues>; 3]) -> ExecOutput {
        if ctx.instr.opcode != Opcode::Alu || ctx.instr.sub_opcode == 0 {
            return Move.execute(ctx, operands);
        }
        let zero = LaneValues::from_elem(0, ctx.lanes);
        let a = operands[0].as_ref().unwrap_or(&zero);
        let b = operands[1].as_ref().unwrap_or(&zero);
        ExecOutput {
            values: Some(a.iter().zip(b.iter()).map(|(a, b)| (self.0)(*a, *b)).collect()),
            mask: ctx.lane_active,
            taken: None,
        }
    }
}
