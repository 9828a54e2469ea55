use crate::ctrl_stack::Action as StackAction;
use crate::register::{Kind, Register, Special};
use serde::{Deserialize, Serialize};

/// Maximum number of buffer bindings per address space.
pub const MAX_BUFFERS: usize = 32;

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Register { kind: Kind, row: usize },
    Special(Special),
    Immediate(u32),
}

impl Operand {
    #[must_use]
    pub fn vector(row: usize) -> Self {
        Self::Register {
            kind: Kind::Vector,
            row,
        }
    }

    #[must_use]
    pub fn scalar(row: usize) -> Self {
        Self::Register {
            kind: Kind::Scalar,
            row,
        }
    }

    #[must_use]
    pub fn predicate(row: usize) -> Self {
        Self::Register {
            kind: Kind::Predicate,
            row,
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Register { kind, .. } => *kind,
            Self::Special(special) => special.kind(),
            Self::Immediate(_) => Kind::Immediate,
        }
    }

    /// Resolve the operand for a warp of a slot.
    #[must_use]
    pub fn resolve(&self, col: usize, slot: usize) -> Register {
        match *self {
            Self::Register { kind, row } => {
                let col = if kind.is_per_lane() { col } else { 0 };
                Register::new(kind, row, col, slot)
            }
            Self::Special(special) => {
                let col = if special.kind().is_per_lane() { col } else { 0 };
                Register::special(special, col, slot)
            }
            Self::Immediate(value) => Register::immediate(value),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register { kind, row } => write!(f, "{}{row}", kind.prefix()),
            Self::Special(special) => write!(f, "%{special}"),
            Self::Immediate(value) => write!(f, "#{value}"),
        }
    }
}

/// Address space of an external transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Space {
    BulkMemory,
    Scratchpad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Load,
    Store,
}

/// A transfer between the register file and an external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferOp {
    pub space: Space,
    pub direction: Direction,
    /// Lane-indexed (gather/scatter) transfer.
    pub indexed: bool,
    /// Retire the workgroup once the transfer completed.
    pub retire: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    /// Arithmetic, opaque to the core.
    Alu,
    Jump,
    /// Uniform conditional branch.
    Branch,
    Push(StackAction),
    Pop,
    /// Unconditional exit.
    Exit,
    Transfer(TransferOp),
}

/// An instruction.
///
/// Operands are opaque to the core except for the control flow,
/// control stack and transfer opcodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    #[serde(default)]
    pub sub_opcode: u8,
    #[serde(default)]
    pub srcs: [Option<Operand>; 3],
    #[serde(default)]
    pub dst: Option<Operand>,
    /// Branch or control stack target.
    #[serde(default)]
    pub target: Option<usize>,
    /// Buffer handle of a transfer.
    #[serde(default)]
    pub buffer: Option<u8>,
}

impl Default for Instruction {
    fn default() -> Self {
        Self::nop()
    }
}

impl Instruction {
    #[must_use]
    pub fn nop() -> Self {
        Self {
            opcode: Opcode::Nop,
            sub_opcode: 0,
            srcs: [None; 3],
            dst: None,
            target: None,
            buffer: None,
        }
    }

    #[must_use]
    pub fn alu(sub_opcode: u8, dst: Operand, srcs: [Option<Operand>; 3]) -> Self {
        Self {
            opcode: Opcode::Alu,
            sub_opcode,
            srcs,
            dst: Some(dst),
            ..Self::nop()
        }
    }

    /// Move `src` into `dst`.
    #[must_use]
    pub fn mov(dst: Operand, src: Operand) -> Self {
        Self::alu(0, dst, [Some(src), None, None])
    }

    #[must_use]
    pub fn jump(target: usize) -> Self {
        Self {
            opcode: Opcode::Jump,
            target: Some(target),
            ..Self::nop()
        }
    }

    #[must_use]
    pub fn branch(cond: Operand, target: usize) -> Self {
        Self {
            opcode: Opcode::Branch,
            srcs: [Some(cond), None, None],
            target: Some(target),
            ..Self::nop()
        }
    }

    #[must_use]
    pub fn push(action: StackAction, target: usize) -> Self {
        Self {
            opcode: Opcode::Push(action),
            target: Some(target),
            ..Self::nop()
        }
    }

    #[must_use]
    pub fn pop() -> Self {
        Self {
            opcode: Opcode::Pop,
            ..Self::nop()
        }
    }

    #[must_use]
    pub fn exit() -> Self {
        Self {
            opcode: Opcode::Exit,
            dst: Some(Operand::Special(Special::Exit)),
            ..Self::nop()
        }
    }

    /// Load vector row `dst` from a buffer.
    #[must_use]
    pub fn load(space: Space, buffer: u8, dst: usize) -> Self {
        Self {
            opcode: Opcode::Transfer(TransferOp {
                space,
                direction: Direction::Load,
                indexed: false,
                retire: false,
            }),
            dst: Some(Operand::vector(dst)),
            buffer: Some(buffer),
            ..Self::nop()
        }
    }

    /// Store vector row `src` into a buffer.
    #[must_use]
    pub fn store(space: Space, buffer: u8, src: usize, retire: bool) -> Self {
        Self {
            opcode: Opcode::Transfer(TransferOp {
                space,
                direction: Direction::Store,
                indexed: false,
                retire,
            }),
            srcs: [Some(Operand::vector(src)), None, None],
            buffer: Some(buffer),
            ..Self::nop()
        }
    }

    /// Turn a transfer into a lane-indexed transfer using vector row `index`.
    #[must_use]
    pub fn indexed(mut self, index: usize) -> Self {
        if let Opcode::Transfer(ref mut op) = self.opcode {
            op.indexed = true;
            self.srcs[1] = Some(Operand::vector(index));
        }
        self
    }

    #[must_use]
    pub fn transfer(&self) -> Option<TransferOp> {
        match self.opcode {
            Opcode::Transfer(op) => Some(op),
            _ => None,
        }
    }

    /// The vector row moved by a transfer.
    #[must_use]
    pub fn transfer_row(&self) -> Option<usize> {
        let op = self.transfer()?;
        let operand = match op.direction {
            Direction::Load => self.dst,
            Direction::Store => self.srcs[0],
        };
        match operand {
            Some(Operand::Register {
                kind: Kind::Vector,
                row,
            }) => Some(row),
            _ => None,
        }
    }

    /// The per-lane index row of an indexed transfer.
    #[must_use]
    pub fn index_row(&self) -> Option<usize> {
        match (self.transfer(), self.srcs[1]) {
            (
                Some(TransferOp { indexed: true, .. }),
                Some(Operand::Register {
                    kind: Kind::Vector,
                    row,
                }),
            ) => Some(row),
            _ => None,
        }
    }

    /// Whether the instruction is enumerated over every warp of the workgroup.
    #[must_use]
    pub fn is_vector(&self) -> bool {
        match self.opcode {
            Opcode::Exit => true,
            Opcode::Alu => self
                .srcs
                .iter()
                .flatten()
                .chain(self.dst.iter())
                .any(|op| op.kind().is_per_lane()),
            _ => false,
        }
    }

    /// Source operands read through the register file pipeline ports.
    #[must_use]
    pub fn pipeline_sources(&self) -> [Option<Operand>; 3] {
        match self.opcode {
            Opcode::Alu | Opcode::Branch => self.srcs,
            _ => [None; 3],
        }
    }

    /// Destination written at writeback.
    #[must_use]
    pub fn pipeline_destination(&self) -> Option<Operand> {
        match self.opcode {
            Opcode::Alu | Opcode::Exit => self.dst,
            _ => None,
        }
    }

    #[must_use]
    pub fn writes_register(&self) -> bool {
        self.pipeline_destination().is_some()
    }

    #[must_use]
    pub fn mutates_ctrl_stack(&self) -> bool {
        matches!(self.opcode, Opcode::Push(_) | Opcode::Pop)
    }

    #[must_use]
    pub fn reads_ctrl_stack(&self) -> bool {
        matches!(self.opcode, Opcode::Pop)
    }

    #[must_use]
    pub fn is_blocking_transfer(&self) -> bool {
        self.transfer().is_some()
    }

    /// Whether fetching this instruction holds fetch for its slot.
    ///
    /// Fetch resumes once the instruction resolved the next pc.
    #[must_use]
    pub fn holds_fetch(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Jump | Opcode::Branch | Opcode::Pop | Opcode::Exit | Opcode::Transfer(_)
        )
    }

    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.opcode == Opcode::Exit
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.opcode {
            Opcode::Nop => "nop".to_string(),
            Opcode::Alu => format!("alu.{}", self.sub_opcode),
            Opcode::Jump => "jump".to_string(),
            Opcode::Branch => "branch".to_string(),
            Opcode::Push(action) => format!("push.{action}"),
            Opcode::Pop => "pop".to_string(),
            Opcode::Exit => "exit".to_string(),
            Opcode::Transfer(op) => format!(
                "{}.{}{}{}",
                match op.direction {
                    Direction::Load => "ld",
                    Direction::Store => "st",
                },
                match op.space {
                    Space::BulkMemory => "bulk",
                    Space::Scratchpad => "spad",
                },
                if op.indexed { ".idx" } else { "" },
                if op.retire { ".retire" } else { "" },
            ),
        };
        write!(f, "{name}")?;
        let operands: Vec<String> = self
            .dst
            .iter()
            .chain(self.srcs.iter().flatten())
            .map(ToString::to_string)
            .chain(self.buffer.map(|buffer| format!("buf{buffer}")))
            .chain(self.target.map(|target| format!("@{target}")))
            .collect();
        if !operands.is_empty() {
            write!(f, " {}", operands.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Instruction, Operand, Space};
    use crate::ctrl_stack::Action;
    use crate::register::{Kind, Special};

    #[test]
    fn test_vector_classification() {
        let vector = Instruction::mov(Operand::vector(0), Operand::Special(Special::LaneId));
        assert!(vector.is_vector());
        assert!(vector.writes_register());

        let scalar = Instruction::mov(Operand::scalar(1), Operand::Immediate(7));
        assert!(!scalar.is_vector());

        assert!(Instruction::exit().is_vector());
        assert!(Instruction::exit().holds_fetch());
        assert!(!Instruction::push(Action::ConditionalPush, 4).holds_fetch());
        assert!(Instruction::pop().reads_ctrl_stack());
    }

    #[test]
    fn test_transfer_rows() {
        let load = Instruction::load(Space::BulkMemory, 3, 5).indexed(6);
        assert_eq!(load.transfer_row(), Some(5));
        assert_eq!(load.index_row(), Some(6));
        assert!(load.is_blocking_transfer());
        assert!(load.pipeline_sources().iter().all(Option::is_none));

        let store = Instruction::store(Space::Scratchpad, 1, 2, true);
        assert_eq!(store.transfer_row(), Some(2));
        assert_eq!(store.index_row(), None);
        assert_eq!(store.to_string(), "st.spad.retire v2, buf1");
    }

    #[test]
    fn test_operand_resolution() {
        let reg = Operand::scalar(3).resolve(7, 1);
        assert_eq!((reg.kind, reg.row, reg.col, reg.slot), (Kind::Scalar, 3, 0, 1));
        let reg = Operand::vector(3).resolve(7, 1);
        assert_eq!(reg.col, 7);
        let reg = Operand::Immediate(9).resolve(7, 1);
        assert_eq!((reg.kind, reg.row), (Kind::Immediate, 9));
    }
}
